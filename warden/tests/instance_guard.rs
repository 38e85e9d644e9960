// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use warden::instance::{AcquireOutcome, InstanceGuard};

const TESTEE: &str = env!("CARGO_BIN_EXE_warden-testee");
const ALREADY_RUNNING: i32 = 2;

fn unique(name: &str) -> String {
    format!("wit-{name}-{}", std::process::id())
}

fn try_instance(id: &str) -> i32 {
    Command::new(TESTEE)
        .args(["try-instance", id])
        .status()
        .unwrap()
        .code()
        .unwrap()
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_second_process_is_refused() {
    let id = unique("refused");
    let mut holder = Command::new(TESTEE)
        .args(["hold-instance", &id])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdout = BufReader::new(holder.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    assert_eq!(line.trim(), "acquired");

    assert_eq!(try_instance(&id), ALREADY_RUNNING);
    assert!(matches!(
        InstanceGuard::acquire(&id).unwrap(),
        AcquireOutcome::AlreadyRunning
    ));

    // Closing stdin lets the holder release and exit.
    drop(holder.stdin.take());
    assert!(holder.wait().unwrap().success());
    assert_eq!(try_instance(&id), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_lock_held_in_process_is_seen_by_children() {
    let id = unique("in-process");
    let AcquireOutcome::Acquired(mut guard) = InstanceGuard::acquire(&id).unwrap() else {
        panic!("lock unexpectedly held");
    };
    assert_eq!(try_instance(&id), ALREADY_RUNNING);
    guard.release().unwrap();
    assert_eq!(try_instance(&id), 0);
}
