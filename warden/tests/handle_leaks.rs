// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]

use std::time::Duration;
use warden::process::{ProcessExecutor, TrustPolicy};
use warden::shared::configuration::ExecutorConfig;

const TESTEE: &str = env!("CARGO_BIN_EXE_warden-testee");

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

// Alone in this file: other tests would open descriptors concurrently.
#[test]
#[cfg_attr(miri, ignore)]
fn test_finished_children_release_every_handle() {
    let config = ExecutorConfig::new(Duration::from_secs(2), Duration::from_millis(100), None)
        .unwrap();
    let mut executor = ProcessExecutor::new(config, TrustPolicy::permissive());
    executor.spawn(TESTEE, &["echo"]).unwrap();
    executor.finish();
    let baseline = open_descriptors();

    for round in 0..20 {
        executor.spawn(TESTEE, &["echo"]).unwrap();
        let line = format!("round {round}\n");
        executor.write(line.as_bytes()).unwrap();
        let mut out = Vec::new();
        executor.read_to_end(&mut out).unwrap();
        assert_eq!(out, line.as_bytes());
        assert!(executor.finish().unwrap().success());
    }
    // A failed spawn must not leak either.
    assert!(executor.spawn("/nonexistent/warden-testee", &["echo"]).is_err());

    drop(executor);
    assert_eq!(open_descriptors(), baseline);
}
