// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};
use warden::shared::constants::{
    EXIT_ESCALATED, EXIT_FATAL_REPORT_FAILED, EXIT_FATAL_REPORT_WRITTEN, REPORT_END,
    SECTION_BASIC_INFO, SECTION_CONTEXT, SECTION_ENVIRONMENT, SECTION_LOG_TAIL, SECTION_MEMORY,
    SECTION_MODULES, SECTION_PROCESSES, SECTION_STACKTRACE, SECTION_SUMMARY,
};

const TESTEE: &str = env!("CARGO_BIN_EXE_warden-testee");

fn unique(name: &str) -> String {
    format!("wft-{name}-{}", std::process::id())
}

fn run_testee(args: &[&str]) -> Output {
    Command::new(TESTEE)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn crash(kind: &str, report: &Path) -> Output {
    run_testee(&["crash", kind, report.to_str().unwrap()])
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_segv_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("testee.crash.txt");
    let output = crash("segv", &report);
    assert_eq!(
        output.status.code(),
        Some(EXIT_FATAL_REPORT_WRITTEN),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let text = std::fs::read_to_string(&report).unwrap();
    let positions: Vec<usize> = [
        SECTION_BASIC_INFO,
        SECTION_SUMMARY,
        SECTION_CONTEXT,
        SECTION_STACKTRACE,
        SECTION_MEMORY,
        SECTION_ENVIRONMENT,
        SECTION_MODULES,
        SECTION_PROCESSES,
        SECTION_LOG_TAIL,
        REPORT_END,
    ]
    .iter()
    .map(|section| text.find(section).unwrap())
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    assert!(text.contains("SIGSEGV"));
    // The child writes through 0x10, an unmapped page, rather than null.
    assert!(text.contains("(SEGV_MAPERR) at address 0x10"), "{text}");
    assert!(text.contains("crash"));
    // Logged by the child right before faulting.
    assert!(text.contains("About to crash"));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_every_fatal_kind_terminates_with_report() {
    for kind in ["abort", "fpe", "ill", "bus"] {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join(format!("{kind}.crash.txt"));
        let output = crash(kind, &report);
        assert_eq!(
            output.status.code(),
            Some(EXIT_FATAL_REPORT_WRITTEN),
            "{kind}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(report.exists(), "{kind}");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_unwritable_report_still_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("missing-dir").join("testee.crash.txt");
    let output = crash("segv", &report);
    assert_eq!(output.status.code(), Some(EXIT_FATAL_REPORT_FAILED));
    assert!(!report.exists());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_graceful_requests_below_the_bound() {
    let output = run_testee(&["escalate", "4"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 4);
    for (i, line) in lines.iter().enumerate() {
        assert!(line.starts_with("shutdown-request SIGTERM"), "{line}");
        assert!(line.ends_with(&format!("{}/5", i + 1)), "{line}");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_fifth_request_terminates_and_releases_instance() {
    let id = unique("escalate");
    let output = run_testee(&["escalate", "5", &id]);
    assert_eq!(output.status.code(), Some(EXIT_ESCALATED));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 4);

    let retry = run_testee(&["try-instance", &id]);
    assert_eq!(retry.status.code(), Some(0));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_releases_instance() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("locked.crash.txt");
    let id = unique("crash");
    let output = run_testee(&["crash", "abort", report.to_str().unwrap(), &id]);
    assert_eq!(output.status.code(), Some(EXIT_FATAL_REPORT_WRITTEN));

    let retry = run_testee(&["try-instance", &id]);
    assert_eq!(retry.status.code(), Some(0));
}
