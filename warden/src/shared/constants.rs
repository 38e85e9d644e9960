// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Number of same-kind escalating faults (interrupt, hang-up, termination request) after which
/// the graceful shutdown is abandoned and the process terminates.
pub const MAX_ATTEMPTS: u8 = 5;

/// Process exit codes, one per way a fault can end the process.
pub const EXIT_ESCALATED: i32 = 3;
pub const EXIT_FATAL_REPORT_WRITTEN: i32 = 4;
pub const EXIT_FATAL_REPORT_FAILED: i32 = 5;

/// The crash report is written next to the executable with this extension,
/// e.g. `/opt/game/bin/game.crash.txt` or `C:\Game\game.crash.txt`.
pub const REPORT_EXTENSION: &str = "crash.txt";

pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_NOTICE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_EXIT_WAIT: Duration = Duration::from_millis(100);
pub const DEFAULT_LOG_TAIL_LINES: usize = 50;
pub const DEFAULT_MAX_FRAMES: usize = 128;

pub const LOG_RING_SLOTS: usize = 256;
pub const LOG_RING_LINE_BYTES: usize = 512;

pub const NOTICE_TITLE: &str = "Application crashed";

// Crash report sections, in the order they appear in the file.
pub const SECTION_BASIC_INFO: &str = "=== Basic information ===";
pub const SECTION_SUMMARY: &str = "=== Summary ===";
pub const SECTION_CONTEXT: &str = "=== Registers ===";
pub const SECTION_STACKTRACE: &str = "=== Call stack ===";
pub const SECTION_MEMORY: &str = "=== Memory statistics ===";
pub const SECTION_ENVIRONMENT: &str = "=== Environment variables ===";
pub const SECTION_MODULES: &str = "=== Loaded modules ===";
pub const SECTION_PROCESSES: &str = "=== Process list ===";
pub const SECTION_LOG_TAIL: &str = "=== Log tail ===";
pub const REPORT_END: &str = "=== End of report ===";

// Environment overrides for the fault handler configuration.
pub const ENV_HEADLESS: &str = "WARDEN_HEADLESS";
pub const ENV_REPORT_PATH: &str = "WARDEN_REPORT_PATH";
pub const ENV_STACKTRACE: &str = "WARDEN_STACKTRACE";
pub const ENV_MAX_ATTEMPTS: &str = "WARDEN_MAX_ATTEMPTS";
