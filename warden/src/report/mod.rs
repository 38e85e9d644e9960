// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-mortem crash reports: a plain text file with the fault details, the symbolized call
//! stack, and snapshots of the process and machine state.

mod crash_report;
mod notice;
mod reporter;
pub mod stacktrace;
mod system;

pub use crash_report::{CrashReport, FaultDetails, ReportFrame, SystemSummary};
pub use notice::{is_debugger_attached, is_headless};
pub use reporter::{CrashReporter, ReportWriteError};
pub use stacktrace::RawFrame;
