// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault interception and escalation.
//!
//! Every OS fault notification is classified ([`classifier`]) and fed to the escalation
//! machine ([`state`]). Escalating faults turn into graceful shutdown requests, delivered to
//! the host's [`ShutdownSink`] on a watchdog thread, until the bound is reached and the process
//! terminates. A fatal fault produces a crash report and terminates the process right away.
//!
//! Exit codes: [`EXIT_ESCALATED`] after too many termination requests,
//! [`EXIT_FATAL_REPORT_WRITTEN`] and [`EXIT_FATAL_REPORT_FAILED`] after a fatal fault.
//!
//! [`EXIT_ESCALATED`]: crate::shared::constants::EXIT_ESCALATED
//! [`EXIT_FATAL_REPORT_WRITTEN`]: crate::shared::constants::EXIT_FATAL_REPORT_WRITTEN
//! [`EXIT_FATAL_REPORT_FAILED`]: crate::shared::constants::EXIT_FATAL_REPORT_FAILED

pub mod classifier;
mod handler;
pub mod state;
mod watchdog;

#[cfg(unix)]
mod collector;
#[cfg(unix)]
mod crash_handler;
#[cfg(unix)]
pub mod sig_info;
#[cfg(unix)]
mod signal_handler_manager;

#[cfg(windows)]
mod exception_filter;

pub use classifier::{classify, label, FaultId, Severity};
pub use handler::{Collaborators, FaultHandler};
pub use state::{EscalationMachine, FaultEvent, Phase, TerminationCause, Transition};
pub use watchdog::{ShutdownRequest, ShutdownSink};
