// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Low-level POSIX helpers. Everything in `stderr` and `process::terminate` is async-signal
//! safe and may be called from a signal handler; the rest must run in normal context.

#![cfg(unix)]

mod errors;
mod execve;
mod fork;
mod process;
mod stderr;

pub use errors::{PollError, ReapError};
pub use execve::{PreparedExecve, PreparedExecveError};
pub use fork::{alt_fork, is_being_traced};
pub use process::{reap_child, terminate, wait_for_readable};
pub use stderr::{write_decimal, write_stderr, write_stderr_number};
