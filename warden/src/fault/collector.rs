// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds the crash report in a forked child.
//!
//! Everything the report needs (symbolization, formatting, file IO, the notice) allocates or
//! takes locks, none of which is allowed in a signal handler. The child is a copy of the
//! faulting process taken at the fault, so it can do all of that, and its stack still holds the
//! faulting thread's frames. The parent only forks, polls a status pipe and reaps.

use super::handler::FaultContext;
use super::sig_info::fault_details;
use super::state::FaultEvent;
use crate::report::stacktrace;
use crate::shared::configuration::StacktraceCollection;
use libc::{siginfo_t, ucontext_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use thiserror::Error;
use warden_common::timeout::TimeoutManager;
use warden_common::unix_utils::{
    alt_fork, reap_child, terminate, wait_for_readable, write_stderr, write_stderr_number,
    PollError,
};

const STATUS_WRITTEN: u8 = 1;
const STATUS_FAILED: u8 = 0;

#[derive(Debug, Error)]
pub(crate) enum CollectorError {
    #[error("Failed to fork collector process (error code: {0})")]
    ForkFailed(i32),
    #[error("Collector did not report back in time")]
    Timeout,
    #[error("Collector failed to write the report")]
    ReportFailed,
    #[error("Failed to wait for the collector: {0}")]
    Poll(#[from] PollError),
}

pub(crate) struct Collector {
    pid: Pid,
    status_fd: RawFd,
}

impl Collector {
    pub(crate) fn spawn(
        context: &FaultContext,
        event: &FaultEvent,
        signum: i32,
        sig_info: *const siginfo_t,
        ucontext: *const ucontext_t,
    ) -> Result<Self, CollectorError> {
        let (read_end, write_end) = &context.status_pipe;
        let status_fd = read_end.as_raw_fd();
        let fork_result = alt_fork();
        match fork_result {
            // Child (does not return from here)
            0 => run_collector_child(
                context,
                event,
                signum,
                sig_info,
                ucontext,
                status_fd,
                write_end.as_raw_fd(),
            ),
            pid if pid > 0 => {
                // Without our copy of the write end, a collector that dies reads as EOF.
                // The process exits after collecting, so the context never closes it again.
                // SAFETY: plain close(2).
                unsafe { libc::close(write_end.as_raw_fd()) };
                Ok(Self {
                    pid: Pid::from_raw(pid),
                    status_fd,
                })
            }
            code => Err(CollectorError::ForkFailed(code)),
        }
    }

    /// Waits up to `report_timeout` for the report to be written, then up to `notice_timeout`
    /// for the collector to finish showing the notice. The collector is killed if it overstays.
    pub(crate) fn finish(
        self,
        report_timeout: Duration,
        notice_timeout: Duration,
    ) -> Result<(), CollectorError> {
        let result = self.read_status(&TimeoutManager::new(report_timeout));
        let exit_timeout = if result.is_ok() {
            notice_timeout
        } else {
            Duration::ZERO
        };
        self.reap(&TimeoutManager::new(exit_timeout));
        result
    }

    fn read_status(&self, timeout_manager: &TimeoutManager) -> Result<(), CollectorError> {
        if !wait_for_readable(self.status_fd, timeout_manager)? {
            return Err(CollectorError::Timeout);
        }
        let mut status = STATUS_FAILED;
        loop {
            // SAFETY: reads one byte into a stack variable.
            let n = unsafe { libc::read(self.status_fd, (&mut status as *mut u8).cast(), 1) };
            if n < 0 && nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            // EOF: the collector died before reporting.
            if n == 1 && status == STATUS_WRITTEN {
                return Ok(());
            }
            return Err(CollectorError::ReportFailed);
        }
    }

    fn reap(&self, timeout_manager: &TimeoutManager) {
        if reap_child(self.pid, timeout_manager).is_ok() {
            return;
        }
        let _ = signal::kill(self.pid, signal::Signal::SIGKILL);
        let _ = reap_child(
            self.pid,
            &TimeoutManager::new(TimeoutManager::MINIMUM_REAP_TIME),
        );
    }
}

/// Forks a collector and waits for it. Returns whether the report was written.
///
/// Called from the signal handler.
pub(crate) fn collect_report(
    context: &FaultContext,
    event: &FaultEvent,
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> bool {
    let result = Collector::spawn(context, event, signum, sig_info, ucontext).and_then(|collector| {
        collector.finish(
            context.config.report_timeout(),
            context.config.notice_timeout(),
        )
    });
    match result {
        Ok(()) => true,
        Err(CollectorError::ForkFailed(code)) => {
            write_stderr(b"warden: failed to fork the crash collector: ");
            write_stderr_number(code as i64);
            write_stderr(b"\n");
            false
        }
        Err(CollectorError::Timeout) => {
            write_stderr(b"warden: timed out writing the crash report\n");
            false
        }
        Err(_) => {
            write_stderr(b"warden: failed to write the crash report\n");
            false
        }
    }
}

fn run_collector_child(
    context: &FaultContext,
    event: &FaultEvent,
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
    read_fd: RawFd,
    write_fd: RawFd,
) -> ! {
    // Another thread of the parent may have held the subscriber's locks at the fork.
    let _no_logging = tracing::dispatcher::set_default(&tracing::Dispatch::none());

    // SAFETY: plain close(2) on our copy of the read end.
    unsafe { libc::close(read_fd) };
    // Writing to the status pipe after the parent gave up must not kill us.
    let _ = unsafe {
        signal::sigaction(
            signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )
    };

    // SAFETY: the pointers are the ones handed to the signal handler, and this process is a
    // copy of the faulting one.
    let details = unsafe { fault_details(signum, sig_info, ucontext) };
    let reporter = &context.reporter;
    let frames = match reporter.config().resolve_frames() {
        StacktraceCollection::Disabled => vec![],
        // SAFETY: single threaded after the fork.
        _ => unsafe {
            stacktrace::capture_unsynchronized(
                details.instruction_pointer,
                reporter.config().max_frames(),
            )
        },
    };
    let report = reporter.build_report_with_frames(event, Some(&details), &frames);

    let status = match reporter.write_report(&report) {
        Ok(()) => {
            write_stderr(
                format!("warden: crash report written to {}\n", report.path.display()).as_bytes(),
            );
            STATUS_WRITTEN
        }
        Err(e) => {
            write_stderr(format!("warden: {e}\n").as_bytes());
            STATUS_FAILED
        }
    };
    // SAFETY: writes one byte from a stack variable.
    unsafe { libc::write(write_fd, (&status as *const u8).cast(), 1) };

    if status == STATUS_WRITTEN {
        reporter.notify_user(&report.summary, context.config.notice_timeout());
    }
    terminate(0)
}
