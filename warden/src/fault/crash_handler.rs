// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::classifier::{FaultId, Severity};
use super::collector;
use super::handler::context;
use super::signal_handler_manager::chain_signal_handler;
use super::state::{TerminationCause, Transition};
use crate::shared::constants::{
    EXIT_ESCALATED, EXIT_FATAL_REPORT_FAILED, EXIT_FATAL_REPORT_WRITTEN,
};
use libc::{c_void, siginfo_t, ucontext_t};
use warden_common::unix_utils::{terminate, write_stderr, write_stderr_number};

// This file makes use of the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - _exit
// - clock_gettime
// - close
// - fork (on MacOS; Linux calls `fork()` directly as syscall)
// - kill
// - poll
// - raise
// - read
// - sem_unlink
// - sigaction
// - waitpid
// - write
// Anything that allocates runs in the forked collector, never here.

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // Handling the signal must not change errno for the interrupted code.
    let saved_errno = errno::errno();
    handle_posix_signal_impl(signum, sig_info, ucontext);
    errno::set_errno(saved_errno);
}

fn handle_posix_signal_impl(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let Some(context) = context() else {
        // Torn down while this signal was in flight.
        // SAFETY: the pointers come straight from the kernel.
        unsafe { chain_signal_handler(signum, sig_info, ucontext) };
        return;
    };

    let (event, transition) = context.machine.on_fault(FaultId::Signal(signum));
    match transition {
        Transition::Ignored => {}
        Transition::RequestShutdown { attempt } => {
            if !context.notifier.notify(event.id.slot(), attempt) {
                write_stderr(b"warden: unable to queue a shutdown request\n");
            }
        }
        Transition::Terminate(TerminationCause::Escalated) => {
            context.release_instance_lock();
            write_stderr(b"warden: termination requested ");
            write_stderr_number(event.occurrence as i64);
            write_stderr(b" times, exiting now\n");
            terminate(EXIT_ESCALATED)
        }
        Transition::Terminate(TerminationCause::Fatal) => {
            context.release_instance_lock();
            write_stderr(b"warden: fatal signal ");
            write_stderr_number(signum as i64);
            write_stderr(b", collecting a crash report\n");
            let written = collector::collect_report(
                context,
                &event,
                signum,
                sig_info,
                ucontext as *const ucontext_t,
            );
            terminate(if written {
                EXIT_FATAL_REPORT_WRITTEN
            } else {
                EXIT_FATAL_REPORT_FAILED
            })
        }
        Transition::AlreadyTerminating(Severity::Fatal) => {
            // A fault while reporting a fault. Whoever owns the termination may be wedged.
            write_stderr(b"warden: fatal signal ");
            write_stderr_number(signum as i64);
            write_stderr(b" during termination, exiting without a report\n");
            terminate(EXIT_FATAL_REPORT_FAILED)
        }
        Transition::AlreadyTerminating(_) => {}
    }
}
