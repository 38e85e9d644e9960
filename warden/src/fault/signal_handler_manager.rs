// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::handle_posix_sigaction;
use crate::shared::configuration::FaultHandlerConfig;
use crate::shared::constants::EXIT_FATAL_REPORT_FAILED;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ, SS_DISABLE,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use warden_common::unix_utils::{terminate, write_stderr, write_stderr_number};

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

/// Registers the fault handler for every signal in `config.signals()`, remembering the
/// previous dispositions for chaining and for [`restore_handlers`].
///
/// SAFETY:
///     Not reentrant. Registration and restoration are serialized by the caller.
/// ATOMICITY:
///     If a signal arrives between installing a handler and storing the previous one, the
///     handler cannot chain and ends the process.
pub(crate) fn register_handlers(config: &FaultHandlerConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register fault handlers"
    );

    let result = register_all(config);
    INIT_FINISHED.store(true, SeqCst);
    result
}

fn register_all(config: &FaultHandlerConfig) -> anyhow::Result<()> {
    for signum in config.signals() {
        anyhow::ensure!(
            *signum > 0 && *signum < MAX_SIGNALS as i32,
            "Signal number {signum} out of range"
        );
    }

    if config.create_alt_stack() {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack()? };
    }

    let mut errors = vec![];
    for signum in config.signals() {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum, config) } {
            // SAFETY: `INIT_STARTED` is true and `INIT_FINISHED` false, so nothing else reads
            // or writes `HANDLERS`.
            Ok(handler) => unsafe { HANDLERS[index] = Some(handler) },
            Err(e) => errors.push(format!("Unable to register handler for {signum}: {e}")),
        };
    }
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

/// Puts back the dispositions saved by [`register_handlers`]. A no-op if nothing was
/// registered.
pub(crate) fn restore_handlers() -> anyhow::Result<()> {
    if !INIT_FINISHED.load(SeqCst) {
        return Ok(());
    }
    let mut errors = vec![];
    for index in 0..MAX_SIGNALS {
        // SAFETY: registration finished and the caller serializes restoration with it.
        if let Some((signal, sigaction)) = unsafe { HANDLERS[index] } {
            // SAFETY: `sigaction` is the disposition the OS handed back at registration.
            if let Err(e) = unsafe { signal::sigaction(signal, &sigaction) } {
                errors.push(format!("Unable to restore handler for {signal}: {e}"));
            }
        }
    }
    // Chaining reads `HANDLERS` while `INIT_FINISHED` is set; clear the flag first.
    INIT_FINISHED.store(false, SeqCst);
    for index in 0..MAX_SIGNALS {
        // SAFETY: as above.
        unsafe { HANDLERS[index] = None };
    }
    INIT_STARTED.store(false, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors restoring signal handlers {errors:?}"
    );
    Ok(())
}

/// Hands the signal to whatever was installed before us. Used once the handler is torn down
/// while a signal was in flight.
/// If we run into an unexpected condition we just `_exit` to quit the program without re-raising
/// `SIGABRT`.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if !INIT_FINISHED.load(SeqCst) {
        // Already restored: the default disposition is back in place, deliver it again.
        if signum > 0 && signum < MAX_SIGNALS as i32 {
            unsafe { libc::raise(signum) };
            return;
        }
        write_stderr(b"warden: unexpected signal during handler setup, exiting\n");
        terminate(EXIT_FATAL_REPORT_FAILED)
    }
    if signum <= 0 || signum >= MAX_SIGNALS as i32 {
        write_stderr(b"warden: unexpected signal number ");
        write_stderr_number(signum as i64);
        write_stderr(b", cannot chain, exiting\n");
        terminate(EXIT_FATAL_REPORT_FAILED)
    }
    // SAFETY: All accesses to `HANDLERS` are guarded by `INIT_STARTED` and `INIT_FINISHED`.
    if let Some((signal, sigaction)) = &mut unsafe { HANDLERS[signum as usize] } {
        // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
        // https://stackoverflow.com/questions/6015498/executing-default-signal-handler
        match sigaction.handler() {
            SigHandler::SigDfl => {
                // Restore the default and raise again so that the OS acts on it (core dump,
                // termination).
                unsafe { signal::sigaction(*signal, sigaction) }
                    .unwrap_or_else(|_| terminate(EXIT_FATAL_REPORT_FAILED));
                unsafe { libc::raise(signum) };
            }
            SigHandler::SigIgn => (),
            SigHandler::Handler(f) => f(signum),
            SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
        }
    } else {
        write_stderr(b"warden: missing chain handler for signal ");
        write_stderr_number(signum as i64);
        write_stderr(b", exiting\n");
        terminate(EXIT_FATAL_REPORT_FAILED)
    }
}

/// Allocates a signal altstack, and puts a guard page at the end. Keeps an existing altstack
/// that is already large enough.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The greater of 16 pages or SIGSTKSZ. Symbolizing and formatting a report needs far more
    // than the default 8KB.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);

    let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
    if unsafe { sigaltstack(ptr::null(), &mut current) } == 0
        && current.ss_flags & SS_DISABLE == 0
        && current.ss_size >= sigalstack_base_size
    {
        return Ok(());
    }

    let stackp = unsafe {
        mmap(
            ptr::null_mut(),
            sigalstack_base_size + page_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANON,
            -1,
            0,
        )
    };
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = unsafe { libc::mprotect(stackp, page_size, PROT_NONE) };
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = unsafe { stackp.add(page_size) };

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = unsafe { sigaltstack(&stack, ptr::null_mut()) };
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    config: &FaultHandlerConfig,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal::Signal::try_from(signum)?;

    // Running on the altstack is what lets a stack overflow produce a report at all.
    // Some runtimes install their own altstack and expect it to be used as is; `use_alt_stack`
    // without `create_alt_stack` covers them.
    let extra_saflags = if config.use_alt_stack() {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    // SA_NODEFER: a fault raised while handling a fault is delivered and counted instead of
    // being blocked until the handler returns.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = unsafe { signal::sigaction(signal_type, &sig_action)? };
    Ok((signal_type, old_handler))
}

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(super::MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }
}
