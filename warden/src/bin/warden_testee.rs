// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small child program driven by the integration tests.
//!
//! ```text
//! warden-testee echo
//! warden-testee exit <code>
//! warden-testee ignore-term
//! warden-testee sleep <ms>
//! warden-testee try-instance <id>
//! warden-testee hold-instance <id>
//! warden-testee crash <segv|abort|fpe|ill|bus> <report-path> [instance-id]
//! warden-testee escalate <count> [instance-id]
//! ```

use anyhow::Context;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use warden::fault::{Collaborators, FaultHandler, ShutdownRequest};
use warden::instance::{AcquireOutcome, InstanceGuard};
use warden::shared::configuration::{FaultHandlerConfig, StacktraceCollection};
use warden::shared::log_ring::LogRing;

// Exit code of `try-instance` when another instance holds the lock.
const ALREADY_RUNNING: i32 = 2;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let command = args.next().context("Missing command")?;
    match command.as_str() {
        "echo" => {
            let mut stdin = io::stdin().lock();
            let mut stdout = io::stdout().lock();
            let mut buf = [0u8; 8192];
            loop {
                let n = stdin.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
        }
        "exit" => {
            let code: i32 = args.next().context("Missing exit code")?.parse()?;
            std::process::exit(code);
        }
        "ignore-term" => {
            ignore_termination()?;
            say("ready")?;
            loop {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        "sleep" => {
            let ms: u64 = args.next().context("Missing duration")?.parse()?;
            std::thread::sleep(Duration::from_millis(ms));
        }
        "try-instance" => {
            let id = args.next().context("Missing instance id")?;
            match InstanceGuard::acquire(&id)? {
                AcquireOutcome::Acquired(_guard) => {}
                AcquireOutcome::AlreadyRunning => std::process::exit(ALREADY_RUNNING),
            }
        }
        "hold-instance" => {
            let id = args.next().context("Missing instance id")?;
            match InstanceGuard::acquire(&id)? {
                AcquireOutcome::Acquired(guard) => {
                    say("acquired")?;
                    // Held until the test closes our stdin.
                    io::copy(&mut io::stdin(), &mut io::sink())?;
                    drop(guard);
                }
                AcquireOutcome::AlreadyRunning => say("already-running")?,
            }
        }
        "crash" => {
            let kind = args.next().context("Missing crash kind")?;
            let report_path = PathBuf::from(args.next().context("Missing report path")?);
            let instance = acquire_optional(args.next())?;
            crash(&kind, report_path, instance)?;
        }
        "escalate" => {
            let count: u32 = args.next().context("Missing count")?.parse()?;
            let instance = acquire_optional(args.next())?;
            escalate(count, instance)?;
        }
        other => anyhow::bail!("Unknown command {other:?}"),
    }
    Ok(())
}

fn say(line: &str) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn acquire_optional(id: Option<String>) -> anyhow::Result<Option<InstanceGuard>> {
    let Some(id) = id else {
        return Ok(None);
    };
    match InstanceGuard::acquire(&id)? {
        AcquireOutcome::Acquired(guard) => Ok(Some(guard)),
        AcquireOutcome::AlreadyRunning => anyhow::bail!("Instance {id} is already running"),
    }
}

fn install(
    report_path: Option<PathBuf>,
    sink: std::sync::mpsc::Sender<ShutdownRequest>,
    instance: Option<&InstanceGuard>,
) -> anyhow::Result<FaultHandler> {
    let ring = LogRing::default();
    warden::shared::logging::init_logging(Some(&ring))?;

    let mut config = FaultHandlerConfig::default();
    config.reporter_mut().set_headless(true);
    config.reporter_mut().set_show_notice(false);
    config
        .reporter_mut()
        .set_resolve_frames(StacktraceCollection::WithSymbols);
    config.reporter_mut().set_report_path(report_path)?;
    config
        .reporter_mut()
        .set_command_line(std::env::args().collect());
    config.set_timeouts(Duration::from_secs(10), Duration::from_secs(1));

    let mut collaborators = Collaborators::new(sink).with_log_ring(ring);
    if let Some(guard) = instance {
        collaborators = collaborators.with_instance_lock(guard.termination_handle());
    }
    FaultHandler::install(config, collaborators)
}

fn crash(
    kind: &str,
    report_path: PathBuf,
    instance: Option<InstanceGuard>,
) -> anyhow::Result<()> {
    let (tx, _rx) = std::sync::mpsc::channel();
    let _handler = install(Some(report_path), tx, instance.as_ref())?;
    tracing::info!(kind, "About to crash");
    say("crashing")?;
    raise_fault(kind)?;
    anyhow::bail!("Survived a {kind} fault")
}

// Unmapped, and not null: debug builds check null dereferences and would abort instead.
const FAULT_ADDRESS: usize = 0x10;

#[inline(never)]
unsafe fn deref_ptr(p: *mut u8) {
    unsafe { *std::hint::black_box(p) = std::hint::black_box(1) };
}

#[cfg(unix)]
fn raise_fault(kind: &str) -> anyhow::Result<()> {
    let signum = match kind {
        // SAFETY: crashing is the point.
        "segv" => unsafe {
            deref_ptr(FAULT_ADDRESS as *mut u8);
            return Ok(());
        },
        "abort" => std::process::abort(),
        "fpe" => libc::SIGFPE,
        "ill" => libc::SIGILL,
        "bus" => libc::SIGBUS,
        other => anyhow::bail!("Unknown crash kind {other:?}"),
    };
    // SAFETY: no preconditions.
    unsafe { libc::raise(signum) };
    Ok(())
}

#[cfg(windows)]
fn raise_fault(kind: &str) -> anyhow::Result<()> {
    use warden::fault::classifier::{
        EXCEPTION_ILLEGAL_INSTRUCTION, EXCEPTION_INT_DIVIDE_BY_ZERO, EXCEPTION_IN_PAGE_ERROR,
        STATUS_STACK_BUFFER_OVERRUN,
    };
    use windows::Win32::System::Diagnostics::Debug::RaiseException;

    let code = match kind {
        // SAFETY: crashing is the point.
        "segv" => unsafe {
            deref_ptr(FAULT_ADDRESS as *mut u8);
            return Ok(());
        },
        "abort" => STATUS_STACK_BUFFER_OVERRUN,
        "fpe" => EXCEPTION_INT_DIVIDE_BY_ZERO,
        "ill" => EXCEPTION_ILLEGAL_INSTRUCTION,
        "bus" => EXCEPTION_IN_PAGE_ERROR,
        other => anyhow::bail!("Unknown crash kind {other:?}"),
    };
    // SAFETY: no preconditions.
    unsafe { RaiseException(code, 0, None) };
    Ok(())
}

/// Sends ourselves `count` termination requests, printing each graceful request as it arrives.
/// The fifth one terminates the process.
fn escalate(count: u32, instance: Option<InstanceGuard>) -> anyhow::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let handler = install(None, tx, instance.as_ref())?;
    for _ in 0..count {
        request_termination()?;
        let request = rx
            .recv_timeout(Duration::from_secs(5))
            .context("No shutdown request delivered")?;
        say(&format!(
            "shutdown-request {} {}/{}",
            request.label, request.attempt, request.max_attempts
        ))?;
    }
    drop(instance);
    handler.teardown()
}

#[cfg(unix)]
fn request_termination() -> anyhow::Result<()> {
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM)?;
    Ok(())
}

#[cfg(windows)]
fn request_termination() -> anyhow::Result<()> {
    use warden::fault::classifier::DBG_CONTROL_C;
    use windows::Win32::System::Diagnostics::Debug::RaiseException;
    // Handled by the exception filter like a console interrupt, without disturbing the other
    // processes attached to the console.
    // SAFETY: no preconditions.
    unsafe { RaiseException(DBG_CONTROL_C, 0, None) };
    Ok(())
}

#[cfg(unix)]
fn ignore_termination() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe { sigaction(Signal::SIGTERM, &ignore) }?;
    Ok(())
}

#[cfg(windows)]
fn ignore_termination() -> anyhow::Result<()> {
    Ok(())
}
