// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windows fault callbacks: the process wide unhandled exception filter and the console
//! control handler.

use super::classifier::{
    label, FaultId, Severity, EXCEPTION_ACCESS_VIOLATION, EXCEPTION_IN_PAGE_ERROR,
};
use super::handler::{context, FaultContext};
use super::state::{FaultEvent, TerminationCause, Transition};
use crate::report::FaultDetails;
use crate::shared::constants::{
    EXIT_ESCALATED, EXIT_FATAL_REPORT_FAILED, EXIT_FATAL_REPORT_WRITTEN,
};
use std::sync::Mutex;
use warden_common::MutexExt;
use windows::Win32::Foundation::{BOOL, FALSE, TRUE};
use windows::Win32::System::Console::SetConsoleCtrlHandler;
use windows::Win32::System::Diagnostics::Debug::{
    SetUnhandledExceptionFilter, EXCEPTION_POINTERS, LPTOP_LEVEL_EXCEPTION_FILTER,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, SetThreadStackGuarantee, TerminateProcess,
};

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;

// Stack kept in reserve for handling a stack overflow on the installing thread.
const STACK_GUARANTEE: u32 = 64 * 1024;

static PREVIOUS_FILTER: Mutex<LPTOP_LEVEL_EXCEPTION_FILTER> = Mutex::new(None);

pub(crate) fn install() -> anyhow::Result<()> {
    let mut guarantee = STACK_GUARANTEE;
    // SAFETY: `guarantee` outlives the call.
    if let Err(e) = unsafe { SetThreadStackGuarantee(&mut guarantee) } {
        tracing::debug!(error = %e, "Unable to reserve stack for stack overflow handling");
    }
    // SAFETY: `exception_filter` has the signature the OS expects.
    let previous = unsafe { SetUnhandledExceptionFilter(Some(exception_filter)) };
    *PREVIOUS_FILTER.lock_or_panic() = previous;
    // SAFETY: as above, for `console_handler`.
    unsafe { SetConsoleCtrlHandler(Some(console_handler), true) }?;
    Ok(())
}

pub(crate) fn uninstall() -> anyhow::Result<()> {
    let previous = PREVIOUS_FILTER.lock_or_panic().take();
    // SAFETY: `previous` was handed to us by the OS.
    unsafe { SetUnhandledExceptionFilter(previous) };
    // SAFETY: removes the handler added by `install`.
    unsafe { SetConsoleCtrlHandler(Some(console_handler), false) }?;
    Ok(())
}

unsafe extern "system" fn exception_filter(info: *const EXCEPTION_POINTERS) -> i32 {
    let Some(context) = context() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    // SAFETY: the OS hands us valid exception pointers.
    let record = unsafe { info.as_ref().and_then(|info| info.ExceptionRecord.as_ref()) };
    let Some(record) = record else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let code = record.ExceptionCode.0 as u32;

    let (event, transition) = context.machine.on_fault(FaultId::Exception(code));
    match transition {
        Transition::Ignored => EXCEPTION_CONTINUE_SEARCH,
        Transition::RequestShutdown { attempt } => {
            context.notifier.notify(event.id.slot(), attempt);
            EXCEPTION_CONTINUE_EXECUTION
        }
        Transition::Terminate(TerminationCause::Escalated) => {
            context.release_instance_lock();
            exit_process(EXIT_ESCALATED)
        }
        Transition::Terminate(TerminationCause::Fatal) => {
            context.release_instance_lock();
            // SAFETY: as above.
            let details = unsafe { exception_details(info) };
            let written = write_report(context, &event, &details);
            exit_process(if written {
                EXIT_FATAL_REPORT_WRITTEN
            } else {
                EXIT_FATAL_REPORT_FAILED
            })
        }
        Transition::AlreadyTerminating(Severity::Fatal) => exit_process(EXIT_FATAL_REPORT_FAILED),
        Transition::AlreadyTerminating(_) => EXCEPTION_CONTINUE_SEARCH,
    }
}

unsafe extern "system" fn console_handler(ctrl_type: u32) -> BOOL {
    let Some(context) = context() else {
        return FALSE;
    };
    let (event, transition) = context.machine.on_fault(FaultId::ConsoleControl(ctrl_type));
    match transition {
        Transition::Ignored => FALSE,
        Transition::RequestShutdown { attempt } => {
            context.notifier.notify(event.id.slot(), attempt);
            TRUE
        }
        Transition::Terminate(TerminationCause::Escalated) => {
            context.release_instance_lock();
            exit_process(EXIT_ESCALATED)
        }
        Transition::Terminate(TerminationCause::Fatal) | Transition::AlreadyTerminating(_) => TRUE,
    }
}

/// Unlike POSIX, the filter runs on an ordinary (if broken) thread, so the report is built in
/// place.
fn write_report(context: &FaultContext, event: &FaultEvent, details: &FaultDetails) -> bool {
    let reporter = &context.reporter;
    let report = reporter.build_report(event, Some(details));
    match reporter.write_report(&report) {
        Ok(()) => {
            eprintln!("warden: crash report written to {}", report.path.display());
            reporter.notify_user(&report.summary, context.config.notice_timeout());
            true
        }
        Err(e) => {
            eprintln!("warden: {e}");
            false
        }
    }
}

unsafe fn exception_details(info: *const EXCEPTION_POINTERS) -> FaultDetails {
    let mut details = FaultDetails::default();
    let Some(info) = (unsafe { info.as_ref() }) else {
        return details;
    };
    if let Some(record) = unsafe { info.ExceptionRecord.as_ref() } {
        let code = record.ExceptionCode.0 as u32;
        details.code = code as i64;
        details.code_name = Some(label(FaultId::Exception(code)).to_string());
        details.instruction_pointer = Some(record.ExceptionAddress as usize);
        // For these two the second parameter is the inaccessible address.
        if matches!(code, EXCEPTION_ACCESS_VIOLATION | EXCEPTION_IN_PAGE_ERROR)
            && record.NumberParameters >= 2
        {
            details.address = Some(record.ExceptionInformation[1]);
        } else {
            details.address = Some(record.ExceptionAddress as usize);
        }
    }
    #[cfg(target_arch = "x86_64")]
    if let Some(ctx) = unsafe { info.ContextRecord.as_ref() } {
        details.registers = [
            ("rax", ctx.Rax),
            ("rbx", ctx.Rbx),
            ("rcx", ctx.Rcx),
            ("rdx", ctx.Rdx),
            ("rsi", ctx.Rsi),
            ("rdi", ctx.Rdi),
            ("rbp", ctx.Rbp),
            ("rsp", ctx.Rsp),
            ("r8", ctx.R8),
            ("r9", ctx.R9),
            ("r10", ctx.R10),
            ("r11", ctx.R11),
            ("r12", ctx.R12),
            ("r13", ctx.R13),
            ("r14", ctx.R14),
            ("r15", ctx.R15),
            ("rip", ctx.Rip),
            ("eflags", ctx.EFlags as u64),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), format!("{value:#018x}")))
        .collect();
    }
    details
}

fn exit_process(code: i32) -> ! {
    // SAFETY: ends the current process; does not return on success.
    let _ = unsafe { TerminateProcess(GetCurrentProcess(), code as u32) };
    std::process::exit(code)
}
