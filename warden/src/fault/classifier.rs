// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps raw fault identifiers to a severity tier and a human readable label.
//!
//! Everything here is a pure function over integers and `'static` strings, so it can run inside
//! a signal handler or an exception filter.

use serde::{Deserialize, Serialize};

/// A fault notification as delivered by the OS.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultId {
    /// POSIX signal number (also the C runtime signal numbers on Windows).
    Signal(i32),
    /// Windows structured exception code (`NTSTATUS`).
    Exception(u32),
    /// Windows console control event (`CTRL_C_EVENT`, `CTRL_CLOSE_EVENT`, ...).
    ConsoleControl(u32),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Ignored by the escalation machine.
    Recoverable,
    /// Operator requested termination. Asks the host to shut down, escalating on repeats.
    Escalating,
    /// The process state can no longer be trusted.
    Fatal,
}

// Windows exception codes. Spelled out here so classification is the same on every platform.
pub const EXCEPTION_GUARD_PAGE: u32 = 0x8000_0001;
pub const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
pub const EXCEPTION_INVALID_HANDLE: u32 = 0xC000_0008;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
pub const EXCEPTION_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
pub const EXCEPTION_INVALID_DISPOSITION: u32 = 0xC000_0026;
pub const EXCEPTION_ARRAY_BOUNDS_EXCEEDED: u32 = 0xC000_008C;
pub const EXCEPTION_FLT_DENORMAL_OPERAND: u32 = 0xC000_008D;
pub const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
pub const EXCEPTION_FLT_INEXACT_RESULT: u32 = 0xC000_008F;
pub const EXCEPTION_FLT_INVALID_OPERATION: u32 = 0xC000_0090;
pub const EXCEPTION_FLT_OVERFLOW: u32 = 0xC000_0091;
pub const EXCEPTION_FLT_STACK_CHECK: u32 = 0xC000_0092;
pub const EXCEPTION_FLT_UNDERFLOW: u32 = 0xC000_0093;
pub const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
pub const EXCEPTION_INT_OVERFLOW: u32 = 0xC000_0095;
pub const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
pub const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;
pub const STATUS_HEAP_CORRUPTION: u32 = 0xC000_0374;
pub const STATUS_STACK_BUFFER_OVERRUN: u32 = 0xC000_0409;
pub const DBG_CONTROL_C: u32 = 0x4001_0005;
pub const DBG_CONTROL_BREAK: u32 = 0x4001_0008;

// Windows console control events.
pub const CTRL_C_EVENT: u32 = 0;
pub const CTRL_BREAK_EVENT: u32 = 1;
pub const CTRL_CLOSE_EVENT: u32 = 2;
pub const CTRL_LOGOFF_EVENT: u32 = 5;
pub const CTRL_SHUTDOWN_EVENT: u32 = 6;

// Slot layout used by per-kind counters: signals 0..=64, then console events, then the
// exception kinds the escalation machine tells apart.
const SIGNAL_SLOTS: usize = 65;
const CONSOLE_SLOT_BASE: usize = SIGNAL_SLOTS;
const CONSOLE_SLOTS: usize = 7;
const DBG_CONTROL_C_SLOT: usize = CONSOLE_SLOT_BASE + CONSOLE_SLOTS;
const DBG_CONTROL_BREAK_SLOT: usize = DBG_CONTROL_C_SLOT + 1;
const EXCEPTION_SLOT: usize = DBG_CONTROL_BREAK_SLOT + 1;
const UNKNOWN_SLOT: usize = EXCEPTION_SLOT + 1;
pub const MAX_FAULT_SLOTS: usize = UNKNOWN_SLOT + 1;

impl FaultId {
    /// Index of this fault's kind in per-kind tables. Always `< MAX_FAULT_SLOTS`.
    pub const fn slot(self) -> usize {
        match self {
            FaultId::Signal(signum) if signum >= 0 && (signum as usize) < SIGNAL_SLOTS => {
                signum as usize
            }
            FaultId::ConsoleControl(event) if (event as usize) < CONSOLE_SLOTS => {
                CONSOLE_SLOT_BASE + event as usize
            }
            FaultId::Exception(DBG_CONTROL_C) => DBG_CONTROL_C_SLOT,
            FaultId::Exception(DBG_CONTROL_BREAK) => DBG_CONTROL_BREAK_SLOT,
            FaultId::Exception(_) => EXCEPTION_SLOT,
            _ => UNKNOWN_SLOT,
        }
    }

    /// Inverse of [`FaultId::slot`] for the slots that identify a single fault.
    /// The shared "other exception" and "unknown" slots have no inverse.
    pub const fn from_slot(slot: usize) -> Option<FaultId> {
        if slot < SIGNAL_SLOTS {
            Some(FaultId::Signal(slot as i32))
        } else if slot < CONSOLE_SLOT_BASE + CONSOLE_SLOTS {
            Some(FaultId::ConsoleControl((slot - CONSOLE_SLOT_BASE) as u32))
        } else if slot == DBG_CONTROL_C_SLOT {
            Some(FaultId::Exception(DBG_CONTROL_C))
        } else if slot == DBG_CONTROL_BREAK_SLOT {
            Some(FaultId::Exception(DBG_CONTROL_BREAK))
        } else {
            None
        }
    }
}

/// Total and deterministic: every identifier lands in exactly one tier.
pub const fn classify(id: FaultId) -> Severity {
    match id {
        FaultId::Signal(signum) => classify_signal(signum),
        FaultId::Exception(code) => classify_exception(code),
        FaultId::ConsoleControl(event) => match event {
            CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT | CTRL_LOGOFF_EVENT
            | CTRL_SHUTDOWN_EVENT => Severity::Escalating,
            _ => Severity::Recoverable,
        },
    }
}

#[cfg(unix)]
const fn classify_signal(signum: i32) -> Severity {
    match signum {
        libc::SIGINT | libc::SIGHUP | libc::SIGTERM | libc::SIGQUIT => Severity::Escalating,
        libc::SIGSEGV
        | libc::SIGBUS
        | libc::SIGILL
        | libc::SIGFPE
        | libc::SIGABRT
        | libc::SIGTRAP
        | libc::SIGSYS
        | libc::SIGKILL => Severity::Fatal,
        _ => Severity::Recoverable,
    }
}

// MSVC C runtime numbering.
#[cfg(windows)]
const fn classify_signal(signum: i32) -> Severity {
    match signum {
        2 | 15 | 21 => Severity::Escalating,
        4 | 8 | 11 | 22 => Severity::Fatal,
        _ => Severity::Recoverable,
    }
}

const fn classify_exception(code: u32) -> Severity {
    match code {
        DBG_CONTROL_C | DBG_CONTROL_BREAK => Severity::Escalating,
        EXCEPTION_DATATYPE_MISALIGNMENT | EXCEPTION_BREAKPOINT | EXCEPTION_SINGLE_STEP => {
            Severity::Fatal
        }
        // Error severity (top two bits set) covers every other exception we know of, plus
        // unhandled C++ exceptions (0xE06D7363).
        code if code >> 30 == 0b11 => Severity::Fatal,
        _ => Severity::Recoverable,
    }
}

/// Human readable label, e.g. `SIGSEGV (segmentation violation)`.
pub const fn label(id: FaultId) -> &'static str {
    match id {
        FaultId::Signal(signum) => signal_label(signum),
        FaultId::Exception(code) => exception_label(code),
        FaultId::ConsoleControl(event) => match event {
            CTRL_C_EVENT => "CTRL_C_EVENT (interrupt)",
            CTRL_BREAK_EVENT => "CTRL_BREAK_EVENT (break)",
            CTRL_CLOSE_EVENT => "CTRL_CLOSE_EVENT (console closed)",
            CTRL_LOGOFF_EVENT => "CTRL_LOGOFF_EVENT (user logoff)",
            CTRL_SHUTDOWN_EVENT => "CTRL_SHUTDOWN_EVENT (system shutdown)",
            _ => "unknown console event",
        },
    }
}

#[cfg(unix)]
const fn signal_label(signum: i32) -> &'static str {
    match signum {
        libc::SIGHUP => "SIGHUP (hang-up)",
        libc::SIGINT => "SIGINT (interrupt)",
        libc::SIGQUIT => "SIGQUIT (quit request)",
        libc::SIGILL => "SIGILL (illegal instruction)",
        libc::SIGTRAP => "SIGTRAP (trace trap)",
        libc::SIGABRT => "SIGABRT (abort)",
        libc::SIGBUS => "SIGBUS (bus error)",
        libc::SIGFPE => "SIGFPE (floating-point exception)",
        libc::SIGKILL => "SIGKILL (killed)",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV (segmentation violation)",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE (broken pipe)",
        libc::SIGALRM => "SIGALRM (alarm)",
        libc::SIGTERM => "SIGTERM (termination request)",
        libc::SIGCHLD => "SIGCHLD (child status changed)",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU (CPU time limit exceeded)",
        libc::SIGXFSZ => "SIGXFSZ (file size limit exceeded)",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGSYS => "SIGSYS (bad system call)",
        _ => "unknown signal",
    }
}

#[cfg(windows)]
const fn signal_label(signum: i32) -> &'static str {
    match signum {
        2 => "SIGINT (interrupt)",
        4 => "SIGILL (illegal instruction)",
        8 => "SIGFPE (floating-point exception)",
        11 => "SIGSEGV (segmentation violation)",
        15 => "SIGTERM (termination request)",
        21 => "SIGBREAK (break)",
        22 => "SIGABRT (abort)",
        _ => "unknown signal",
    }
}

const fn exception_label(code: u32) -> &'static str {
    match code {
        EXCEPTION_GUARD_PAGE => "EXCEPTION_GUARD_PAGE",
        EXCEPTION_DATATYPE_MISALIGNMENT => "EXCEPTION_DATATYPE_MISALIGNMENT",
        EXCEPTION_BREAKPOINT => "EXCEPTION_BREAKPOINT",
        EXCEPTION_SINGLE_STEP => "EXCEPTION_SINGLE_STEP",
        EXCEPTION_ACCESS_VIOLATION => "EXCEPTION_ACCESS_VIOLATION (illegal memory access)",
        EXCEPTION_IN_PAGE_ERROR => "EXCEPTION_IN_PAGE_ERROR",
        EXCEPTION_INVALID_HANDLE => "EXCEPTION_INVALID_HANDLE",
        EXCEPTION_ILLEGAL_INSTRUCTION => "EXCEPTION_ILLEGAL_INSTRUCTION",
        EXCEPTION_NONCONTINUABLE_EXCEPTION => "EXCEPTION_NONCONTINUABLE_EXCEPTION",
        EXCEPTION_INVALID_DISPOSITION => "EXCEPTION_INVALID_DISPOSITION",
        EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "EXCEPTION_ARRAY_BOUNDS_EXCEEDED",
        EXCEPTION_FLT_DENORMAL_OPERAND => "EXCEPTION_FLT_DENORMAL_OPERAND",
        EXCEPTION_FLT_DIVIDE_BY_ZERO => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
        EXCEPTION_FLT_INEXACT_RESULT => "EXCEPTION_FLT_INEXACT_RESULT",
        EXCEPTION_FLT_INVALID_OPERATION => "EXCEPTION_FLT_INVALID_OPERATION",
        EXCEPTION_FLT_OVERFLOW => "EXCEPTION_FLT_OVERFLOW",
        EXCEPTION_FLT_STACK_CHECK => "EXCEPTION_FLT_STACK_CHECK",
        EXCEPTION_FLT_UNDERFLOW => "EXCEPTION_FLT_UNDERFLOW",
        EXCEPTION_INT_DIVIDE_BY_ZERO => "EXCEPTION_INT_DIVIDE_BY_ZERO",
        EXCEPTION_INT_OVERFLOW => "EXCEPTION_INT_OVERFLOW",
        EXCEPTION_PRIV_INSTRUCTION => "EXCEPTION_PRIV_INSTRUCTION",
        EXCEPTION_STACK_OVERFLOW => "EXCEPTION_STACK_OVERFLOW",
        STATUS_HEAP_CORRUPTION => "STATUS_HEAP_CORRUPTION",
        STATUS_STACK_BUFFER_OVERRUN => "STATUS_STACK_BUFFER_OVERRUN",
        DBG_CONTROL_C => "DBG_CONTROL_C (interrupt)",
        DBG_CONTROL_BREAK => "DBG_CONTROL_BREAK (break)",
        0xE06D_7363 => "unhandled C++ exception",
        _ => "unknown exception",
    }
}

/// Signals intercepted when the configuration does not list any. Sorted, no duplicates.
#[cfg(unix)]
pub fn default_signals() -> Vec<i32> {
    let mut signals = vec![
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGILL,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGSYS,
        libc::SIGPIPE,
    ];
    signals.sort();
    signals
}

#[cfg(windows)]
pub fn default_signals() -> Vec<i32> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_fault() -> impl Iterator<Item = FaultId> {
        let signals = (-2..80).map(FaultId::Signal);
        let consoles = (0..10).map(FaultId::ConsoleControl);
        let exceptions = [
            0u32,
            0x4000_0000,
            0x406D_1388,
            EXCEPTION_GUARD_PAGE,
            EXCEPTION_BREAKPOINT,
            EXCEPTION_ACCESS_VIOLATION,
            EXCEPTION_STACK_OVERFLOW,
            DBG_CONTROL_C,
            DBG_CONTROL_BREAK,
            0xE06D_7363,
            u32::MAX,
        ]
        .into_iter()
        .map(FaultId::Exception);
        signals.chain(consoles).chain(exceptions)
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_tiers() {
        for signum in [libc::SIGINT, libc::SIGHUP, libc::SIGTERM, libc::SIGQUIT] {
            assert_eq!(classify(FaultId::Signal(signum)), Severity::Escalating);
        }
        for signum in [
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGILL,
            libc::SIGFPE,
            libc::SIGABRT,
        ] {
            assert_eq!(classify(FaultId::Signal(signum)), Severity::Fatal);
        }
        for signum in [libc::SIGPIPE, libc::SIGCHLD, libc::SIGUSR1, 0, -1, 4242] {
            assert_eq!(classify(FaultId::Signal(signum)), Severity::Recoverable);
        }
    }

    #[test]
    fn test_exception_tiers() {
        assert_eq!(
            classify(FaultId::Exception(EXCEPTION_ACCESS_VIOLATION)),
            Severity::Fatal
        );
        assert_eq!(
            classify(FaultId::Exception(EXCEPTION_INT_DIVIDE_BY_ZERO)),
            Severity::Fatal
        );
        assert_eq!(classify(FaultId::Exception(0x4242_C0DE)), Severity::Recoverable);
        assert_eq!(
            classify(FaultId::Exception(DBG_CONTROL_C)),
            Severity::Escalating
        );
        assert_eq!(
            classify(FaultId::ConsoleControl(CTRL_CLOSE_EVENT)),
            Severity::Escalating
        );
        assert_eq!(classify(FaultId::ConsoleControl(3)), Severity::Recoverable);
    }

    #[test]
    fn test_classification_is_deterministic() {
        for id in every_fault() {
            assert_eq!(classify(id), classify(id), "{id:?}");
            assert_eq!(label(id), label(id));
        }
    }

    #[test]
    fn test_slots_in_range_and_invertible() {
        for id in every_fault() {
            let slot = id.slot();
            assert!(slot < MAX_FAULT_SLOTS, "{id:?} -> {slot}");
            if let Some(back) = FaultId::from_slot(slot) {
                assert_eq!(back.slot(), slot);
                // Escalating faults must come back exactly, they are reported by slot.
                if classify(id) == Severity::Escalating {
                    assert_eq!(back, id);
                }
            }
        }
    }

    #[test]
    fn test_default_signals_sorted_and_unique() {
        let signals = default_signals();
        let mut sorted = signals.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(signals, sorted);
    }
}
