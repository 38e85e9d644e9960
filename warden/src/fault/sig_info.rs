// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reading `siginfo_t` and `ucontext_t`. Only runs in the crash collector, after the fork.

use crate::report::FaultDetails;
use libc::{siginfo_t, ucontext_t};

/// Name of a signal specific `si_code`.
///
/// Standard values differ between OSes. The SEGV codes match everywhere; the rest is only
/// decoded on Linux.
// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/siginfo.h
pub fn si_code_name(signum: i32, si_code: i32) -> Option<&'static str> {
    let name = match (signum, si_code) {
        (libc::SIGSEGV, 1) => "SEGV_MAPERR",
        (libc::SIGSEGV, 2) => "SEGV_ACCERR",
        _ => return linux_si_code_name(signum, si_code),
    };
    Some(name)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn linux_si_code_name(signum: i32, si_code: i32) -> Option<&'static str> {
    let name = match (signum, si_code) {
        (_, 0) => "SI_USER",
        (_, 0x80) => "SI_KERNEL",
        (_, -1) => "SI_QUEUE",
        (_, -2) => "SI_TIMER",
        (_, -3) => "SI_MESGQ",
        (_, -4) => "SI_ASYNCIO",
        (_, -6) => "SI_TKILL",
        (libc::SIGSEGV, 3) => "SEGV_BNDERR",
        (libc::SIGSEGV, 4) => "SEGV_PKUERR",
        (libc::SIGBUS, 1) => "BUS_ADRALN",
        (libc::SIGBUS, 2) => "BUS_ADRERR",
        (libc::SIGBUS, 3) => "BUS_OBJERR",
        (libc::SIGBUS, 4) => "BUS_MCEERR_AR",
        (libc::SIGBUS, 5) => "BUS_MCEERR_AO",
        (libc::SIGILL, 1) => "ILL_ILLOPC",
        (libc::SIGILL, 2) => "ILL_ILLOPN",
        (libc::SIGILL, 3) => "ILL_ILLADR",
        (libc::SIGILL, 4) => "ILL_ILLTRP",
        (libc::SIGILL, 5) => "ILL_PRVOPC",
        (libc::SIGILL, 6) => "ILL_PRVREG",
        (libc::SIGILL, 7) => "ILL_COPROC",
        (libc::SIGILL, 8) => "ILL_BADSTK",
        (libc::SIGFPE, 1) => "FPE_INTDIV",
        (libc::SIGFPE, 2) => "FPE_INTOVF",
        (libc::SIGFPE, 3) => "FPE_FLTDIV",
        (libc::SIGFPE, 4) => "FPE_FLTOVF",
        (libc::SIGFPE, 5) => "FPE_FLTUND",
        (libc::SIGFPE, 6) => "FPE_FLTRES",
        (libc::SIGFPE, 7) => "FPE_FLTINV",
        (libc::SIGFPE, 8) => "FPE_FLTSUB",
        (libc::SIGTRAP, 1) => "TRAP_BRKPT",
        (libc::SIGTRAP, 2) => "TRAP_TRACE",
        _ => return None,
    };
    Some(name)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn linux_si_code_name(_signum: i32, _si_code: i32) -> Option<&'static str> {
    None
}

/// Collects everything the report needs from the signal handler arguments. Null pointers
/// yield empty details.
///
/// # Safety
/// `sig_info` and `ucontext` are null or the pointers handed to the signal handler.
pub unsafe fn fault_details(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> FaultDetails {
    let mut details = FaultDetails {
        code: signum as i64,
        ..Default::default()
    };
    if !sig_info.is_null() {
        // SAFETY: non-null, and valid per the caller.
        let info = unsafe { &*sig_info };
        details.code_name = si_code_name(signum, info.si_code).map(str::to_string);
        // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the
        // fault.
        // https://man7.org/linux/man-pages/man2/sigaction.2.html
        if matches!(
            signum,
            libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP
        ) {
            details.address = Some(unsafe { info.si_addr() } as usize);
        }
    }
    if !ucontext.is_null() {
        details.instruction_pointer = unsafe { instruction_pointer(ucontext) };
        details.registers = unsafe { registers(ucontext) };
    }
    details
}

/// # Safety
/// `ucontext` is a valid, non-null pointer handed to a signal handler.
pub unsafe fn instruction_pointer(ucontext: *const ucontext_t) -> Option<usize> {
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    let ip = unsafe {
        let mcontext = (*ucontext).uc_mcontext;
        (!mcontext.is_null()).then(|| (*mcontext).__ss.__rip as usize)
    };
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    let ip = unsafe {
        let mcontext = (*ucontext).uc_mcontext;
        (!mcontext.is_null()).then(|| (*mcontext).__ss.__pc as usize)
    };
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    let ip = Some(unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] } as usize);
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    let ip = Some(unsafe { (*ucontext).uc_mcontext.pc } as usize);
    #[cfg(not(any(
        all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
        all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64"))
    )))]
    let ip = {
        let _ = ucontext;
        None
    };
    ip
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn registers(ucontext: *const ucontext_t) -> Vec<(String, String)> {
    // Order of `gregs`, see <sys/ucontext.h>.
    const NAMES: [&str; 23] = [
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rdi", "rsi", "rbp", "rbx", "rdx",
        "rax", "rcx", "rsp", "rip", "efl", "csgsfs", "err", "trapno", "oldmask", "cr2",
    ];
    let gregs = unsafe { &(*ucontext).uc_mcontext.gregs };
    NAMES
        .iter()
        .zip(gregs.iter())
        .map(|(name, value)| (name.to_string(), format!("{:#018x}", *value as u64)))
        .collect()
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn registers(ucontext: *const ucontext_t) -> Vec<(String, String)> {
    let mcontext = unsafe { &(*ucontext).uc_mcontext };
    let mut registers: Vec<(String, String)> = mcontext
        .regs
        .iter()
        .enumerate()
        .map(|(index, value)| (format!("x{index}"), format!("{value:#018x}")))
        .collect();
    registers.push(("sp".to_string(), format!("{:#018x}", mcontext.sp)));
    registers.push(("pc".to_string(), format!("{:#018x}", mcontext.pc)));
    registers.push(("pstate".to_string(), format!("{:#018x}", mcontext.pstate)));
    registers
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn registers(ucontext: *const ucontext_t) -> Vec<(String, String)> {
    let mcontext = unsafe { (*ucontext).uc_mcontext };
    if mcontext.is_null() {
        return vec![];
    }
    let ss = unsafe { &(*mcontext).__ss };
    [
        ("rax", ss.__rax),
        ("rbx", ss.__rbx),
        ("rcx", ss.__rcx),
        ("rdx", ss.__rdx),
        ("rdi", ss.__rdi),
        ("rsi", ss.__rsi),
        ("rbp", ss.__rbp),
        ("rsp", ss.__rsp),
        ("r8", ss.__r8),
        ("r9", ss.__r9),
        ("r10", ss.__r10),
        ("r11", ss.__r11),
        ("r12", ss.__r12),
        ("r13", ss.__r13),
        ("r14", ss.__r14),
        ("r15", ss.__r15),
        ("rip", ss.__rip),
        ("rflags", ss.__rflags),
    ]
    .iter()
    .map(|(name, value)| (name.to_string(), format!("{value:#018x}")))
    .collect()
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn registers(ucontext: *const ucontext_t) -> Vec<(String, String)> {
    let mcontext = unsafe { (*ucontext).uc_mcontext };
    if mcontext.is_null() {
        return vec![];
    }
    let ss = unsafe { &(*mcontext).__ss };
    let mut registers: Vec<(String, String)> = ss
        .__x
        .iter()
        .enumerate()
        .map(|(index, value)| (format!("x{index}"), format!("{value:#018x}")))
        .collect();
    registers.push(("fp".to_string(), format!("{:#018x}", ss.__fp)));
    registers.push(("lr".to_string(), format!("{:#018x}", ss.__lr)));
    registers.push(("sp".to_string(), format!("{:#018x}", ss.__sp)));
    registers.push(("pc".to_string(), format!("{:#018x}", ss.__pc)));
    registers
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64"))
)))]
unsafe fn registers(_ucontext: *const ucontext_t) -> Vec<(String, String)> {
    vec![]
}
