// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::io::{self, Read};

/// Forks without running `pthread_atfork` handlers.
///
/// The fatal-fault collector forks from inside a signal handler. A regular `fork()` runs the
/// atfork handlers registered by libc and other libraries, which may take locks the faulting
/// thread already holds.
#[cfg(target_os = "linux")]
pub fn alt_fork() -> libc::pid_t {
    use libc::{
        c_ulong, c_void, pid_t, syscall, SYS_clone, CLONE_CHILD_CLEARTID, CLONE_CHILD_SETTID,
        CLONE_PTRACE, SIGCHLD,
    };

    let mut _ptid: pid_t = 0;
    let mut _ctid: pid_t = 0;

    // A traced parent keeps its tracer on the child, so the debugger sees the collector too.
    let extra_flags = if is_being_traced() { CLONE_PTRACE } else { 0 };

    // Same flags glibc `fork()` passes to clone, minus the atfork machinery.
    let res = unsafe {
        syscall(
            SYS_clone,
            (CLONE_CHILD_CLEARTID | CLONE_CHILD_SETTID | SIGCHLD | extra_flags) as c_ulong,
            std::ptr::null_mut::<c_void>(),
            &mut _ptid as *mut pid_t,
            &mut _ctid as *mut pid_t,
            0 as c_ulong,
        )
    };

    res.clamp(pid_t::MIN as libc::c_long, pid_t::MAX as libc::c_long) as pid_t
}

#[cfg(not(target_os = "linux"))]
pub fn alt_fork() -> libc::pid_t {
    // macOS and the BSDs have no supported way around the atfork handlers.
    unsafe { libc::fork() }
}

/// Whether a debugger (or any ptrace tracer) is attached to this process.
///
/// Reads `/proc/self/status` with a fixed stack buffer so that it can also be called from the
/// fault path. Any failure is reported as "not traced".
#[cfg(target_os = "linux")]
pub fn is_being_traced() -> bool {
    File::open("/proc/self/status")
        .and_then(tracer_pid_is_set)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
pub fn is_being_traced() -> bool {
    false
}

#[cfg(target_os = "linux")]
const BUFFER_SIZE: usize = 1024;

#[cfg(target_os = "linux")]
const TRACER_PID_MARKER: &[u8] = b"TracerPid:";

#[cfg(target_os = "linux")]
fn tracer_pid_in_line(line: &[u8]) -> Option<bool> {
    let value = line.strip_prefix(TRACER_PID_MARKER)?;
    let value = std::str::from_utf8(value).ok()?.trim();
    Some(!value.is_empty() && value != "0")
}

/// Scans `status`-formatted content line by line. Lines longer than the buffer are skipped
/// without being interpreted.
#[cfg(target_os = "linux")]
fn tracer_pid_is_set(mut file: File) -> io::Result<bool> {
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut len = 0;
    let mut skipping_long_line = false;

    loop {
        let n = file.read(&mut buffer[len..])?;
        let eof = n == 0;
        len += n;

        let mut start = 0;
        while let Some(pos) = buffer[start..len].iter().position(|&b| b == b'\n') {
            let line = &buffer[start..start + pos];
            if !skipping_long_line {
                if let Some(traced) = tracer_pid_in_line(line) {
                    return Ok(traced);
                }
            }
            skipping_long_line = false;
            start += pos + 1;
        }

        if eof {
            let line = &buffer[start..len];
            return Ok(!skipping_long_line && tracer_pid_in_line(line).unwrap_or(false));
        }

        if start == 0 && len == BUFFER_SIZE {
            // No newline in a full buffer: drop it and ignore the rest of that line.
            skipping_long_line = true;
            len = 0;
        } else {
            buffer.copy_within(start..len, 0);
            len -= start;
        }
    }
}
