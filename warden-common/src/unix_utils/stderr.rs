// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Only write(2) is used here, which is on the async-signal-safe list.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>

/// Writes `msg` to stderr without allocating or locking. Errors are ignored: there is nowhere
/// left to report them.
pub fn write_stderr(msg: &[u8]) {
    let mut rest = msg;
    while !rest.is_empty() {
        // SAFETY: the pointer and length come from a valid slice.
        let written = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
            )
        };
        if written < 0 {
            if nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            return;
        }
        if written == 0 {
            return;
        }
        rest = &rest[written as usize..];
    }
}

/// Formats `val` as decimal into `buf` and returns the number of bytes used, or `None` if the
/// buffer is too small.
pub fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Writes a signed number to stderr using a stack buffer.
pub fn write_stderr_number(val: i64) {
    let mut buf = [0u8; 24];
    let (offset, magnitude) = if val < 0 {
        buf[0] = b'-';
        (1, val.unsigned_abs())
    } else {
        (0, val as u64)
    };
    if let Some(len) = write_decimal(&mut buf[offset..], magnitude) {
        write_stderr(&buf[..offset + len]);
    }
}
