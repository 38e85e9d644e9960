// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory ring of the most recent log lines, copied into the crash report.
//!
//! Memory is allocated once, when the ring is created. Writers take a short lock to serialize
//! against each other. Readers take no lock at all: every slot carries a sequence number that is
//! odd while the slot is being written, so a reader can tell when it raced a writer and drop
//! that line. This is what lets the crash collector read the ring from a forked copy of a
//! process whose writer lock may be held by a thread that no longer exists.

use crate::shared::constants::{LOG_RING_LINE_BYTES, LOG_RING_SLOTS};
use std::io;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use warden_common::MutexExt;

struct Slot {
    // 0: never written. Odd: write in progress. 2 * (line + 1): holds `line`.
    seq: AtomicU64,
    len: AtomicUsize,
    bytes: Box<[AtomicU8]>,
}

impl Slot {
    fn new(line_bytes: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            bytes: (0..line_bytes).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

struct Inner {
    slots: Box<[Slot]>,
    // Index of the next line to be written; also the number of lines ever written.
    head: AtomicU64,
    writer: Mutex<()>,
}

/// Cheap to clone; all clones share the same buffer.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Inner>,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(LOG_RING_SLOTS, LOG_RING_LINE_BYTES)
    }
}

impl std::fmt::Debug for LogRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRing")
            .field("capacity", &self.capacity())
            .field("lines_written", &self.lines_written())
            .finish()
    }
}

impl LogRing {
    /// A ring holding the last `slots` lines, each truncated to `line_bytes` bytes.
    pub fn new(slots: usize, line_bytes: usize) -> Self {
        let slots = slots.max(1);
        Self {
            inner: Arc::new(Inner {
                slots: (0..slots).map(|_| Slot::new(line_bytes)).collect(),
                head: AtomicU64::new(0),
                writer: Mutex::new(()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn lines_written(&self) -> u64 {
        self.inner.head.load(Ordering::Acquire)
    }

    /// Appends one line. Trailing newlines are stripped; overlong lines are truncated.
    pub fn push_line(&self, line: &[u8]) {
        let line = trim_line_end(line);
        let _guard = self.inner.writer.lock_or_panic();
        let index = self.inner.head.load(Ordering::Relaxed);
        let slot = &self.inner.slots[(index % self.capacity() as u64) as usize];

        slot.seq.store(2 * index + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        let len = line.len().min(slot.bytes.len());
        for (dst, src) in slot.bytes.iter().zip(&line[..len]) {
            dst.store(*src, Ordering::Relaxed);
        }
        slot.len.store(len, Ordering::Relaxed);
        slot.seq.store(2 * (index + 1), Ordering::Release);

        self.inner.head.store(index + 1, Ordering::Release);
    }

    /// Returns up to `max_lines` of the most recent lines, oldest first.
    /// Lines that were overwritten or are being written while this runs are skipped.
    pub fn tail(&self, max_lines: usize) -> Vec<String> {
        let head = self.inner.head.load(Ordering::Acquire);
        let wanted = max_lines.min(self.capacity()) as u64;
        let first = head.saturating_sub(wanted);

        let mut lines = Vec::with_capacity(wanted as usize);
        let mut scratch = Vec::with_capacity(self.inner.slots.first().map_or(0, |s| s.bytes.len()));
        for index in first..head {
            let slot = &self.inner.slots[(index % self.capacity() as u64) as usize];
            let expected = 2 * (index + 1);
            if slot.seq.load(Ordering::Acquire) != expected {
                continue;
            }
            scratch.clear();
            let len = slot.len.load(Ordering::Relaxed).min(slot.bytes.len());
            scratch.extend(slot.bytes[..len].iter().map(|b| b.load(Ordering::Relaxed)));
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != expected {
                continue;
            }
            lines.push(String::from_utf8_lossy(&scratch).into_owned());
        }
        lines
    }
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Per-event writer handed out to `tracing_subscriber::fmt`. Complete lines go to the ring as
/// they are written; a trailing partial line is committed on drop.
pub struct LogRingWriter {
    ring: LogRing,
    pending: Vec<u8>,
}

impl io::Write for LogRingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.pending.is_empty() {
                self.ring.push_line(&rest[..pos]);
            } else {
                self.pending.extend_from_slice(&rest[..pos]);
                self.ring.push_line(&self.pending);
                self.pending.clear();
            }
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogRingWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.ring.push_line(&self.pending);
        }
    }
}

impl<'a> MakeWriter<'a> for LogRing {
    type Writer = LogRingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogRingWriter {
            ring: self.clone(),
            pending: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tail_before_wrap() {
        let ring = LogRing::new(4, 16);
        ring.push_line(b"one\n");
        ring.push_line(b"two");
        assert_eq!(ring.tail(10), vec!["one", "two"]);
        assert_eq!(ring.tail(1), vec!["two"]);
        assert!(ring.tail(0).is_empty());
    }

    #[test]
    fn test_wraps_and_keeps_latest() {
        let ring = LogRing::new(3, 16);
        for i in 0..10 {
            ring.push_line(format!("line {i}").as_bytes());
        }
        assert_eq!(ring.lines_written(), 10);
        assert_eq!(ring.tail(5), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_truncates_long_lines() {
        let ring = LogRing::new(2, 4);
        ring.push_line(b"abcdefgh");
        assert_eq!(ring.tail(1), vec!["abcd"]);
    }

    #[test]
    fn test_writer_splits_lines() {
        let ring = LogRing::new(8, 64);
        {
            let mut w = ring.make_writer();
            w.write_all(b"first\nsec").unwrap();
            w.write_all(b"ond\nthird").unwrap();
        }
        assert_eq!(ring.tail(8), vec!["first", "second", "third"]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_writers_and_reader() {
        let ring = LogRing::new(16, 32);
        std::thread::scope(|s| {
            for t in 0..4 {
                let ring = ring.clone();
                s.spawn(move || {
                    for i in 0..200 {
                        ring.push_line(format!("thread {t} line {i}").as_bytes());
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    for line in ring.tail(16) {
                        assert!(line.starts_with("thread "), "torn line {line:?}");
                    }
                }
            });
        });
        assert_eq!(ring.lines_written(), 800);
        assert_eq!(ring.tail(100).len(), 16);
    }
}
