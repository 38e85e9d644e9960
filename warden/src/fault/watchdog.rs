// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Moves graceful shutdown requests out of fault context.
//!
//! The fault callback only writes a two byte record `[slot, attempt]`: into a non-blocking pipe
//! on POSIX (`write(2)` is async-signal safe), into a channel on Windows (console control
//! handlers run on an ordinary thread). A thread started at installation turns each record
//! into a log line and a call to the host's [`ShutdownSink`].

use super::classifier::{label, FaultId};
use std::io;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

// Never a valid fault slot.
const STOP_SLOT: u8 = u8::MAX;

/// A graceful shutdown request, delivered to the host outside of fault context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub fault: FaultId,
    pub label: &'static str,
    /// 1 for the first request of this kind. Requests stop at `max_attempts - 1`: the
    /// `max_attempts`-th terminates the process.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Receives "begin shutdown" requests, typically by posting to the host's event queue.
pub trait ShutdownSink: Send + 'static {
    fn request_shutdown(&self, request: ShutdownRequest);
}

impl<F> ShutdownSink for F
where
    F: Fn(ShutdownRequest) + Send + 'static,
{
    fn request_shutdown(&self, request: ShutdownRequest) {
        self(request)
    }
}

impl ShutdownSink for mpsc::Sender<ShutdownRequest> {
    fn request_shutdown(&self, request: ShutdownRequest) {
        if self.send(request).is_err() {
            warn!("Shutdown request dropped, the receiver is gone");
        }
    }
}

/// The writing side, usable from fault context.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    #[cfg(unix)]
    fd: std::os::fd::RawFd,
    #[cfg(windows)]
    tx: mpsc::Sender<[u8; 2]>,
}

impl Notifier {
    /// Returns whether the record was queued. Never blocks.
    pub(crate) fn notify(&self, slot: usize, attempt: u32) -> bool {
        let record = [
            slot.min(STOP_SLOT as usize - 1) as u8,
            attempt.min(u8::MAX as u32) as u8,
        ];
        self.send(record)
    }

    fn stop(&self) -> bool {
        self.send([STOP_SLOT, 0])
    }

    #[cfg(unix)]
    fn send(&self, record: [u8; 2]) -> bool {
        loop {
            // SAFETY: writes two bytes from a stack buffer. Writes below PIPE_BUF are atomic,
            // so records never interleave.
            let written = unsafe { libc::write(self.fd, record.as_ptr().cast(), record.len()) };
            if written == record.len() as isize {
                return true;
            }
            if written < 0 && nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            return false;
        }
    }

    #[cfg(windows)]
    fn send(&self, record: [u8; 2]) -> bool {
        self.tx.send(record).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    notifier: Notifier,
    thread: Option<JoinHandle<()>>,
    // Keeps the descriptor behind `notifier.fd` open.
    #[cfg(unix)]
    _write_end: std::os::fd::OwnedFd,
}

impl Watchdog {
    #[cfg(unix)]
    pub(crate) fn spawn(sink: Box<dyn ShutdownSink>, max_attempts: u32) -> io::Result<Self> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
        use std::io::Read;
        use std::os::fd::AsRawFd;

        let (read_end, write_end) = nix::unistd::pipe()?;
        for fd in [&read_end, &write_end] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        // A full pipe drops the request instead of blocking the fault callback.
        fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let mut records = std::fs::File::from(read_end);
        let thread = std::thread::Builder::new()
            .name("warden-watchdog".to_string())
            .spawn(move || {
                let mut record = [0u8; 2];
                loop {
                    match records.read_exact(&mut record) {
                        Ok(()) => {
                            if !dispatch(sink.as_ref(), record, max_attempts) {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                        Err(e) => {
                            error!(error = %e, "Fault watchdog failed to read");
                            break;
                        }
                    }
                }
                debug!("Fault watchdog exiting");
            })?;

        Ok(Self {
            notifier: Notifier {
                fd: write_end.as_raw_fd(),
            },
            thread: Some(thread),
            _write_end: write_end,
        })
    }

    #[cfg(windows)]
    pub(crate) fn spawn(sink: Box<dyn ShutdownSink>, max_attempts: u32) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<[u8; 2]>();
        let thread = std::thread::Builder::new()
            .name("warden-watchdog".to_string())
            .spawn(move || {
                for record in rx {
                    if !dispatch(sink.as_ref(), record, max_attempts) {
                        break;
                    }
                }
                debug!("Fault watchdog exiting");
            })?;
        Ok(Self {
            notifier: Notifier { tx },
            thread: Some(thread),
        })
    }

    pub(crate) fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Stops the thread after it has delivered every record queued so far.
    pub(crate) fn stop(mut self) {
        if !self.notifier.stop() {
            warn!("Unable to signal the fault watchdog to stop");
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Fault watchdog panicked");
            }
        }
    }
}

/// Delivers one record. Returns `false` for the stop record.
fn dispatch(sink: &dyn ShutdownSink, record: [u8; 2], max_attempts: u32) -> bool {
    let [slot, attempt] = record;
    if slot == STOP_SLOT {
        return false;
    }
    let Some(fault) = FaultId::from_slot(slot as usize) else {
        warn!(slot, "Shutdown request for an unknown fault kind");
        return true;
    };
    let attempt = attempt as u32;
    let label = label(fault);
    warn!(
        fault = label,
        attempt,
        max_attempts,
        "Termination requested ({attempt}/{max_attempts}), shutting down gracefully"
    );
    sink.request_shutdown(ShutdownRequest {
        fault,
        label,
        attempt,
        max_attempts,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_dispatch() {
        let (tx, rx) = mpsc::channel::<ShutdownRequest>();
        assert!(dispatch(&tx, [2, 1], 5));
        let request = rx.try_recv().unwrap();
        assert_eq!(request.fault, FaultId::Signal(2));
        assert_eq!(request.attempt, 1);
        assert_eq!(request.max_attempts, 5);

        assert!(!dispatch(&tx, [STOP_SLOT, 0], 5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_watchdog_delivers_in_order() {
        let (tx, rx) = mpsc::channel::<ShutdownRequest>();
        let watchdog = Watchdog::spawn(Box::new(tx), 5).unwrap();
        let notifier = watchdog.notifier();
        let id = FaultId::ConsoleControl(0);
        for attempt in 1..=3 {
            assert!(notifier.notify(id.slot(), attempt));
        }
        for attempt in 1..=3 {
            let request = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(request.fault, id);
            assert_eq!(request.attempt, attempt);
        }
        watchdog.stop();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_closure_sink() {
        let (tx, rx) = mpsc::channel();
        let watchdog = Watchdog::spawn(
            Box::new(move |request: ShutdownRequest| {
                let _ = tx.send(request.attempt);
            }),
            3,
        )
        .unwrap();
        assert!(watchdog.notifier().notify(1, 2));
        watchdog.stop();
        assert_eq!(rx.try_recv().unwrap(), 2);
    }
}
