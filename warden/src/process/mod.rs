// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Child processes with bidirectional pipes.
//!
//! [`ProcessExecutor`] owns at most one child at a time. The parent writes to the child's stdin
//! and reads its stdout; the child's stderr is inherited.
//!
//! Threading: `read` and `write` take `&self` and may be driven from two different threads.
//! `spawn` and `finish` take `&mut self`, so the borrow checker serializes them against
//! everything else.
//!
//! Half-close contract: the first call to `read` half-closes the child's stdin. If a `write` is
//! in flight on another thread, `read` does not wait for it: the writer closes stdin as soon as
//! its write returns. From then on `write` returns `Ok(0)` and sends nothing, and the child sees
//! end of file on stdin.

mod errors;
mod pipe;
mod validation;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use errors::{ProcessError, ValidationError};
pub use pipe::{Direction, PipeChannel, PipeEndpoint};
pub use validation::{find_in_path, TrustPolicy};

use crate::shared::configuration::ExecutorConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use warden_common::timeout::TimeoutManager;
use warden_common::MutexExt;

#[cfg(unix)]
use unix::NativeChild;
#[cfg(windows)]
use windows::NativeChild;

/// How a child ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    /// Killed by this signal (POSIX only).
    Signal(i32),
    /// The child is gone but its status was collected by someone else.
    Unknown,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Code(0))
    }
}

#[derive(Debug, Default)]
struct InputState {
    closed: bool,
    // Writers between `write` entry and exit. The last one out closes stdin if `closed` is set.
    writers: usize,
}

/// A running (or exited but not yet finished) child and its two pipes.
pub struct ChildProcess {
    path: PathBuf,
    args: Vec<OsString>,
    native: NativeChild,
    // Parent writes to `input.write`, the child reads `input.read` as stdin.
    input: Mutex<PipeChannel>,
    // Child writes `output.write` as stdout, the parent reads `output.read`.
    output: Mutex<PipeChannel>,
    // Never held across a blocking call. Lock order is `input` then `input_state`.
    input_state: Mutex<InputState>,
    exit: Mutex<Option<ChildExit>>,
}

impl ChildProcess {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn pid(&self) -> u32 {
        self.native.id()
    }

    /// Exit status if the child has exited. Collects it from the OS if needed.
    fn poll_exit(&self) -> Option<ChildExit> {
        let mut exit = self.exit.lock_or_panic();
        if exit.is_none() {
            match self.native.try_wait() {
                Ok(status) => *exit = status,
                Err(e) => warn!(pid = self.pid(), error = %e, "Unable to query child status"),
            }
        }
        *exit
    }

    fn input_closed(&self) -> bool {
        self.input_state.lock_or_panic().closed
    }

    /// Marks stdin closed. Closes it right away unless a writer is in flight, in which case the
    /// last writer closes it once its write returns.
    fn close_input(&self) {
        let mut state = self.input_state.lock_or_panic();
        if state.closed {
            return;
        }
        state.closed = true;
        if state.writers == 0 {
            // No writer holds `input` or can take it while `input_state` is held here.
            self.input.lock_or_panic().write_end_mut().close();
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, ProcessError> {
        {
            let mut state = self.input_state.lock_or_panic();
            if state.closed {
                return Ok(0);
            }
            state.writers += 1;
        }

        let mut input = self.input.lock_or_panic();
        let result = if self.input_closed() {
            Ok(0)
        } else {
            input.write_end().write(bytes).map_err(ProcessError::Io)
        };

        let mut state = self.input_state.lock_or_panic();
        state.writers -= 1;
        if state.closed && state.writers == 0 {
            input.write_end_mut().close();
        }
        result
    }

    /// Waits for the child to exit, escalating from a graceful request to a kill.
    fn shut_down(&self, config: &ExecutorConfig) -> ChildExit {
        self.close_input();
        if let Some(exit) = self.wait(config.exit_wait()) {
            return exit;
        }

        debug!(pid = self.pid(), "Asking child to terminate");
        if let Err(e) = self.native.request_stop() {
            warn!(pid = self.pid(), error = %e, "Unable to request child termination");
        }
        if let Some(exit) = self.wait(config.graceful_timeout()) {
            return exit;
        }

        warn!(
            pid = self.pid(),
            timeout = ?config.graceful_timeout(),
            "Child ignored the termination request, killing it"
        );
        if let Err(e) = self.native.kill() {
            warn!(pid = self.pid(), error = %e, "Unable to kill child");
        }
        let reap_timeout = TimeoutManager::new(TimeoutManager::MINIMUM_REAP_TIME);
        loop {
            if let Some(exit) = self.wait(reap_timeout.remaining_for_reap()) {
                return exit;
            }
            if reap_timeout.expired() {
                // Not expected after SIGKILL/TerminateProcess. Keep the status unknown rather
                // than block forever.
                warn!(pid = self.pid(), "Child did not exit after being killed");
                return ChildExit::Unknown;
            }
        }
    }

    fn wait(&self, timeout: std::time::Duration) -> Option<ChildExit> {
        if let Some(exit) = self.poll_exit() {
            return Some(exit);
        }
        let timeout_manager = TimeoutManager::new(timeout);
        let status = match self.native.wait_timeout(&timeout_manager) {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "Waiting for child failed");
                None
            }
        };
        let mut exit = self.exit.lock_or_panic();
        if exit.is_none() {
            *exit = status;
        }
        *exit
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("pid", &self.pid())
            .field("input_closed", &self.input_closed())
            .field("exit", &*self.exit.lock_or_panic())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ProcessExecutor {
    config: ExecutorConfig,
    policy: TrustPolicy,
    child: Option<ChildProcess>,
    last_exit: Option<ChildExit>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig, policy: TrustPolicy) -> Self {
        Self {
            config,
            policy,
            child: None,
            last_exit: None,
        }
    }

    /// Validates `path` against the trust policy, then starts it with `args` (not including
    /// `argv[0]`). A child started earlier is finished first.
    ///
    /// Nothing is spawned if validation or pipe creation fails.
    pub fn spawn<A: AsRef<std::ffi::OsStr>>(
        &mut self,
        path: impl AsRef<Path>,
        args: &[A],
    ) -> Result<&ChildProcess, ProcessError> {
        self.finish();

        let path = self.policy.validate(path.as_ref())?;
        let args: Vec<OsString> = args.iter().map(|a| a.as_ref().to_os_string()).collect();
        let env: Vec<(OsString, OsString)> = match self.config.env() {
            Some(env) => env
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v)))
                .collect(),
            None => std::env::vars_os().collect(),
        };

        let mut input = PipeChannel::new().map_err(ProcessError::Pipe)?;
        let mut output = PipeChannel::new().map_err(ProcessError::Pipe)?;
        let native =
            NativeChild::spawn(&path, &args, &env, input.read_end(), output.write_end())?;

        // The child holds its own duplicates now.
        input.read_end_mut().close();
        output.write_end_mut().close();

        debug!(pid = native.id(), path = %path.display(), "Spawned child process");
        self.last_exit = None;
        Ok(self.child.insert(ChildProcess {
            path,
            args,
            native,
            input: Mutex::new(input),
            output: Mutex::new(output),
            input_state: Mutex::new(InputState::default()),
            exit: Mutex::new(None),
        }))
    }

    pub fn child(&self) -> Option<&ChildProcess> {
        self.child.as_ref()
    }

    fn running_child(&self) -> Result<&ChildProcess, ProcessError> {
        self.child.as_ref().ok_or(ProcessError::NoChild)
    }

    /// Writes to the child's stdin. Blocks until at least one byte is accepted and returns how
    /// many were. Returns `Ok(0)` without writing once the input side is half-closed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, ProcessError> {
        self.running_child()?.write(bytes)
    }

    /// Reads the child's stdout. Blocks until data arrives, the child closes its stdout
    /// (`Ok(0)`), or an error occurs. The first call half-closes the child's stdin.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ProcessError> {
        let child = self.running_child()?;
        child.close_input();
        let output = child.output.lock_or_panic();
        output.read_end().read(buf).map_err(ProcessError::Io)
    }

    /// Reads until end of file.
    pub fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize, ProcessError> {
        let mut buf = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.read(&mut buf)? {
                0 => return Ok(total),
                n => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
            }
        }
    }

    /// Asks the child to terminate (`SIGTERM` on POSIX). `false` if there is no child or it
    /// has already exited; never an error.
    pub fn terminate(&self) -> bool {
        let Some(child) = self.child.as_ref() else {
            return false;
        };
        if child.poll_exit().is_some() {
            return false;
        }
        match child.native.request_stop() {
            Ok(sent) => sent,
            Err(e) => {
                warn!(pid = child.pid(), error = %e, "Unable to request child termination");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.child
            .as_ref()
            .is_some_and(|child| child.poll_exit().is_none())
    }

    /// The child's exit status, if it has exited (or the last one, after `finish`).
    pub fn exit_status(&self) -> Option<ChildExit> {
        match &self.child {
            Some(child) => child.poll_exit(),
            None => self.last_exit,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(ChildProcess::pid)
    }

    /// Ends the current child: closes its stdin, lets it exit on its own for a moment, then
    /// requests termination, then kills it once the graceful timeout passes. Records the exit
    /// status and releases every pipe handle.
    ///
    /// Idempotent. Returns the exit status of the last child, if there ever was one.
    pub fn finish(&mut self) -> Option<ChildExit> {
        if let Some(child) = self.child.take() {
            let exit = child.shut_down(&self.config);
            debug!(pid = child.pid(), ?exit, "Child process finished");
            let mut output = child.output.lock_or_panic();
            output.close();
            drop(output);
            child.input.lock_or_panic().close();
            self.last_exit = Some(exit);
        }
        self.last_exit
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.finish();
    }
}
