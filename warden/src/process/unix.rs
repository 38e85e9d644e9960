// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::errors::{ProcessError, ValidationError};
use super::pipe::{PipeChannel, PipeEndpoint};
use super::ChildExit;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use warden_common::timeout::TimeoutManager;
use warden_common::unix_utils::{reap_child, terminate, PreparedExecve, ReapError};

// Exit code of a forked child whose execve failed. The parent learns the real reason from the
// exec-error pipe and never reports this code.
const EXEC_FAILED: i32 = 127;

/// A forked and exec'd child, identified by pid.
pub(crate) struct NativeChild {
    pid: Pid,
}

impl NativeChild {
    /// Forks and execs `path`, with `stdin` and `stdout` (the child's ends of the two channels)
    /// as the child's standard input and output. stderr is inherited.
    ///
    /// Failures of `execve` itself are reported back over a close-on-exec pipe, so a missing
    /// interpreter or an `ENOEXEC` binary is a spawn error rather than a child exiting with 127.
    pub(crate) fn spawn(
        path: &Path,
        args: &[OsString],
        env: &[(OsString, OsString)],
        stdin: &PipeEndpoint,
        stdout: &PipeEndpoint,
    ) -> Result<Self, ProcessError> {
        // Everything the child needs is allocated here, before the fork.
        let execve = PreparedExecve::new(path, args, env)
            .map_err(|e| ValidationError::InvalidArgument(e.to_string()))?;
        let stdin_fd = raw_fd(stdin)?;
        let stdout_fd = raw_fd(stdout)?;
        let mut exec_error = PipeChannel::new().map_err(ProcessError::Pipe)?;
        let exec_error_fd = raw_fd(exec_error.write_end())?;

        // SAFETY: the child only calls async-signal safe functions before exec or _exit.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => run_child(&execve, stdin_fd, stdout_fd, exec_error_fd),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                return Err(ProcessError::Spawn {
                    path: path.to_path_buf(),
                    source: e.into(),
                })
            }
        };

        exec_error.write_end_mut().close();
        let mut errno = [0u8; 4];
        let mut received = 0;
        while received < errno.len() {
            match exec_error.read_end().read(&mut errno[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(_) => break,
            }
        }
        if received == errno.len() {
            // Reap the failed child right away; it exits without doing anything else.
            let _ = waitpid(child, None);
            return Err(ProcessError::Spawn {
                path: path.to_path_buf(),
                source: io::Error::from_raw_os_error(i32::from_ne_bytes(errno)),
            });
        }
        Ok(Self { pid: child })
    }

    pub(crate) fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking. `Ok(None)` while the child is still running.
    pub(crate) fn try_wait(&self) -> io::Result<Option<ChildExit>> {
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(exit) = exit_from_status(status) {
                        return Ok(Some(exit));
                    }
                    // Stopped or continued: not an exit, keep polling.
                    return Ok(None);
                }
                Err(nix::Error::EINTR) => continue,
                // Someone else reaped it.
                Err(nix::Error::ECHILD) => return Ok(Some(ChildExit::Unknown)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sends `SIGTERM`. `Ok(false)` if the process no longer exists.
    pub(crate) fn request_stop(&self) -> io::Result<bool> {
        self.send(Signal::SIGTERM)
    }

    pub(crate) fn kill(&self) -> io::Result<bool> {
        self.send(Signal::SIGKILL)
    }

    fn send(&self, sig: Signal) -> io::Result<bool> {
        match signal::kill(self.pid, sig) {
            Ok(()) => Ok(true),
            Err(nix::Error::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the child to exit until the deadline. `Ok(None)` on timeout.
    pub(crate) fn wait_timeout(
        &self,
        timeout_manager: &TimeoutManager,
    ) -> io::Result<Option<ChildExit>> {
        match reap_child(self.pid, timeout_manager) {
            Ok(Some(status)) => Ok(Some(exit_from_status(status).unwrap_or(ChildExit::Unknown))),
            Ok(None) => Ok(Some(ChildExit::Unknown)),
            Err(ReapError::Timeout) => Ok(None),
            Err(ReapError::WaitError(e)) => Err(e.into()),
        }
    }
}

fn exit_from_status(status: WaitStatus) -> Option<ChildExit> {
    match status {
        WaitStatus::Exited(_, code) => Some(ChildExit::Code(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ChildExit::Signal(sig as i32)),
        _ => None,
    }
}

fn raw_fd(endpoint: &PipeEndpoint) -> Result<RawFd, ProcessError> {
    endpoint
        .handle()
        .map(|fd| fd.as_raw_fd())
        .ok_or_else(|| {
            ProcessError::Pipe(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe endpoint closed before spawn",
            ))
        })
}

/// Runs in the forked child. Only async-signal safe calls from here on.
fn run_child(execve: &PreparedExecve, stdin_fd: RawFd, stdout_fd: RawFd, error_fd: RawFd) -> ! {
    // Move both ends above the standard descriptors first, so that wiring one of them up
    // cannot clobber the other (the parent may have been started with stdin or stdout closed).
    // SAFETY: plain descriptor manipulation on descriptors we own.
    unsafe {
        let stdin_fd = libc::fcntl(stdin_fd, libc::F_DUPFD_CLOEXEC, 3);
        let stdout_fd = libc::fcntl(stdout_fd, libc::F_DUPFD_CLOEXEC, 3);
        if stdin_fd < 0
            || stdout_fd < 0
            || libc::dup2(stdin_fd, libc::STDIN_FILENO) < 0
            || libc::dup2(stdout_fd, libc::STDOUT_FILENO) < 0
        {
            report_exec_error(error_fd, nix::errno::Errno::last_raw());
        }

        // Rust ignores SIGPIPE; the child gets the default disposition back, as `Command` does.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    }

    let errno = execve.exec();
    report_exec_error(error_fd, errno as i32)
}

fn report_exec_error(error_fd: RawFd, errno: i32) -> ! {
    let bytes = errno.to_ne_bytes();
    // SAFETY: `bytes` is valid for its length. If this write fails the parent sees EOF, treats
    // the spawn as successful and later observes exit code 127.
    unsafe { libc::write(error_fd, bytes.as_ptr().cast(), bytes.len()) };
    terminate(EXEC_FAILED)
}
