// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libc::{_exit, nfds_t, poll, pollfd, POLLHUP, POLLIN};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;

use super::errors::{PollError, ReapError};
use crate::timeout::TimeoutManager;

/// Reaps `pid` without blocking past the deadline of `timeout_manager`.
/// * `Ok(Some(status))` once the child has exited (or was killed by a signal)
/// * `Ok(None)` if the child is unknown, e.g. it was already reaped
/// * `Err(ReapError::Timeout)` if it is still alive when the deadline passes
// Note: `waitpid()` is async-signal safe per POSIX, so this may run on the fatal-fault path.
pub fn reap_child(
    pid: Pid,
    timeout_manager: &TimeoutManager,
) -> Result<Option<WaitStatus>, ReapError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.expired() {
                    return Err(ReapError::Timeout);
                }
                timeout_manager.sleep_slice();
            }
            Ok(status) => return Ok(Some(status)),
            Err(nix::Error::ECHILD) => return Ok(None),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(ReapError::WaitError(e)),
        }
    }
}

/// Ends the process with `code` without unwinding, running atexit handlers or flushing stdio.
pub fn terminate(code: i32) -> ! {
    // Safety: No preconditions
    unsafe { _exit(code) }
}

/// Waits until `target_fd` has data to read or its writer hung up.
/// `Ok(true)` if it became readable, `Ok(false)` on timeout.
pub fn wait_for_readable(
    target_fd: RawFd,
    timeout_manager: &TimeoutManager,
) -> Result<bool, PollError> {
    let mut poll_fds = [pollfd {
        fd: target_fd,
        events: POLLIN,
        revents: 0,
    }];

    loop {
        let timeout_ms = timeout_manager.remaining_ms();
        let poll_result =
            unsafe { poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) };
        match poll_result {
            -1 => match nix::Error::last_raw() {
                libc::EAGAIN | libc::EINTR => continue,
                errno => return Err(PollError::PollError(errno)),
            },
            0 => return Ok(false),
            _ => {
                let revents = poll_fds[0].revents;
                if revents & (POLLIN | POLLHUP) != 0 {
                    return Ok(true);
                }
                return Err(PollError::UnexpectedResult(revents));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, pipe, write, ForkResult};
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_reap_unknown_pid() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        let result = reap_child(Pid::from_raw(99999), &manager);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reap_exited_child() {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => terminate(7),
            ForkResult::Parent { child } => child,
        };
        let manager = TimeoutManager::new(Duration::from_secs(5));
        let status = reap_child(child, &manager).unwrap();
        assert_eq!(status, Some(WaitStatus::Exited(child, 7)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reap_times_out_on_live_child() {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                unsafe { libc::sleep(5) };
                terminate(0)
            }
            ForkResult::Parent { child } => child,
        };
        let manager = TimeoutManager::new(Duration::from_millis(20));
        assert_eq!(reap_child(child, &manager), Err(ReapError::Timeout));

        nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL).unwrap();
        let manager = TimeoutManager::new(Duration::from_secs(5));
        assert!(matches!(
            reap_child(child, &manager),
            Ok(Some(WaitStatus::Signaled(..)))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_wait_for_readable() {
        let (rx, tx) = pipe().unwrap();
        let manager = TimeoutManager::new(Duration::from_millis(10));
        assert_eq!(wait_for_readable(rx.as_raw_fd(), &manager), Ok(false));

        write(&tx, b"x").unwrap();
        let manager = TimeoutManager::new(Duration::from_secs(1));
        assert_eq!(wait_for_readable(rx.as_raw_fd(), &manager), Ok(true));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_wait_for_readable_on_hangup() {
        let (rx, tx) = pipe().unwrap();
        drop(tx);
        let manager = TimeoutManager::new(Duration::from_secs(1));
        assert_eq!(wait_for_readable(rx.as_raw_fd(), &manager), Ok(true));
    }

    #[test]
    fn test_wait_for_readable_negative_fd_times_out() {
        // poll ignores negative descriptors
        let manager = TimeoutManager::new(Duration::from_millis(10));
        assert_eq!(wait_for_readable(-1, &manager), Ok(false));
    }
}
