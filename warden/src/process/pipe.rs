// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One unidirectional OS pipe and the bookkeeping of its two ends.
//!
//! Both ends are created non-inheritable (`O_CLOEXEC` / no `HANDLE_FLAG_INHERIT`). The child gets
//! its end by duplication at spawn time (`dup2` onto stdin/stdout, or handle inheritance on
//! Windows), after which the parent closes its copy.

use std::io;

#[cfg(unix)]
pub type NativeHandle = std::os::fd::OwnedFd;
#[cfg(windows)]
pub type NativeHandle = std::os::windows::io::OwnedHandle;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug)]
pub struct PipeEndpoint {
    direction: Direction,
    // `None` once closed. A closed endpoint is never used for I/O again.
    handle: Option<NativeHandle>,
}

impl PipeEndpoint {
    fn new(direction: Direction, handle: NativeHandle) -> Self {
        Self {
            direction,
            handle: Some(handle),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn handle(&self) -> Option<&NativeHandle> {
        self.handle.as_ref()
    }

    /// Releases the handle. Idempotent.
    pub fn close(&mut self) {
        self.handle = None;
    }

    fn usable_for(&self, direction: Direction) -> io::Result<&NativeHandle> {
        if self.direction != direction {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} end of a pipe used for {direction:?}", self.direction),
            ));
        }
        self.handle.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe endpoint already closed")
        })
    }

    /// Blocks until at least one byte is available or the writer is gone. `Ok(0)` is end of file.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.usable_for(Direction::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }
        native::read(handle, buf)
    }

    /// Blocks until the OS accepts at least one byte.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.usable_for(Direction::Write)?;
        if buf.is_empty() {
            return Ok(0);
        }
        native::write(handle, buf)
    }
}

#[derive(Debug)]
pub struct PipeChannel {
    read: PipeEndpoint,
    write: PipeEndpoint,
}

impl PipeChannel {
    pub fn new() -> io::Result<Self> {
        let (read, write) = native::create_pipe()?;
        Ok(Self {
            read: PipeEndpoint::new(Direction::Read, read),
            write: PipeEndpoint::new(Direction::Write, write),
        })
    }

    pub fn read_end(&self) -> &PipeEndpoint {
        &self.read
    }

    pub fn write_end(&self) -> &PipeEndpoint {
        &self.write
    }

    pub fn read_end_mut(&mut self) -> &mut PipeEndpoint {
        &mut self.read
    }

    pub fn write_end_mut(&mut self) -> &mut PipeEndpoint {
        &mut self.write
    }

    pub fn close(&mut self) {
        self.read.close();
        self.write.close();
    }
}

#[cfg(unix)]
mod native {
    use super::NativeHandle;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd};

    pub(super) fn create_pipe() -> io::Result<(NativeHandle, NativeHandle)> {
        let mut fds = [-1; 2];
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        {
            // SAFETY: `fds` has room for the two descriptors.
            if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        {
            // SAFETY: `fds` has room for the two descriptors.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                // SAFETY: `fd` was just returned by pipe().
                if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe {
                        libc::close(fds[0]);
                        libc::close(fds[1]);
                    }
                    return Err(err);
                }
            }
        }
        // SAFETY: both descriptors are open and owned by nobody else.
        Ok(unsafe { (NativeHandle::from_raw_fd(fds[0]), NativeHandle::from_raw_fd(fds[1])) })
    }

    pub(super) fn read(handle: &NativeHandle, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let n = unsafe { libc::read(handle.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub(super) fn write(handle: &NativeHandle, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let n = unsafe { libc::write(handle.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

#[cfg(windows)]
mod native {
    use super::NativeHandle;
    use std::io;
    use std::os::windows::io::{AsRawHandle, FromRawHandle};
    use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, HANDLE};
    use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
    use windows::Win32::System::Pipes::CreatePipe;

    pub(super) fn create_pipe() -> io::Result<(NativeHandle, NativeHandle)> {
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        // No security attributes: neither end is inheritable until spawn marks the child's end.
        unsafe { CreatePipe(&mut read, &mut write, None, 0) }.map_err(io::Error::from)?;
        // SAFETY: both handles were just created and are owned by nobody else.
        Ok(unsafe {
            (
                NativeHandle::from_raw_handle(read.0),
                NativeHandle::from_raw_handle(write.0),
            )
        })
    }

    pub(super) fn read(handle: &NativeHandle, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0u32;
        let len = buf.len().min(u32::MAX as usize);
        let result = unsafe {
            ReadFile(
                HANDLE(handle.as_raw_handle()),
                Some(&mut buf[..len]),
                Some(&mut read),
                None,
            )
        };
        match result {
            Ok(()) => Ok(read as usize),
            // The writer closed its end: end of file.
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    pub(super) fn write(handle: &NativeHandle, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0u32;
        let len = buf.len().min(u32::MAX as usize);
        unsafe {
            WriteFile(
                HANDLE(handle.as_raw_handle()),
                Some(&buf[..len]),
                Some(&mut written),
                None,
            )
        }
        .map_err(io::Error::from)?;
        Ok(written as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_round_trip_and_eof() {
        let mut channel = PipeChannel::new().unwrap();
        assert_eq!(channel.write_end().write(b"hello").unwrap(), 5);
        channel.write_end_mut().close();
        assert!(!channel.write_end().is_valid());

        let mut buf = [0u8; 16];
        let n = channel.read_end().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(channel.read_end().read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_closed_endpoint_is_never_reused() {
        let mut channel = PipeChannel::new().unwrap();
        channel.close();
        channel.close();
        assert!(channel.write_end().write(b"x").is_err());
        assert!(channel.read_end().read(&mut [0u8; 1]).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_wrong_direction() {
        let channel = PipeChannel::new().unwrap();
        let err = channel.read_end().write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_ends_are_close_on_exec() {
        use std::os::fd::AsRawFd;
        let channel = PipeChannel::new().unwrap();
        for end in [channel.read_end(), channel.write_end()] {
            let fd = end.handle().unwrap().as_raw_fd();
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }
}
