// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::errors::ProcessError;
use super::pipe::{NativeHandle, PipeEndpoint};
use super::ChildExit;
use std::ffi::{c_void, OsStr, OsString};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle};
use std::path::Path;
use warden_common::timeout::TimeoutManager;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};
use windows::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject,
    CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
};

// Exit code given to a child ended by `TerminateProcess`.
const TERMINATED_EXIT_CODE: u32 = 1;

pub(crate) struct NativeChild {
    process: NativeHandle,
    pid: u32,
}

impl NativeChild {
    /// Starts `path` with `stdin` and `stdout` (the child's ends of the two channels) as its
    /// standard handles. The two ends are made inheritable only for the duration of the call.
    pub(crate) fn spawn(
        path: &Path,
        args: &[OsString],
        env: &[(OsString, OsString)],
        stdin: &PipeEndpoint,
        stdout: &PipeEndpoint,
    ) -> Result<Self, ProcessError> {
        let stdin = raw_handle(stdin)?;
        let stdout = raw_handle(stdout)?;

        let application: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let mut command_line = Vec::new();
        append_quoted(path.as_os_str(), &mut command_line);
        for arg in args {
            command_line.push(b' ' as u16);
            append_quoted(arg, &mut command_line);
        }
        command_line.push(0);
        let environment = environment_block(env);

        let mut startup_info = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            dwFlags: STARTF_USESTDHANDLES,
            hStdInput: stdin,
            hStdOutput: stdout,
            hStdError: unsafe { GetStdHandle(STD_ERROR_HANDLE) }.unwrap_or_default(),
            ..Default::default()
        };
        let mut process_info = PROCESS_INFORMATION::default();

        let spawn_error = |source: io::Error| ProcessError::Spawn {
            path: path.to_path_buf(),
            source,
        };
        set_inheritable(stdin, true).map_err(spawn_error)?;
        set_inheritable(stdout, true).map_err(spawn_error)?;
        let created = unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                Some(PWSTR(command_line.as_mut_ptr())),
                None,
                None,
                true,
                CREATE_UNICODE_ENVIRONMENT,
                Some(environment.as_ptr() as *const c_void),
                PCWSTR::null(),
                &mut startup_info,
                &mut process_info,
            )
        };
        let _ = set_inheritable(stdin, false);
        let _ = set_inheritable(stdout, false);
        created.map_err(|e| spawn_error(e.into()))?;

        let _ = unsafe { CloseHandle(process_info.hThread) };
        Ok(Self {
            // SAFETY: the process handle was just returned to us and is owned by nobody else.
            process: unsafe { NativeHandle::from_raw_handle(process_info.hProcess.0) },
            pid: process_info.dwProcessId,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.pid
    }

    fn handle(&self) -> HANDLE {
        HANDLE(self.process.as_raw_handle())
    }

    pub(crate) fn try_wait(&self) -> io::Result<Option<ChildExit>> {
        self.wait_ms(0)
    }

    /// Windows has no graceful termination request for an arbitrary process, so this ends the
    /// child outright. `Ok(false)` if it had already exited.
    pub(crate) fn request_stop(&self) -> io::Result<bool> {
        self.kill()
    }

    pub(crate) fn kill(&self) -> io::Result<bool> {
        if self.try_wait()?.is_some() {
            return Ok(false);
        }
        unsafe { TerminateProcess(self.handle(), TERMINATED_EXIT_CODE) }.map_err(io::Error::from)?;
        Ok(true)
    }

    pub(crate) fn wait_timeout(
        &self,
        timeout_manager: &TimeoutManager,
    ) -> io::Result<Option<ChildExit>> {
        self.wait_ms(timeout_manager.remaining_ms().max(0) as u32)
    }

    fn wait_ms(&self, ms: u32) -> io::Result<Option<ChildExit>> {
        let event = unsafe { WaitForSingleObject(self.handle(), ms) };
        if event == WAIT_TIMEOUT {
            return Ok(None);
        }
        if event != WAIT_OBJECT_0 {
            return Err(io::Error::last_os_error());
        }
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(self.handle(), &mut code) }.map_err(io::Error::from)?;
        Ok(Some(ChildExit::Code(code as i32)))
    }
}

fn raw_handle(endpoint: &PipeEndpoint) -> Result<HANDLE, ProcessError> {
    endpoint
        .handle()
        .map(|handle| HANDLE(handle.as_raw_handle()))
        .ok_or_else(|| {
            ProcessError::Pipe(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe endpoint closed before spawn",
            ))
        })
}

fn set_inheritable(handle: HANDLE, inheritable: bool) -> io::Result<()> {
    let flags = if inheritable {
        HANDLE_FLAG_INHERIT
    } else {
        HANDLE_FLAGS(0)
    };
    unsafe { SetHandleInformation(handle, HANDLE_FLAG_INHERIT.0, flags) }.map_err(io::Error::from)
}

/// `KEY=VALUE\0...\0\0`, as `CreateProcessW` expects with `CREATE_UNICODE_ENVIRONMENT`.
fn environment_block(env: &[(OsString, OsString)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in env {
        block.extend(key.encode_wide());
        block.push(b'=' as u16);
        block.extend(value.encode_wide());
        block.push(0);
    }
    if env.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Quotes one argument following the rules `CommandLineToArgvW` and the MSVC runtime use to
/// split a command line.
fn append_quoted(arg: &OsStr, out: &mut Vec<u16>) {
    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    let wide: Vec<u16> = arg.encode_wide().collect();
    let needs_quotes = wide.is_empty()
        || wide
            .iter()
            .any(|&c| c == b' ' as u16 || c == b'\t' as u16 || c == QUOTE);
    if !needs_quotes {
        out.extend(wide);
        return;
    }

    out.push(QUOTE);
    let mut backslashes = 0;
    for c in wide {
        if c == BACKSLASH {
            backslashes += 1;
            continue;
        }
        if c == QUOTE {
            // Escape the backslashes preceding a quote, then the quote itself.
            out.extend(std::iter::repeat(BACKSLASH).take(backslashes * 2 + 1));
        } else {
            out.extend(std::iter::repeat(BACKSLASH).take(backslashes));
        }
        backslashes = 0;
        out.push(c);
    }
    // Backslashes before the closing quote must be doubled.
    out.extend(std::iter::repeat(BACKSLASH).take(backslashes * 2));
    out.push(QUOTE);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quoted(arg: &str) -> String {
        let mut out = Vec::new();
        append_quoted(OsStr::new(arg), &mut out);
        String::from_utf16(&out).unwrap()
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quoted("plain"), "plain");
        assert_eq!(quoted(""), "\"\"");
        assert_eq!(quoted("two words"), "\"two words\"");
        assert_eq!(quoted(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quoted(r"C:\dir with space\"), r#""C:\dir with space\\""#);
    }

    #[test]
    fn test_environment_block() {
        let env = vec![(OsString::from("A"), OsString::from("1"))];
        let block = environment_block(&env);
        assert_eq!(String::from_utf16(&block).unwrap(), "A=1\0\0");
        assert_eq!(environment_block(&[]), vec![0, 0]);
    }
}
