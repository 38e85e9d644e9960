// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Everything `execve` needs, converted to C strings before the fork.
///
/// Building the argument and environment vectors allocates, which is not allowed between
/// `fork` and `exec` in a multi-threaded parent. Preparing them up front leaves the child
/// with nothing to do but pointer reads.
// The cstring vectors are just storage for the pointer vectors.
#[allow(dead_code)]
#[derive(Debug)]
pub struct PreparedExecve {
    binary_path: CString,
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    env_vars_cstrings: Vec<CString>,
    env_vars_ptrs: Vec<*const libc::c_char>,
}

#[derive(Debug, thiserror::Error)]
pub enum PreparedExecveError {
    #[error("Binary path contains an interior NUL byte: {0}")]
    BinaryPathError(std::ffi::NulError),
    #[error("Argument contains an interior NUL byte: {0}")]
    ArgumentError(std::ffi::NulError),
    #[error("Environment variable contains an interior NUL byte: {0}")]
    EnvironmentError(std::ffi::NulError),
}

fn to_cstring(s: &OsStr) -> Result<CString, std::ffi::NulError> {
    CString::new(s.as_bytes())
}

fn null_terminated(items: &[CString]) -> Vec<*const libc::c_char> {
    items
        .iter()
        .map(|item| item.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl PreparedExecve {
    /// `args` does not include `argv[0]`; the binary path is used for it.
    pub fn new<A, K, V>(
        binary_path: &Path,
        args: &[A],
        env: &[(K, V)],
    ) -> Result<Self, PreparedExecveError>
    where
        A: AsRef<OsStr>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let binary_path =
            to_cstring(binary_path.as_os_str()).map_err(PreparedExecveError::BinaryPathError)?;

        let mut args_cstrings = Vec::with_capacity(args.len() + 1);
        args_cstrings.push(binary_path.clone());
        for arg in args {
            args_cstrings.push(to_cstring(arg.as_ref()).map_err(PreparedExecveError::ArgumentError)?);
        }
        let args_ptrs = null_terminated(&args_cstrings);

        let env_vars_cstrings = env
            .iter()
            .map(|(key, value)| {
                let mut entry = OsString::from(key.as_ref());
                entry.push("=");
                entry.push(value.as_ref());
                to_cstring(&entry)
            })
            .collect::<Result<Vec<CString>, std::ffi::NulError>>()
            .map_err(PreparedExecveError::EnvironmentError)?;
        let env_vars_ptrs = null_terminated(&env_vars_cstrings);

        Ok(Self {
            binary_path,
            args_cstrings,
            args_ptrs,
            env_vars_cstrings,
            env_vars_ptrs,
        })
    }

    /// Calls `execve` on the prepared arguments. Only returns on failure.
    ///
    /// Async-signal safe: no allocation happens here, so it may run in a forked child.
    pub fn exec(&self) -> Errno {
        // SAFETY: the only way to make one of these is through `new`, which ensures that
        // everything is well-formed and NULL terminated.
        unsafe {
            libc::execve(
                self.binary_path.as_ptr(),
                self.args_ptrs.as_ptr(),
                self.env_vars_ptrs.as_ptr(),
            );
        }
        Errno::last()
    }

    pub fn argc(&self) -> usize {
        self.args_cstrings.len()
    }
}

#[cfg(test)]
mod tests {
    // None of these tests call exec(): it would replace the test runner. The executor tests in
    // the warden crate exercise the full fork and exec path.
    use super::*;

    fn no_env() -> Vec<(String, String)> {
        vec![]
    }

    #[test]
    fn test_prepared_execve_prepends_binary_as_argv0() {
        let prepared =
            PreparedExecve::new(Path::new("/bin/echo"), &["hello", "world"], &no_env()).unwrap();
        assert_eq!(prepared.argc(), 3);
    }

    #[test]
    fn test_prepared_execve_empty_args() {
        let args: [&str; 0] = [];
        let prepared = PreparedExecve::new(Path::new("/bin/true"), &args, &no_env()).unwrap();
        assert_eq!(prepared.argc(), 1);
    }

    #[test]
    fn test_prepared_execve_accepts_unicode() {
        let env = vec![("UNICODE".to_string(), "value with 🦀".to_string())];
        PreparedExecve::new(Path::new("/bin/echo"), &["with émojis"], &env).unwrap();
    }

    #[test]
    fn test_prepared_execve_error_variants() {
        let result = PreparedExecve::new(Path::new("/bin/test\0"), &["a"], &no_env());
        assert!(matches!(
            result.unwrap_err(),
            PreparedExecveError::BinaryPathError(_)
        ));

        let result = PreparedExecve::new(Path::new("/bin/test"), &["arg\0"], &no_env());
        assert!(matches!(
            result.unwrap_err(),
            PreparedExecveError::ArgumentError(_)
        ));

        let env = vec![("KEY\0".to_string(), "value".to_string())];
        let args: [&str; 0] = [];
        let result = PreparedExecve::new(Path::new("/bin/test"), &args, &env);
        assert!(matches!(
            result.unwrap_err(),
            PreparedExecveError::EnvironmentError(_)
        ));
    }
}
