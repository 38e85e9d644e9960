// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::InstanceError;
use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicPtr, Ordering};
use warden_common::unix_utils::write_stderr;

// macOS limits semaphore names to PSEMNAMLEN (31) bytes, leading slash included. Linux allows
// NAME_MAX (255) minus the "sem." prefix glibc adds.
#[cfg(target_os = "macos")]
const MAX_NAME_LEN: usize = 31;
#[cfg(not(target_os = "macos"))]
const MAX_NAME_LEN: usize = 240;

// '-' followed by the 16 hex digits of the identifier hash.
const HASH_SUFFIX_LEN: usize = 17;

pub(super) struct NativeLock {
    name: CString,
    sem: AtomicPtr<libc::sem_t>,
}

impl NativeLock {
    /// `Ok(None)` if another process holds the lock.
    pub(super) fn try_create(identifier: &str) -> Result<Option<Self>, InstanceError> {
        let name = semaphore_name(identifier)?;
        // SAFETY: `name` is a valid C string; the variadic arguments are the mode and the
        // initial value, as sem_open(3) requires with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::EEXIST) {
                return Ok(None);
            }
            return Err(InstanceError::Create {
                name: name.to_string_lossy().into_owned(),
                source,
            });
        }
        Ok(Some(Self {
            name,
            sem: AtomicPtr::new(sem),
        }))
    }

    pub(super) fn release(&self) -> Result<(), InstanceError> {
        let sem = self.sem.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !sem.is_null() {
            // SAFETY: `sem` came from sem_open and is closed exactly once thanks to the swap.
            unsafe { libc::sem_close(sem) };
        }
        match unlink(&self.name) {
            Ok(_) => Ok(()),
            Err(source) => Err(InstanceError::Remove {
                name: self.name.to_string_lossy().into_owned(),
                source,
            }),
        }
    }

    /// Only removes the name: `sem_close` may take a lock inside libc, and the mapping goes
    /// away with the process anyway.
    pub(super) fn release_from_fault(&self) {
        // SAFETY: `name` is a valid C string allocated before any fault.
        if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
            write_stderr(b"warden: unable to unlink the instance lock semaphore\n");
        }
    }
}

/// Unlinks the name even if a live instance owns it. That owner's later `release` then
/// unlinks whatever semaphore holds the name at that point, which may belong to a third
/// instance started after the clear.
pub(super) fn force_clear(identifier: &str) -> Result<bool, InstanceError> {
    let name = semaphore_name(identifier)?;
    unlink(&name).map_err(|source| InstanceError::Remove {
        name: name.to_string_lossy().into_owned(),
        source,
    })
}

/// `Ok(false)` if the name did not exist.
fn unlink(name: &CString) -> io::Result<bool> {
    // SAFETY: `name` is a valid C string.
    if unsafe { libc::sem_unlink(name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let error = io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ENOENT) => Ok(false),
        _ => Err(error),
    }
}

/// Windows focuses the running instance; there is no portable equivalent here.
pub(super) fn focus_existing_window(_title: &str) -> io::Result<()> {
    tracing::debug!("Focusing the running instance is not supported on this platform");
    Ok(())
}

/// `/<readable prefix>-<hash>`. The prefix keeps the name recognizable in `/dev/shm`, the
/// hash of the full identifier keeps distinct identifiers apart after sanitizing and truncation.
fn semaphore_name(identifier: &str) -> Result<CString, InstanceError> {
    if identifier.contains('\0') {
        return Err(InstanceError::InvalidIdentifier(identifier.to_string()));
    }
    let mut name = String::with_capacity(MAX_NAME_LEN);
    name.push('/');
    name.extend(
        identifier
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_NAME_LEN - 1 - HASH_SUFFIX_LEN),
    );
    name.push_str(&format!("-{:016x}", fnv1a(identifier.as_bytes())));
    CString::new(name).map_err(|_| InstanceError::InvalidIdentifier(identifier.to_string()))
}

/// 64-bit FNV-1a. Stable across builds and platforms, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(name: &CString) -> &[u8] {
        let bytes = name.as_bytes();
        &bytes[..bytes.len() - HASH_SUFFIX_LEN]
    }

    #[test]
    fn test_semaphore_name() {
        let name = semaphore_name("my-game").unwrap();
        assert_eq!(prefix(&name), b"/my-game");
        assert_eq!(name.as_bytes().len(), "/my-game".len() + HASH_SUFFIX_LEN);
        assert_eq!(name, semaphore_name("my-game").unwrap());

        let name = semaphore_name("My Game/2: Return").unwrap();
        assert!(name.as_bytes().starts_with(b"/My_Game_2__"));

        let long = semaphore_name(&"x".repeat(1000)).unwrap();
        assert_eq!(long.as_bytes().len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_semaphore_name_keeps_identifiers_apart() {
        let pairs = [
            ("x game 1", "x_game_1"),
            ("a/b", "a:b"),
            (
                "com.example.long-application-name-alpha",
                "com.example.long-application-name-beta",
            ),
        ];
        for (a, b) in pairs {
            assert_ne!(semaphore_name(a).unwrap(), semaphore_name(b).unwrap(), "{a} vs {b}");
        }
    }

    #[test]
    fn test_semaphore_name_rejects_nul() {
        assert!(matches!(
            semaphore_name("a\0b"),
            Err(InstanceError::InvalidIdentifier(_))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_release_from_fault_reports_missing_name() {
        let id = format!("wt-fault-unlink-{}", std::process::id());
        let lock = NativeLock::try_create(&id).unwrap().unwrap();
        lock.release_from_fault();
        assert!(!force_clear(&id).unwrap());
        // The name is gone; the second unlink fails and only writes to stderr.
        lock.release_from_fault();
        // Closing still works and a missing name is not an error.
        lock.release().unwrap();
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
