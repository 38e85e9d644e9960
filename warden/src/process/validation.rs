// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which executables a [`super::ProcessExecutor`] is willing to start.
///
/// Every check runs before the fork (or `CreateProcessW`), so a rejected path never produces a
/// child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    // Empty means any directory.
    allowed_dirs: Vec<PathBuf>,
    require_absolute: bool,
    reject_world_writable: bool,
}

impl TrustPolicy {
    pub fn new(
        allowed_dirs: Vec<PathBuf>,
        require_absolute: bool,
        reject_world_writable: bool,
    ) -> Self {
        Self {
            allowed_dirs,
            require_absolute,
            reject_world_writable,
        }
    }

    /// Only the built-in existence and permission checks.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Absolute paths only, no world-writable binaries, and only from `allowed_dirs`.
    pub fn strict(allowed_dirs: Vec<PathBuf>) -> Self {
        Self::new(allowed_dirs, true, true)
    }

    pub fn allowed_dirs(&self) -> &[PathBuf] {
        &self.allowed_dirs
    }

    /// Checks `path` and returns its canonical form, which is what gets executed.
    pub fn validate(&self, path: &Path) -> Result<PathBuf, ValidationError> {
        if self.require_absolute && !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.to_path_buf()));
        }

        let metadata = std::fs::metadata(path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ValidationError::NotFound(path.to_path_buf()),
            _ => ValidationError::Inspect {
                path: path.to_path_buf(),
                source,
            },
        })?;
        if !metadata.is_file() {
            return Err(ValidationError::NotAFile(path.to_path_buf()));
        }
        self.check_permissions(path, &metadata)?;

        let canonical = path
            .canonicalize()
            .map_err(|source| ValidationError::Inspect {
                path: path.to_path_buf(),
                source,
            })?;

        if !self.allowed_dirs.is_empty() {
            let trusted = self.allowed_dirs.iter().any(|dir| {
                dir.canonicalize()
                    .map(|dir| canonical.starts_with(dir))
                    .unwrap_or(false)
            });
            if !trusted {
                return Err(ValidationError::Untrusted(canonical));
            }
        }
        Ok(canonical)
    }

    #[cfg(unix)]
    fn check_permissions(
        &self,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<(), ValidationError> {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(ValidationError::NotExecutable(path.to_path_buf()));
        }
        if self.reject_world_writable && mode & 0o002 != 0 {
            return Err(ValidationError::WorldWritable(path.to_path_buf()));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn check_permissions(
        &self,
        path: &Path,
        _metadata: &std::fs::Metadata,
    ) -> Result<(), ValidationError> {
        let executable = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("exe") || ext.eq_ignore_ascii_case("com"))
            .unwrap_or(false);
        if !executable {
            return Err(ValidationError::NotExecutable(path.to_path_buf()));
        }
        Ok(())
    }
}

/// Looks `program` up in `PATH`, the way a shell would. Used to locate helper tools; the result
/// still goes through [`TrustPolicy::validate`] when spawned.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| TrustPolicy::permissive().validate(candidate).is_ok())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn make_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_missing_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let policy = TrustPolicy::permissive();
        assert!(matches!(
            policy.validate(&dir.path().join("nope")),
            Err(ValidationError::NotFound(_))
        ));
        assert!(matches!(
            policy.validate(dir.path()),
            Err(ValidationError::NotAFile(_))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let plain = make_file(dir.path(), "plain", 0o644);
        let shared = make_file(dir.path(), "shared", 0o777);
        let good = make_file(dir.path(), "good", 0o755);

        let permissive = TrustPolicy::permissive();
        assert!(matches!(
            permissive.validate(&plain),
            Err(ValidationError::NotExecutable(_))
        ));
        assert!(permissive.validate(&shared).is_ok());
        assert_eq!(
            permissive.validate(&good).unwrap(),
            good.canonicalize().unwrap()
        );

        let strict = TrustPolicy::strict(vec![]);
        assert!(matches!(
            strict.validate(&shared),
            Err(ValidationError::WorldWritable(_))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_allowed_dirs() {
        let trusted = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let inside = make_file(trusted.path(), "tool", 0o755);
        let outside = make_file(other.path(), "tool", 0o755);

        let policy = TrustPolicy::strict(vec![trusted.path().to_path_buf()]);
        assert!(policy.validate(&inside).is_ok());
        assert!(matches!(
            policy.validate(&outside),
            Err(ValidationError::Untrusted(_))
        ));
    }

    #[test]
    fn test_relative_rejected_when_absolute_required() {
        let policy = TrustPolicy::new(vec![], true, false);
        assert!(matches!(
            policy.validate(Path::new("bin/tool")),
            Err(ValidationError::NotAbsolute(_))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("surely-no-such-binary-anywhere").is_none());
    }
}
