// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One running instance per machine, enforced with a named OS object.
//!
//! On POSIX the lock is a named semaphore created with `O_EXCL`: it exists exactly while an
//! instance owns it. A process killed before releasing leaves the name behind, which is what
//! [`InstanceGuard::force_clear`] is for. On Windows the lock is a named mutex in the `Global\`
//! namespace, which the OS cleans up with its last handle.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as native;
#[cfg(windows)]
use windows as native;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Invalid instance identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("Failed to create instance lock {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },
    #[error("Failed to remove instance lock {name}: {source}")]
    Remove {
        name: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceOptions {
    // Substring of the running instance's window title. Defaults to the identifier.
    window_title: Option<String>,
}

impl InstanceOptions {
    pub fn with_window_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = Some(title.into());
        self
    }

    pub fn window_title(&self) -> Option<&str> {
        self.window_title.as_deref()
    }
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(InstanceGuard),
    AlreadyRunning,
}

struct LockState {
    owned: AtomicBool,
    native: native::NativeLock,
}

impl LockState {
    fn release(&self) -> Result<(), InstanceError> {
        if self.owned.swap(false, Ordering::SeqCst) {
            self.native.release()?;
        }
        Ok(())
    }
}

/// Ownership of the machine-wide instance lock. Released on drop.
pub struct InstanceGuard {
    identifier: String,
    state: Arc<LockState>,
}

impl InstanceGuard {
    pub fn acquire(identifier: &str) -> Result<AcquireOutcome, InstanceError> {
        Self::acquire_with(identifier, &InstanceOptions::default())
    }

    /// Takes the lock for `identifier`, or reports that another instance holds it. In the
    /// latter case the other instance's window is brought to the foreground where the platform
    /// supports it; failing to do so is only logged.
    pub fn acquire_with(
        identifier: &str,
        options: &InstanceOptions,
    ) -> Result<AcquireOutcome, InstanceError> {
        if identifier.trim().is_empty() {
            return Err(InstanceError::InvalidIdentifier(identifier.to_string()));
        }
        match native::NativeLock::try_create(identifier)? {
            Some(native) => {
                debug!(identifier, "Acquired instance lock");
                Ok(AcquireOutcome::Acquired(Self {
                    identifier: identifier.to_string(),
                    state: Arc::new(LockState {
                        owned: AtomicBool::new(true),
                        native,
                    }),
                }))
            }
            None => {
                info!(identifier, "Another instance is already running");
                let title = options.window_title().unwrap_or(identifier);
                if let Err(e) = native::focus_existing_window(title) {
                    warn!(identifier, title, error = %e, "Unable to focus the running instance");
                }
                Ok(AcquireOutcome::AlreadyRunning)
            }
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_owned(&self) -> bool {
        self.state.owned.load(Ordering::SeqCst)
    }

    /// Idempotent.
    pub fn release(&mut self) -> Result<(), InstanceError> {
        self.state.release()
    }

    /// A handle that lets the fault handler drop the lock from fault context.
    pub fn termination_handle(&self) -> TerminationHandle {
        TerminationHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Removes a lock left behind by an instance that died without releasing it. Returns
    /// whether there was anything to remove. Never called automatically: a live instance's
    /// lock is removed just the same.
    ///
    /// On POSIX, clearing a live instance's lock also leaves that instance able to remove a
    /// lock taken afterwards by a third instance, since its eventual release unlinks by name.
    /// Only clear a lock whose owner is known to be gone.
    pub fn force_clear(identifier: &str) -> Result<bool, InstanceError> {
        if identifier.trim().is_empty() {
            return Err(InstanceError::InvalidIdentifier(identifier.to_string()));
        }
        let cleared = native::force_clear(identifier)?;
        if cleared {
            warn!(identifier, "Forcibly cleared instance lock");
        }
        Ok(cleared)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(identifier = %self.identifier, error = %e, "Failed to release instance lock");
        }
    }
}

impl std::fmt::Debug for InstanceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceGuard")
            .field("identifier", &self.identifier)
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Shares the lock of an [`InstanceGuard`] with the fault handler.
#[derive(Clone)]
pub struct TerminationHandle {
    state: Arc<LockState>,
}

impl TerminationHandle {
    pub fn is_owned(&self) -> bool {
        self.state.owned.load(Ordering::SeqCst)
    }

    /// Gives up the lock without allocating or taking locks, so it may run in a signal handler.
    /// The process is expected to exit right after.
    pub fn release_from_fault(&self) {
        if self.state.owned.swap(false, Ordering::SeqCst) {
            self.state.native.release_from_fault();
        }
    }
}

impl std::fmt::Debug for TerminationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationHandle")
            .field("owned", &self.is_owned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("wt-{name}-{}", std::process::id())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_acquire_release_cycle() {
        let id = unique("cycle");
        let AcquireOutcome::Acquired(mut guard) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id}");
        };
        assert!(guard.is_owned());
        assert_eq!(guard.identifier(), id);
        assert!(matches!(
            InstanceGuard::acquire(&id).unwrap(),
            AcquireOutcome::AlreadyRunning
        ));

        guard.release().unwrap();
        guard.release().unwrap();
        assert!(!guard.is_owned());

        let AcquireOutcome::Acquired(_again) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id} after release");
        };
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_drop_releases() {
        let id = unique("drop");
        let outcome = InstanceGuard::acquire(&id).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
        drop(outcome);
        assert!(matches!(
            InstanceGuard::acquire(&id).unwrap(),
            AcquireOutcome::Acquired(_)
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_termination_handle() {
        let id = unique("handle");
        let AcquireOutcome::Acquired(mut guard) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id}");
        };
        let handle = guard.termination_handle();
        assert!(handle.is_owned());
        handle.release_from_fault();
        assert!(!guard.is_owned());
        // Releasing again is a no-op.
        guard.release().unwrap();
        handle.release_from_fault();

        let AcquireOutcome::Acquired(_again) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id} after a fault release");
        };
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_similar_identifiers_do_not_collide() {
        let pid = std::process::id();
        let pairs = [
            (format!("x game {pid}"), format!("x_game_{pid}")),
            (
                format!("com.example.long-application-name-{pid}-alpha"),
                format!("com.example.long-application-name-{pid}-beta"),
            ),
        ];
        for (a, b) in pairs {
            let AcquireOutcome::Acquired(_first) = InstanceGuard::acquire(&a).unwrap() else {
                panic!("expected to acquire {a}");
            };
            let AcquireOutcome::Acquired(_second) = InstanceGuard::acquire(&b).unwrap() else {
                panic!("expected to acquire {b} while {a} is held");
            };
        }
    }

    #[test]
    fn test_invalid_identifier() {
        assert!(matches!(
            InstanceGuard::acquire("  "),
            Err(InstanceError::InvalidIdentifier(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_force_clear() {
        let id = unique("stale");
        assert!(!InstanceGuard::force_clear(&id).unwrap());

        let AcquireOutcome::Acquired(guard) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id}");
        };
        // Simulate a crash: the lock outlives its owner.
        std::mem::forget(guard);
        assert!(matches!(
            InstanceGuard::acquire(&id).unwrap(),
            AcquireOutcome::AlreadyRunning
        ));
        assert!(InstanceGuard::force_clear(&id).unwrap());
        let AcquireOutcome::Acquired(_guard) = InstanceGuard::acquire(&id).unwrap() else {
            panic!("expected to acquire {id} after force_clear");
        };
    }
}
