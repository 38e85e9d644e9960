// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::state::{EscalationMachine, Phase};
use super::watchdog::{Notifier, ShutdownSink, Watchdog};
use crate::instance::TerminationHandle;
use crate::report::CrashReporter;
use crate::shared::configuration::FaultHandlerConfig;
use crate::shared::log_ring::LogRing;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use tracing::{debug, info, warn};

// Everything the fault callbacks need. Mutexes cannot be used inside a signal handler, so the
// context is published through an `AtomicPtr`. It is either null or comes from
// `Box::into_raw()`.
static CONTEXT: AtomicPtr<FaultContext> = AtomicPtr::new(ptr::null_mut());
static INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) struct FaultContext {
    pub(crate) machine: EscalationMachine,
    pub(crate) config: FaultHandlerConfig,
    pub(crate) reporter: CrashReporter,
    pub(crate) notifier: Notifier,
    instance_lock: Option<TerminationHandle>,
    /// Carries the collector's verdict back to the faulting process. Created up front: a
    /// fault handler cannot rely on `pipe(2)` succeeding.
    #[cfg(unix)]
    pub(crate) status_pipe: (std::os::fd::OwnedFd, std::os::fd::OwnedFd),
}

impl FaultContext {
    /// Frees the single-instance lock before the process dies, so that a restart is not
    /// refused.
    pub(crate) fn release_instance_lock(&self) {
        if let Some(lock) = &self.instance_lock {
            lock.release_from_fault();
        }
    }
}

/// The installed context, if any.
///
/// The reference is only valid until [`FaultHandler::teardown`]. Callbacks that race with
/// teardown must not outlive it.
pub(crate) fn context() -> Option<&'static FaultContext> {
    let ptr = CONTEXT.load(SeqCst);
    // SAFETY: non-null values come from `Box::into_raw` in `install` and are only freed by
    // `teardown`, after the handlers have been unregistered.
    unsafe { ptr.as_ref() }
}

/// What the fault handler talks to.
pub struct Collaborators {
    sink: Box<dyn ShutdownSink>,
    log_ring: Option<LogRing>,
    instance_lock: Option<TerminationHandle>,
}

impl Collaborators {
    /// `sink` receives graceful shutdown requests, on the watchdog thread.
    pub fn new(sink: impl ShutdownSink) -> Self {
        Self {
            sink: Box::new(sink),
            log_ring: None,
            instance_lock: None,
        }
    }

    /// Recent log lines for the report's log tail.
    pub fn with_log_ring(mut self, log_ring: LogRing) -> Self {
        self.log_ring = Some(log_ring);
        self
    }

    /// Released before the process terminates on a fatal or escalated fault.
    pub fn with_instance_lock(mut self, handle: TerminationHandle) -> Self {
        self.instance_lock = Some(handle);
        self
    }
}

/// The process wide fault handler. At most one is installed at a time.
///
/// Install it before any other subsystem and tear it down last. Dropping it tears it down.
#[derive(Debug)]
pub struct FaultHandler {
    watchdog: Option<Watchdog>,
    command_line: Vec<String>,
    report_path: std::path::PathBuf,
    torn_down: bool,
}

impl FaultHandler {
    /// Registers the OS callbacks and starts the watchdog thread.
    ///
    /// Fails if a handler is already installed.
    pub fn install(
        config: FaultHandlerConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            INSTALLED
                .compare_exchange(false, true, SeqCst, SeqCst)
                .is_ok(),
            "A fault handler is already installed"
        );
        let result = Self::install_inner(config, collaborators);
        if result.is_err() {
            INSTALLED.store(false, SeqCst);
        }
        result
    }

    fn install_inner(
        config: FaultHandlerConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let Collaborators {
            sink,
            log_ring,
            instance_lock,
        } = collaborators;
        #[cfg(unix)]
        let status_pipe = status_pipe()?;
        let reporter = CrashReporter::new(config.reporter().clone(), log_ring);
        let watchdog = Watchdog::spawn(sink, u32::from(config.max_attempts()))?;

        let mut handler = Self {
            command_line: config.reporter().command_line().to_vec(),
            report_path: reporter.report_path().to_path_buf(),
            watchdog: None,
            torn_down: false,
        };

        let boxed = Box::new(FaultContext {
            machine: EscalationMachine::new(config.max_attempts()),
            notifier: watchdog.notifier(),
            reporter,
            instance_lock,
            #[cfg(unix)]
            status_pipe,
            config,
        });
        handler.watchdog = Some(watchdog);

        let old = CONTEXT.swap(Box::into_raw(boxed), SeqCst);
        if !old.is_null() {
            // SAFETY: came from `Box::into_raw` in an earlier install.
            drop(unsafe { Box::from_raw(old) });
        }

        if let Err(e) = register_callbacks() {
            // Undo whatever was registered; `INSTALLED` is reset by the caller.
            if let Err(restore_error) = handler.unregister() {
                warn!(error = %restore_error, "Failed to roll back fault handler installation");
            }
            handler.torn_down = true;
            return Err(e);
        }

        if let Some(context) = context() {
            info!(
                max_attempts = context.machine.max_attempts(),
                report_path = %handler.report_path.display(),
                "Fault handler installed"
            );
        }
        Ok(handler)
    }

    /// Where the escalation machine is. `Phase::Normal` once torn down.
    pub fn phase(&self) -> Phase {
        context()
            .map(|context| context.machine.phase())
            .unwrap_or(Phase::Normal)
    }

    /// The command line to use to start the application again after a crash, as configured.
    pub fn restart_command(&self) -> &[String] {
        &self.command_line
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    /// Restores the previous handlers, stops the watchdog and frees the context, in that
    /// order.
    pub fn teardown(mut self) -> anyhow::Result<()> {
        self.torn_down = true;
        let result = self.unregister();
        INSTALLED.store(false, SeqCst);
        result
    }

    fn unregister(&mut self) -> anyhow::Result<()> {
        let restored = unregister_callbacks();

        let ptr = CONTEXT.swap(ptr::null_mut(), SeqCst);
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        if !ptr.is_null() {
            // SAFETY: came from `Box::into_raw` in `install`. The callbacks are unregistered.
            drop(unsafe { Box::from_raw(ptr) });
        }
        debug!("Fault handler removed");
        restored
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(e) = self.unregister() {
            warn!(error = %e, "Failed to restore previous fault handlers");
        }
        INSTALLED.store(false, SeqCst);
    }
}

#[cfg(unix)]
fn register_callbacks() -> anyhow::Result<()> {
    let config = context()
        .map(|context| &context.config)
        .ok_or_else(|| anyhow::anyhow!("No fault handler context"))?;
    super::signal_handler_manager::register_handlers(config)
}

#[cfg(unix)]
fn unregister_callbacks() -> anyhow::Result<()> {
    super::signal_handler_manager::restore_handlers()
}

#[cfg(windows)]
fn register_callbacks() -> anyhow::Result<()> {
    super::exception_filter::install()
}

#[cfg(windows)]
fn unregister_callbacks() -> anyhow::Result<()> {
    super::exception_filter::uninstall()
}

#[cfg(unix)]
fn status_pipe() -> anyhow::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;

    let (read_end, write_end) = nix::unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_end, write_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::ShutdownRequest;
    use std::sync::mpsc;

    // Installation is process wide; everything that installs lives in this one test.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_install_request_shutdown_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FaultHandlerConfig::default();
        config.set_max_attempts(5).unwrap();
        config.reporter_mut().set_headless(true);
        config.reporter_mut().set_show_notice(false);
        config
            .reporter_mut()
            .set_report_path(Some(dir.path().join("report.crash.txt")))
            .unwrap();
        config
            .reporter_mut()
            .set_command_line(vec!["game".to_string(), "--safe-mode".to_string()]);

        let (tx, rx) = mpsc::channel::<ShutdownRequest>();
        let handler = FaultHandler::install(config.clone(), Collaborators::new(tx)).unwrap();
        assert_eq!(handler.phase(), Phase::Normal);
        assert_eq!(handler.restart_command(), ["game", "--safe-mode"]);
        assert_eq!(handler.report_path(), dir.path().join("report.crash.txt"));

        let (other_tx, _other_rx) = mpsc::channel::<ShutdownRequest>();
        assert!(FaultHandler::install(config.clone(), Collaborators::new(other_tx)).is_err());

        #[cfg(unix)]
        {
            use crate::fault::classifier::FaultId;
            use std::time::Duration;

            // SAFETY: the handler is installed for SIGTERM.
            unsafe { libc::raise(libc::SIGTERM) };
            let request = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(request.fault, FaultId::Signal(libc::SIGTERM));
            assert_eq!(request.attempt, 1);
            assert_eq!(request.max_attempts, 5);
            assert_eq!(handler.phase(), Phase::GracefulAttempt(1));

            // Recoverable: ignored, and the process survives.
            unsafe { libc::raise(libc::SIGPIPE) };
            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        }
        drop(rx);
        handler.teardown().unwrap();
        assert!(context().is_none());

        // A fresh install starts over.
        let (tx, _rx) = mpsc::channel::<ShutdownRequest>();
        let handler = FaultHandler::install(config, Collaborators::new(tx)).unwrap();
        assert_eq!(handler.phase(), Phase::Normal);
        drop(handler);
        assert!(context().is_none());
    }
}
