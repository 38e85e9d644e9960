// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_report::{CrashReport, FaultDetails};
use super::notice;
use super::stacktrace::{self, RawFrame};
use super::system;
use crate::fault::classifier::label;
use crate::fault::state::FaultEvent;
use crate::shared::configuration::{ReporterConfig, StacktraceCollection};
use crate::shared::constants;
use crate::shared::log_ring::LogRing;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportWriteError {
    #[error("Failed to create crash report {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write crash report {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Builds and writes crash reports.
///
/// Constructed when the fault handler is installed, so that nothing has to be set up once a
/// fault has happened. The log ring is only ever read.
#[derive(Debug, Clone)]
pub struct CrashReporter {
    config: ReporterConfig,
    log_ring: Option<LogRing>,
    report_path: PathBuf,
}

impl CrashReporter {
    pub fn new(config: ReporterConfig, log_ring: Option<LogRing>) -> Self {
        let report_path = config
            .report_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(default_report_path);
        Self {
            config,
            log_ring,
            report_path,
        }
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    /// Where reports go: the configured path, or next to the executable with the
    /// `crash.txt` extension.
    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    /// Walks the calling thread's stack and builds the report. Frames above
    /// `details.instruction_pointer` are left out.
    pub fn build_report(&self, event: &FaultEvent, details: Option<&FaultDetails>) -> CrashReport {
        let frames = match self.config.resolve_frames() {
            StacktraceCollection::Disabled => vec![],
            _ => stacktrace::capture(
                details.and_then(|d| d.instruction_pointer),
                self.config.max_frames(),
            ),
        };
        self.build_report_with_frames(event, details, &frames)
    }

    /// Builds the report around an already captured stack. Every captured frame is kept, even
    /// when nothing about it can be resolved.
    pub fn build_report_with_frames(
        &self,
        event: &FaultEvent,
        details: Option<&FaultDetails>,
        frames: &[RawFrame],
    ) -> CrashReport {
        let frames = stacktrace::resolve(
            frames,
            self.config.resolve_frames(),
            self.config.demangle_names(),
        );
        let log_tail = self
            .log_ring
            .as_ref()
            .map(|ring| ring.tail(self.config.log_tail_lines()))
            .unwrap_or_default();

        CrashReport {
            timestamp: chrono::Utc::now(),
            executable: std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            command_line: self.config.command_line().to_vec(),
            summary: summary_line(event, details),
            system: system::summary(),
            fault: details.cloned(),
            frames,
            memory: system::memory_statistics(),
            environment: system::environment(),
            modules: system::loaded_modules(),
            processes: system::process_list(),
            log_tail,
            path: self.report_path.clone(),
        }
    }

    /// Creates or overwrites `report.path`. Callers log the error; it never escalates.
    pub fn write_report(&self, report: &CrashReport) -> Result<(), ReportWriteError> {
        let path = &report.path;
        let mut file = std::fs::File::create(path).map_err(|source| ReportWriteError::Create {
            path: path.clone(),
            source,
        })?;
        file.write_all(report.render().as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| ReportWriteError::Write {
                path: path.clone(),
                source,
            })
    }

    /// Shows a blocking notice to the user, for at most `timeout` where the platform allows.
    /// Skipped (returns `false`) when notices are disabled, the session is headless, or a
    /// debugger is attached.
    pub fn notify_user(&self, summary: &str, timeout: Duration) -> bool {
        if !self.config.show_notice()
            || notice::is_headless(self.config.headless())
            || notice::is_debugger_attached()
        {
            return false;
        }
        let message = format!(
            "{summary}\n\nA crash report was written to:\n{}",
            self.report_path.display()
        );
        notice::show(constants::NOTICE_TITLE, &message, timeout)
    }
}

fn default_report_path() -> PathBuf {
    match std::env::current_exe() {
        Ok(exe) => exe.with_extension(constants::REPORT_EXTENSION),
        Err(_) => PathBuf::from(format!("warden.{}", constants::REPORT_EXTENSION)),
    }
}

fn summary_line(event: &FaultEvent, details: Option<&FaultDetails>) -> String {
    let mut summary = format!("Fatal fault: {}", label(event.id));
    if let Some(name) = details.and_then(|d| d.code_name.as_deref()) {
        summary.push_str(&format!(" ({name})"));
    }
    if let Some(address) = details.and_then(|d| d.address) {
        summary.push_str(&format!(" at address {address:#x}"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::classifier::{FaultId, Severity};

    fn event() -> FaultEvent {
        #[cfg(unix)]
        let id = FaultId::Signal(libc::SIGSEGV);
        #[cfg(windows)]
        let id = FaultId::Exception(crate::fault::classifier::EXCEPTION_ACCESS_VIOLATION);
        FaultEvent {
            id,
            severity: Severity::Fatal,
            occurrence: 1,
        }
    }

    fn reporter(dir: &Path, ring: Option<LogRing>) -> CrashReporter {
        let mut config = ReporterConfig::default();
        config
            .set_report_path(Some(dir.join("game.crash.txt")))
            .unwrap();
        config.set_headless(true);
        config.set_command_line(vec!["game".to_string(), "--level=3".to_string()]);
        CrashReporter::new(config, ring)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unresolvable_stack_keeps_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(dir.path(), None);
        let raw: Vec<RawFrame> = (1..=7).map(|i| RawFrame::new(i * 0x10)).collect();
        let report = reporter.build_report_with_frames(&event(), None, &raw);
        assert_eq!(report.frames.len(), raw.len());
        assert!(report.frames.iter().all(|f| f.symbol.is_none()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_build_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let ring = LogRing::new(8, 64);
        ring.push_line(b"first line");
        ring.push_line(b"last line");
        let reporter = reporter(dir.path(), Some(ring));
        let details = FaultDetails {
            address: Some(0xdead),
            code: 11,
            code_name: Some("SEGV_MAPERR".to_string()),
            ..Default::default()
        };
        let report = reporter.build_report(&event(), Some(&details));
        assert!(!report.frames.is_empty());
        assert_eq!(report.log_tail, vec!["first line", "last line"]);
        assert!(report.summary.contains("(SEGV_MAPERR) at address 0xdead"));
        assert_eq!(report.path, dir.path().join("game.crash.txt"));

        reporter.write_report(&report).unwrap();
        let text = std::fs::read_to_string(&report.path).unwrap();
        assert!(text.contains("Command line: game --level=3"));
        assert!(text.contains(constants::REPORT_END));

        // Overwrites.
        reporter.write_report(&report).unwrap();
        assert_eq!(std::fs::read_to_string(&report.path).unwrap(), text);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(dir.path(), None);
        let mut report = reporter.build_report_with_frames(&event(), None, &[]);
        report.path = dir.path().join("missing").join("report.txt");
        assert!(matches!(
            reporter.write_report(&report),
            Err(ReportWriteError::Create { .. })
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_disabled_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = reporter(dir.path(), None);
        reporter
            .config
            .set_resolve_frames(StacktraceCollection::Disabled);
        let report = reporter.build_report(&event(), None);
        assert!(report.frames.is_empty());
    }

    #[test]
    fn test_headless_skips_notice() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(dir.path(), None);
        assert!(!reporter.notify_user("boom", Duration::from_millis(1)));
    }

    #[test]
    fn test_default_report_path() {
        let path = default_report_path();
        assert!(path.to_string_lossy().ends_with(".crash.txt"));
    }
}
