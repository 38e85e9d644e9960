// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::fault::classifier::default_signals;
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Stacktrace collection happens after the fault, in a process that may have a corrupted heap.
/// Resolving symbols is the riskiest part of it, so it can be downgraded independently of the
/// rest of the report.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StacktraceCollection {
    Disabled,
    /// Raw addresses, attributed to a module and offset.
    WithoutSymbols,
    /// Module and offset, plus symbol name and source location where debug info allows.
    WithSymbols,
}

impl FromStr for StacktraceCollection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "without_symbols" | "addresses" => Ok(Self::WithoutSymbols),
            "with_symbols" | "full" => Ok(Self::WithSymbols),
            other => anyhow::bail!("Unknown stacktrace collection mode {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterConfig {
    // Overrides the default `<executable>.crash.txt` location
    report_path: Option<PathBuf>,
    log_tail_lines: usize,
    headless: bool,
    resolve_frames: StacktraceCollection,
    demangle_names: bool,
    max_frames: usize,
    // Original command line, recorded in the report and returned by `restart_command()`
    command_line: Vec<String>,
    show_notice: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            report_path: None,
            log_tail_lines: constants::DEFAULT_LOG_TAIL_LINES,
            headless: false,
            resolve_frames: StacktraceCollection::WithSymbols,
            demangle_names: true,
            max_frames: constants::DEFAULT_MAX_FRAMES,
            command_line: std::env::args_os()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            show_notice: true,
        }
    }
}

impl ReporterConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        report_path: Option<PathBuf>,
        log_tail_lines: usize,
        headless: bool,
        resolve_frames: StacktraceCollection,
        demangle_names: bool,
        max_frames: usize,
        command_line: Vec<String>,
        show_notice: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            max_frames > 0 || resolve_frames == StacktraceCollection::Disabled,
            "A stacktrace was requested with max_frames = 0"
        );
        if let Some(path) = &report_path {
            anyhow::ensure!(
                path.file_name().is_some(),
                "Report path {path:?} does not name a file"
            );
        }
        Ok(Self {
            report_path,
            log_tail_lines,
            headless,
            resolve_frames,
            demangle_names,
            max_frames,
            command_line,
            show_notice,
        })
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    pub fn log_tail_lines(&self) -> usize {
        self.log_tail_lines
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn resolve_frames(&self) -> StacktraceCollection {
        self.resolve_frames
    }

    pub fn demangle_names(&self) -> bool {
        self.demangle_names
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    pub fn show_notice(&self) -> bool {
        self.show_notice
    }

    pub fn set_report_path(&mut self, report_path: Option<PathBuf>) -> anyhow::Result<()> {
        if let Some(path) = &report_path {
            anyhow::ensure!(
                path.file_name().is_some(),
                "Report path {path:?} does not name a file"
            );
        }
        self.report_path = report_path;
        Ok(())
    }

    pub fn set_headless(&mut self, headless: bool) {
        self.headless = headless;
    }

    pub fn set_resolve_frames(&mut self, resolve_frames: StacktraceCollection) {
        self.resolve_frames = resolve_frames;
    }

    pub fn set_show_notice(&mut self, show_notice: bool) {
        self.show_notice = show_notice;
    }

    pub fn set_command_line(&mut self, command_line: Vec<String>) {
        self.command_line = command_line;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultHandlerConfig {
    create_alt_stack: bool,
    max_attempts: u8,
    notice_timeout: Duration,
    report_timeout: Duration,
    reporter: ReporterConfig,
    // Signal numbers to intercept. Ignored on Windows, where the exception filter and the
    // console control handler see every fault.
    signals: Vec<i32>,
    use_alt_stack: bool,
}

impl Default for FaultHandlerConfig {
    fn default() -> Self {
        Self {
            create_alt_stack: true,
            max_attempts: constants::MAX_ATTEMPTS,
            notice_timeout: constants::DEFAULT_NOTICE_TIMEOUT,
            report_timeout: constants::DEFAULT_REPORT_TIMEOUT,
            reporter: ReporterConfig::default(),
            signals: default_signals(),
            use_alt_stack: true,
        }
    }
}

impl FaultHandlerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut signals: Vec<i32>,
        max_attempts: u8,
        create_alt_stack: bool,
        use_alt_stack: bool,
        report_timeout: Option<Duration>,
        notice_timeout: Option<Duration>,
        reporter: ReporterConfig,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(max_attempts > 0, "max_attempts must be at least 1");
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            signals.iter().try_for_each(|signum| validate_signal(*signum))?;
        }

        Ok(Self {
            create_alt_stack,
            max_attempts,
            notice_timeout: notice_timeout.unwrap_or(constants::DEFAULT_NOTICE_TIMEOUT),
            report_timeout: report_timeout.unwrap_or(constants::DEFAULT_REPORT_TIMEOUT),
            reporter,
            signals,
            use_alt_stack,
        })
    }

    /// Parses a configuration from JSON and runs it through the same validation as [`Self::new`].
    /// Missing fields are an error; start from `serde_json::to_string(&Self::default())` to get
    /// a complete document.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let parsed: Self = serde_json::from_str(json)?;
        Self::new(
            parsed.signals,
            parsed.max_attempts,
            parsed.create_alt_stack,
            parsed.use_alt_stack,
            Some(parsed.report_timeout),
            Some(parsed.notice_timeout),
            parsed.reporter,
        )
    }

    /// Applies the `WARDEN_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`, which maps an environment variable name to
    /// its value.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(value) = lookup(constants::ENV_HEADLESS) {
            self.reporter.set_headless(parse_bool(&value)?);
        }
        if let Some(value) = lookup(constants::ENV_REPORT_PATH) {
            let path = (!value.is_empty()).then(|| PathBuf::from(value));
            self.reporter.set_report_path(path)?;
        }
        if let Some(value) = lookup(constants::ENV_STACKTRACE) {
            self.reporter.set_resolve_frames(value.parse()?);
        }
        if let Some(value) = lookup(constants::ENV_MAX_ATTEMPTS) {
            let max_attempts: u8 = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {}={value:?}: {e}", constants::ENV_MAX_ATTEMPTS)
            })?;
            anyhow::ensure!(max_attempts > 0, "max_attempts must be at least 1");
            self.max_attempts = max_attempts;
        }
        Ok(())
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn max_attempts(&self) -> u8 {
        self.max_attempts
    }

    pub fn notice_timeout(&self) -> Duration {
        self.notice_timeout
    }

    pub fn report_timeout(&self) -> Duration {
        self.report_timeout
    }

    pub fn reporter(&self) -> &ReporterConfig {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut ReporterConfig {
        &mut self.reporter
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_max_attempts(&mut self, max_attempts: u8) -> anyhow::Result<()> {
        anyhow::ensure!(max_attempts > 0, "max_attempts must be at least 1");
        self.max_attempts = max_attempts;
        Ok(())
    }

    pub fn set_timeouts(&mut self, report_timeout: Duration, notice_timeout: Duration) {
        self.report_timeout = report_timeout;
        self.notice_timeout = notice_timeout;
    }
}

#[cfg(unix)]
fn validate_signal(signum: i32) -> anyhow::Result<()> {
    use nix::sys::signal::Signal;
    let signal = Signal::try_from(signum)
        .map_err(|_| anyhow::anyhow!("Unexpected signal number {signum}"))?;
    anyhow::ensure!(
        !matches!(signal, Signal::SIGKILL | Signal::SIGSTOP),
        "{signal} cannot be intercepted"
    );
    Ok(())
}

#[cfg(windows)]
fn validate_signal(_signum: i32) -> anyhow::Result<()> {
    Ok(())
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("Expected a boolean, got {other:?}"),
    }
}

/// Settings for [`crate::process::ProcessExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    // Environment for the child. `None` inherits the parent's environment.
    env: Option<Vec<(String, String)>>,
    // How long `finish()` lets a child exit on its own once its input is closed
    exit_wait: Duration,
    // How long `finish()` waits after the graceful termination request before killing
    graceful_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            env: None,
            exit_wait: constants::DEFAULT_EXIT_WAIT,
            graceful_timeout: constants::DEFAULT_GRACEFUL_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    pub fn new(
        graceful_timeout: Duration,
        exit_wait: Duration,
        env: Option<Vec<(String, String)>>,
    ) -> anyhow::Result<Self> {
        if let Some(env) = &env {
            for (key, _) in env {
                anyhow::ensure!(
                    !key.is_empty() && !key.contains('='),
                    "Invalid environment variable name {key:?}"
                );
            }
        }
        Ok(Self {
            env,
            exit_wait,
            graceful_timeout,
        })
    }

    pub fn env(&self) -> Option<&[(String, String)]> {
        self.env.as_deref()
    }

    pub fn exit_wait(&self) -> Duration {
        self.exit_wait
    }

    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_altstack_paradox() {
        let err = FaultHandlerConfig::new(
            vec![],
            5,
            true,
            false,
            None,
            None,
            ReporterConfig::default(),
        );
        assert!(err.is_err());

        let mut config = FaultHandlerConfig::default();
        config.set_use_alt_stack(false).unwrap_err();
        config.set_create_alt_stack(false).unwrap();
        config.set_use_alt_stack(false).unwrap();
    }

    #[test]
    fn test_default_signals_when_empty() {
        let config = FaultHandlerConfig::new(
            vec![],
            5,
            false,
            false,
            None,
            None,
            ReporterConfig::default(),
        )
        .unwrap();
        assert_eq!(config.signals(), default_signals().as_slice());
        assert_eq!(config.report_timeout(), constants::DEFAULT_REPORT_TIMEOUT);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_validation() {
        let dup = vec![libc::SIGSEGV, libc::SIGSEGV];
        let uncatchable = vec![libc::SIGKILL];
        let bogus = vec![4242];
        for signals in [dup, uncatchable, bogus] {
            FaultHandlerConfig::new(
                signals,
                5,
                true,
                true,
                None,
                None,
                ReporterConfig::default(),
            )
            .unwrap_err();
        }
    }

    #[test]
    fn test_zero_attempts_rejected() {
        FaultHandlerConfig::new(vec![], 0, true, true, None, None, ReporterConfig::default())
            .unwrap_err();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (constants::ENV_HEADLESS, "1"),
            (constants::ENV_REPORT_PATH, "/tmp/out.crash.txt"),
            (constants::ENV_STACKTRACE, "without_symbols"),
            (constants::ENV_MAX_ATTEMPTS, "3"),
        ]
        .into_iter()
        .collect();

        let mut config = FaultHandlerConfig::default();
        config
            .apply_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(config.reporter().headless());
        assert_eq!(
            config.reporter().report_path(),
            Some(Path::new("/tmp/out.crash.txt"))
        );
        assert_eq!(
            config.reporter().resolve_frames(),
            StacktraceCollection::WithoutSymbols
        );
        assert_eq!(config.max_attempts(), 3);
    }

    #[test]
    fn test_bad_env_override() {
        let mut config = FaultHandlerConfig::default();
        config
            .apply_overrides_from(|key| {
                (key == constants::ENV_MAX_ATTEMPTS).then(|| "lots".to_string())
            })
            .unwrap_err();
        config
            .apply_overrides_from(|key| {
                (key == constants::ENV_STACKTRACE).then(|| "sometimes".to_string())
            })
            .unwrap_err();
        assert_eq!(config.max_attempts(), constants::MAX_ATTEMPTS);
    }

    #[test]
    fn test_json_round_trip_is_validated() {
        let config = FaultHandlerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(FaultHandlerConfig::from_json(&json).unwrap(), config);

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["use_alt_stack"] = serde_json::Value::Bool(false);
        FaultHandlerConfig::from_json(&value.to_string()).unwrap_err();
    }

    #[test]
    fn test_executor_env_validation() {
        ExecutorConfig::new(
            Duration::from_secs(1),
            Duration::ZERO,
            Some(vec![("A=B".to_string(), "c".to_string())]),
        )
        .unwrap_err();
        let config = ExecutorConfig::new(
            Duration::from_secs(1),
            Duration::ZERO,
            Some(vec![("A".to_string(), "b".to_string())]),
        )
        .unwrap();
        assert_eq!(config.env().map(|e| e.len()), Some(1));
    }
}
