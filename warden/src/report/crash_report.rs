// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::path::PathBuf;

/// Machine-level details of a fault, read from the OS notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetails {
    /// Faulting data address, for the faults that have one.
    pub address: Option<usize>,
    /// Signal number or exception code.
    pub code: i64,
    /// Name of the signal-specific `si_code`, or of the exception code.
    pub code_name: Option<String>,
    pub instruction_pointer: Option<usize>,
    /// `name = value` pairs, in the order the platform stores them.
    pub registers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFrame {
    pub ip: usize,
    pub module: Option<String>,
    pub module_offset: Option<usize>,
    pub symbol: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for ReportFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.ip)?;
        match (&self.module, self.module_offset) {
            (Some(module), Some(offset)) => write!(f, " {module}+{offset:#x}")?,
            (Some(module), None) => write!(f, " {module}")?,
            _ => write!(f, " <unknown module>")?,
        }
        if let Some(symbol) = &self.symbol {
            write!(f, " in {symbol}")?;
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " at {file}:{line}")?,
            (Some(file), None) => write!(f, " at {file}")?,
            _ => (),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub os: String,
    pub cpu_count: usize,
    pub pid: u32,
    pub page_size: usize,
}

/// Everything known about one fatal fault. Built once, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub timestamp: DateTime<Utc>,
    pub executable: String,
    pub command_line: Vec<String>,
    pub summary: String,
    pub system: SystemSummary,
    pub fault: Option<FaultDetails>,
    pub frames: Vec<ReportFrame>,
    pub memory: Vec<(String, String)>,
    pub environment: Vec<(String, String)>,
    pub modules: Vec<String>,
    pub processes: Vec<String>,
    pub log_tail: Vec<String>,
    pub path: PathBuf,
}

impl CrashReport {
    /// The plain text written to disk. Sections always appear, in a fixed order, even when
    /// empty.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(16 * 1024);
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, w: &mut String) -> fmt::Result {
        writeln!(w, "{SECTION_BASIC_INFO}")?;
        writeln!(w, "Time: {}", self.timestamp.to_rfc3339())?;
        writeln!(w, "Executable: {}", self.executable)?;
        writeln!(w, "Command line: {}", self.command_line.join(" "))?;
        writeln!(w, "Process id: {}", self.system.pid)?;
        writeln!(w, "Operating system: {}", self.system.os)?;
        writeln!(w, "Processors: {}", self.system.cpu_count)?;
        writeln!(w, "Page size: {}", self.system.page_size)?;
        writeln!(w)?;

        writeln!(w, "{SECTION_SUMMARY}")?;
        writeln!(w, "{}", self.summary)?;
        writeln!(w)?;

        writeln!(w, "{SECTION_CONTEXT}")?;
        match &self.fault {
            Some(fault) => {
                write!(w, "Code: {}", fault.code)?;
                if let Some(name) = &fault.code_name {
                    write!(w, " ({name})")?;
                }
                writeln!(w)?;
                if let Some(address) = fault.address {
                    writeln!(w, "Fault address: {address:#018x}")?;
                }
                if let Some(ip) = fault.instruction_pointer {
                    writeln!(w, "Instruction pointer: {ip:#018x}")?;
                }
                for (name, value) in &fault.registers {
                    writeln!(w, "{name:>8} = {value}")?;
                }
            }
            None => writeln!(w, "unavailable")?,
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_STACKTRACE}")?;
        if self.frames.is_empty() {
            writeln!(w, "unavailable")?;
        }
        for (index, frame) in self.frames.iter().enumerate() {
            writeln!(w, "#{index:<3} {frame}")?;
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_MEMORY}")?;
        for (name, value) in &self.memory {
            writeln!(w, "{name}: {value}")?;
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_ENVIRONMENT}")?;
        for (name, value) in &self.environment {
            writeln!(w, "{name}={value}")?;
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_MODULES}")?;
        for module in &self.modules {
            writeln!(w, "{module}")?;
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_PROCESSES}")?;
        for process in &self.processes {
            writeln!(w, "{process}")?;
        }
        writeln!(w)?;

        writeln!(w, "{SECTION_LOG_TAIL}")?;
        for line in &self.log_tail {
            writeln!(w, "{line}")?;
        }
        writeln!(w)?;
        writeln!(w, "{REPORT_END}")
    }
}
