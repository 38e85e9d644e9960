// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Snapshots of the process and machine state that go into a crash report. Everything here is
//! best effort: a source that cannot be read yields an empty section, never an error.

use super::crash_report::SystemSummary;

pub fn summary() -> SystemSummary {
    SystemSummary {
        os: os_info::get().to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(0),
        pid: std::process::id(),
        page_size: page_size::get(),
    }
}

/// Sorted `(name, value)` pairs. Non UTF-8 names or values are converted lossily.
pub fn environment() -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = std::env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        })
        .collect();
    vars.sort();
    vars
}

pub fn memory_statistics() -> Vec<(String, String)> {
    let mut stats = Vec::new();
    #[cfg(unix)]
    rusage(&mut stats);
    #[cfg(target_os = "linux")]
    {
        proc_fields("/proc/self/status", &mut stats, |name| {
            name.starts_with("Vm") || name.starts_with("Rss") || name == "Threads"
        });
        proc_fields("/proc/meminfo", &mut stats, |name| {
            matches!(
                name,
                "MemTotal" | "MemFree" | "MemAvailable" | "SwapTotal" | "SwapFree"
            )
        });
    }
    #[cfg(windows)]
    windows_memory(&mut stats);
    stats
}

#[cfg(unix)]
fn rusage(stats: &mut Vec<(String, String)>) {
    use nix::sys::resource::{getrusage, UsageWho};
    if let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) {
        let user = usage.user_time();
        let system = usage.system_time();
        stats.push((
            "User CPU time".to_string(),
            format!("{}.{:06} s", user.tv_sec(), user.tv_usec()),
        ));
        stats.push((
            "System CPU time".to_string(),
            format!("{}.{:06} s", system.tv_sec(), system.tv_usec()),
        ));
        // Kilobytes on Linux, bytes on macOS.
        stats.push(("Max RSS".to_string(), usage.max_rss().to_string()));
        stats.push((
            "Page faults (major)".to_string(),
            usage.major_page_faults().to_string(),
        ));
    }
}

#[cfg(target_os = "linux")]
fn proc_fields(path: &str, stats: &mut Vec<(String, String)>, keep: impl Fn(&str) -> bool) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if keep(name) {
                stats.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
}

#[cfg(windows)]
fn windows_memory(stats: &mut Vec<(String, String)>) {
    use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
    use windows::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
    use windows::Win32::System::Threading::GetCurrentProcess;

    let mut counters = PROCESS_MEMORY_COUNTERS {
        cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
        ..Default::default()
    };
    if unsafe { GetProcessMemoryInfo(GetCurrentProcess(), &mut counters, counters.cb) }.is_ok() {
        stats.push((
            "Working set".to_string(),
            format!("{} kB", counters.WorkingSetSize / 1024),
        ));
        stats.push((
            "Peak working set".to_string(),
            format!("{} kB", counters.PeakWorkingSetSize / 1024),
        ));
        stats.push((
            "Pagefile usage".to_string(),
            format!("{} kB", counters.PagefileUsage / 1024),
        ));
        stats.push(("Page faults".to_string(), counters.PageFaultCount.to_string()));
    }

    let mut status = MEMORYSTATUSEX {
        dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
        ..Default::default()
    };
    if unsafe { GlobalMemoryStatusEx(&mut status) }.is_ok() {
        stats.push(("Memory load".to_string(), format!("{}%", status.dwMemoryLoad)));
        stats.push((
            "Physical total".to_string(),
            format!("{} kB", status.ullTotalPhys / 1024),
        ));
        stats.push((
            "Physical available".to_string(),
            format!("{} kB", status.ullAvailPhys / 1024),
        ));
    }
}

/// One line per loaded image: load address and path.
#[cfg(target_os = "linux")]
pub fn loaded_modules() -> Vec<String> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return vec![];
    };
    parse_maps(&maps)
}

#[cfg(target_os = "linux")]
fn parse_maps(maps: &str) -> Vec<String> {
    let mut modules: Vec<(usize, &str)> = Vec::new();
    for line in maps.lines() {
        // address perms offset dev inode pathname
        let mut fields = line.split_whitespace();
        let (Some(range), Some(path)) = (fields.next(), fields.nth(4)) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let start = range
            .split_once('-')
            .and_then(|(start, _)| usize::from_str_radix(start, 16).ok());
        let Some(start) = start else {
            continue;
        };
        match modules.iter_mut().find(|(_, p)| *p == path) {
            Some(existing) => existing.0 = existing.0.min(start),
            None => modules.push((start, path)),
        }
    }
    modules.sort();
    modules
        .into_iter()
        .map(|(start, path)| format!("{start:#018x} {path}"))
        .collect()
}

#[cfg(target_vendor = "apple")]
pub fn loaded_modules() -> Vec<String> {
    // SAFETY: the dyld image list is safe to query at any time; names are owned by dyld.
    unsafe {
        (0..libc::_dyld_image_count())
            .filter_map(|index| {
                let name = libc::_dyld_get_image_name(index);
                let header = libc::_dyld_get_image_header(index);
                if name.is_null() {
                    return None;
                }
                let name = std::ffi::CStr::from_ptr(name).to_string_lossy();
                Some(format!("{:#018x} {name}", header as usize))
            })
            .collect()
    }
}

#[cfg(all(unix, not(target_os = "linux"), not(target_vendor = "apple")))]
pub fn loaded_modules() -> Vec<String> {
    vec![]
}

#[cfg(windows)]
pub fn loaded_modules() -> Vec<String> {
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::ProcessStatus::{EnumProcessModules, GetModuleFileNameExW};
    use windows::Win32::System::Threading::GetCurrentProcess;

    let process = unsafe { GetCurrentProcess() };
    let mut modules = vec![HMODULE::default(); 1024];
    let mut needed = 0u32;
    let size = (modules.len() * std::mem::size_of::<HMODULE>()) as u32;
    if unsafe { EnumProcessModules(process, modules.as_mut_ptr(), size, &mut needed) }.is_err() {
        return vec![];
    }
    let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(modules.len());
    modules[..count]
        .iter()
        .map(|module| {
            let mut name = [0u16; 1024];
            let len = unsafe { GetModuleFileNameExW(Some(process), Some(*module), &mut name) };
            format!(
                "{:#018x} {}",
                module.0 as usize,
                String::from_utf16_lossy(&name[..len as usize])
            )
        })
        .collect()
}

/// One line per process on the machine: pid and name.
#[cfg(target_os = "linux")]
pub fn process_list() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![];
    };
    let mut processes: Vec<(u32, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
            Some((pid, comm.trim_end().to_string()))
        })
        .collect();
    processes.sort();
    processes
        .into_iter()
        .map(|(pid, name)| format!("{pid:>7} {name}"))
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_list() -> Vec<String> {
    vec![]
}

#[cfg(windows)]
pub fn process_list() -> Vec<String> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };

    let Ok(snapshot) = (unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }) else {
        return vec![];
    };
    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut processes = Vec::new();
    let mut more = unsafe { Process32FirstW(snapshot, &mut entry) }.is_ok();
    while more {
        let len = entry
            .szExeFile
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(entry.szExeFile.len());
        processes.push(format!(
            "{:>7} {}",
            entry.th32ProcessID,
            String::from_utf16_lossy(&entry.szExeFile[..len])
        ));
        more = unsafe { Process32NextW(snapshot, &mut entry) }.is_ok();
    }
    let _ = unsafe { CloseHandle(snapshot) };
    processes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_summary() {
        let summary = summary();
        assert_eq!(summary.pid, std::process::id());
        assert!(summary.cpu_count > 0);
        assert!(summary.page_size > 0);
        assert!(!summary.os.is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_environment_sorted() {
        let env = environment();
        assert!(env.windows(2).all(|w| w[0] <= w[1]));
        assert!(env.iter().any(|(k, _)| k == "PATH" || k == "Path"));
    }

    #[cfg(unix)]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_memory_statistics() {
        let stats = memory_statistics();
        assert!(stats.iter().any(|(name, _)| name == "User CPU time"));
        #[cfg(target_os = "linux")]
        assert!(stats.iter().any(|(name, _)| name == "VmRSS"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_maps() {
        let maps = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1234 /usr/bin/cat
55d0c0a02000-55d0c0a06000 r-xp 00002000 08:01 1234 /usr/bin/cat
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2d000000-7f1e2d028000 r--p 00000000 08:01 99 /usr/lib/libc.so.6
7ffd1c9f6000-7ffd1ca17000 rw-p 00000000 00:00 0 [stack]
";
        assert_eq!(
            parse_maps(maps),
            vec![
                "0x000055d0c0a00000 /usr/bin/cat".to_string(),
                "0x00007f1e2d000000 /usr/lib/libc.so.6".to_string(),
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_live_lists() {
        assert!(!loaded_modules().is_empty());
        let me = format!("{:>7} ", std::process::id());
        assert!(process_list().iter().any(|p| p.starts_with(&me)));
    }
}
