// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack capture and symbolization.
//!
//! Capturing only records instruction pointers, which is the part that is reasonably safe right
//! after a fault. Resolution (module lookup, symbols, demangling) allocates and may take locks,
//! so it only runs once the process is committed to terminating.

use super::crash_report::ReportFrame;
use crate::shared::configuration::StacktraceCollection;
use std::ffi::c_void;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: usize,
    pub symbol_address: usize,
}

impl RawFrame {
    pub fn new(ip: usize) -> Self {
        Self {
            ip,
            symbol_address: 0,
        }
    }
}

/// Captures the calling thread's stack, at most `max_frames` frames.
///
/// When `fault_ip` is given, the frames above it (the fault handling machinery itself) are
/// skipped. If the walk never reaches `fault_ip`, every frame is kept instead.
pub fn capture(fault_ip: Option<usize>, max_frames: usize) -> Vec<RawFrame> {
    collect(fault_ip, max_frames, |cb| backtrace::trace(cb))
}

/// Like [`capture`], without taking the process-wide lock of the `backtrace` crate.
///
/// # Safety
/// No other thread may be walking or resolving a stack concurrently. This holds in the forked
/// crash collector, which has a single thread.
pub unsafe fn capture_unsynchronized(fault_ip: Option<usize>, max_frames: usize) -> Vec<RawFrame> {
    collect(fault_ip, max_frames, |cb| unsafe {
        backtrace::trace_unsynchronized(cb)
    })
}

fn collect(
    fault_ip: Option<usize>,
    max_frames: usize,
    walk: impl Fn(&mut dyn FnMut(&backtrace::Frame) -> bool),
) -> Vec<RawFrame> {
    let mut frames = Vec::with_capacity(max_frames.min(256));
    let mut ip_found = fault_ip.is_none();
    walk(&mut |frame| {
        let ip = frame.ip() as usize;
        if !ip_found {
            if Some(ip) != fault_ip {
                return true;
            }
            ip_found = true;
        }
        frames.push(RawFrame {
            ip,
            symbol_address: frame.symbol_address() as usize,
        });
        frames.len() < max_frames
    });
    if ip_found {
        return frames;
    }

    // The faulting frame was not on the walked stack, keep everything rather than nothing.
    walk(&mut |frame| {
        frames.push(RawFrame {
            ip: frame.ip() as usize,
            symbol_address: frame.symbol_address() as usize,
        });
        frames.len() < max_frames
    });
    frames
}

/// Turns raw frames into report frames, one for one. A frame that cannot be resolved keeps its
/// address and, when known, its module and offset.
pub fn resolve(frames: &[RawFrame], mode: StacktraceCollection, demangle: bool) -> Vec<ReportFrame> {
    frames
        .iter()
        .map(|raw| {
            let mut frame = ReportFrame {
                ip: raw.ip,
                ..Default::default()
            };
            if let Some((module, base)) = module_for_address(raw.ip) {
                frame.module = Some(module);
                frame.module_offset = Some(raw.ip.wrapping_sub(base));
            }
            if mode == StacktraceCollection::WithSymbols {
                resolve_symbol(&mut frame, demangle);
            }
            frame
        })
        .collect()
}

fn resolve_symbol(frame: &mut ReportFrame, demangle: bool) {
    let mut resolved = false;
    backtrace::resolve(frame.ip as *mut c_void, |symbol| {
        // Inlined frames resolve to several symbols; the first is the innermost one.
        if resolved {
            return;
        }
        resolved = true;
        if let Some(name) = symbol.name() {
            let raw = name
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(name.as_bytes()).into_owned());
            frame.symbol = Some(if demangle { demangle_name(&raw) } else { raw });
        }
        frame.file = symbol.filename().map(|file| file.display().to_string());
        frame.line = symbol.lineno();
    });
}

pub fn demangle_name(name: &str) -> String {
    match Name::from(name).demangle(DemangleOptions::name_only()) {
        Some(demangled) => demangled,
        None => name.to_string(),
    }
}

/// Path of the module containing `address`, and the module's load address.
#[cfg(unix)]
fn module_for_address(address: usize) -> Option<(String, usize)> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only reads `address` as a number and fills `info`.
    if unsafe { libc::dladdr(address as *const c_void, &mut info) } == 0 || info.dli_fname.is_null()
    {
        return None;
    }
    // SAFETY: dladdr returned a non-null, nul terminated string owned by the loader.
    let name = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) };
    Some((name.to_string_lossy().into_owned(), info.dli_fbase as usize))
}

#[cfg(windows)]
fn module_for_address(address: usize) -> Option<(String, usize)> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let mut module = HMODULE::default();
    // SAFETY: with FROM_ADDRESS the name argument is interpreted as an address.
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            PCWSTR(address as *const u16),
            &mut module,
        )
    }
    .ok()?;
    let mut name = [0u16; 1024];
    let len = unsafe { GetModuleFileNameW(Some(module), &mut name) } as usize;
    if len == 0 {
        return None;
    }
    Some((String::from_utf16_lossy(&name[..len]), module.0 as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_skips_to_fault_ip() {
        // The outermost frames (thread start, test harness) are shared by every walk made from
        // this test, unlike the frames of the walk itself.
        let everything = capture(None, 512);
        assert!(everything.len() > 3);
        let target = everything[everything.len() - 3].ip;

        let frames = capture(Some(target), 512);
        assert_eq!(frames[0].ip, target);
        assert_eq!(frames.len(), 3);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_keeps_everything_when_ip_missing() {
        let frames = capture(Some(1), 64);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.ip != 1));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_respects_max_frames() {
        assert_eq!(capture(None, 1).len(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_resolve_keeps_unresolvable_frames() {
        let raw = [RawFrame::new(0x10), RawFrame::new(0x20), RawFrame::new(0x30)];
        let frames = resolve(&raw, StacktraceCollection::WithSymbols, true);
        assert_eq!(frames.len(), raw.len());
        for (frame, raw) in frames.iter().zip(raw.iter()) {
            assert_eq!(frame.ip, raw.ip);
            assert!(frame.symbol.is_none());
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_resolve_own_frames() {
        let frames = resolve(&capture(None, 64), StacktraceCollection::WithoutSymbols, true);
        assert!(frames.iter().all(|frame| frame.symbol.is_none()));
        assert!(frames.iter().any(|frame| frame.module.is_some()));
    }

    #[test]
    fn test_demangle() {
        assert_eq!(
            demangle_name("_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE"),
            "std::rt::lang_start"
        );
        assert_eq!(demangle_name("_ZN3Foo3barEv"), "Foo::bar");
        assert_eq!(demangle_name("?bar@Foo@@QEAAXXZ"), "Foo::bar");
        assert_eq!(demangle_name("main"), "main");
    }
}
