// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::InstanceError;
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicPtr, Ordering};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_ALREADY_EXISTS, HANDLE, HWND, LPARAM,
};
use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextW, IsWindowVisible, SetForegroundWindow, ShowWindow, SW_RESTORE,
};

pub(super) struct NativeLock {
    handle: AtomicPtr<c_void>,
}

impl NativeLock {
    pub(super) fn try_create(identifier: &str) -> Result<Option<Self>, InstanceError> {
        let name = mutex_name(identifier);
        let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        let handle = unsafe { CreateMutexW(None, true, PCWSTR(wide.as_ptr())) }.map_err(|e| {
            InstanceError::Create {
                name: name.clone(),
                source: e.into(),
            }
        })?;
        // CreateMutexW opens the existing mutex and reports it through the last error.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            let _ = unsafe { CloseHandle(handle) };
            return Ok(None);
        }
        Ok(Some(Self {
            handle: AtomicPtr::new(handle.0),
        }))
    }

    pub(super) fn release(&self) -> Result<(), InstanceError> {
        let handle = self.handle.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if handle.is_null() {
            return Ok(());
        }
        let handle = HANDLE(handle);
        // Only the owning thread may release; closing the last handle frees the name either way.
        let _ = unsafe { ReleaseMutex(handle) };
        unsafe { CloseHandle(handle) }.map_err(|e| InstanceError::Remove {
            name: "instance mutex".to_string(),
            source: e.into(),
        })
    }

    pub(super) fn release_from_fault(&self) {
        let handle = self.handle.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !handle.is_null() {
            let _ = unsafe { CloseHandle(HANDLE(handle)) };
        }
    }
}

/// Named mutexes disappear with their last handle.
pub(super) fn force_clear(_identifier: &str) -> Result<bool, InstanceError> {
    Ok(false)
}

struct Search {
    needle: String,
    found: Option<HWND>,
}

unsafe extern "system" fn find_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: `lparam` is the `Search` passed to EnumWindows below, alive for the whole call.
    let search = unsafe { &mut *(lparam.0 as *mut Search) };
    if !unsafe { IsWindowVisible(hwnd) }.as_bool() {
        return BOOL(1);
    }
    let mut title = [0u16; 512];
    let len = unsafe { GetWindowTextW(hwnd, &mut title) };
    if len <= 0 {
        return BOOL(1);
    }
    let title = String::from_utf16_lossy(&title[..len as usize]).to_lowercase();
    if title.contains(&search.needle) {
        search.found = Some(hwnd);
        return BOOL(0);
    }
    BOOL(1)
}

/// Brings the first visible top-level window whose title contains `title` (case-insensitive)
/// to the foreground.
pub(super) fn focus_existing_window(title: &str) -> io::Result<()> {
    let mut search = Search {
        needle: title.to_lowercase(),
        found: None,
    };
    // EnumWindows reports an error when the callback stops the enumeration early.
    let _ = unsafe { EnumWindows(Some(find_window), LPARAM(&mut search as *mut Search as isize)) };
    let Some(hwnd) = search.found else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no window titled like {title:?}"),
        ));
    };
    unsafe {
        let _ = ShowWindow(hwnd, SW_RESTORE);
        if !SetForegroundWindow(hwnd).as_bool() {
            return Err(io::Error::other("SetForegroundWindow refused"));
        }
    }
    Ok(())
}

fn mutex_name(identifier: &str) -> String {
    let sanitized: String = identifier
        .chars()
        .map(|c| if c == '\\' { '_' } else { c })
        .collect();
    format!("Global\\warden-{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_name() {
        assert_eq!(mutex_name("my-game"), "Global\\warden-my-game");
        assert_eq!(mutex_name("a\\b"), "Global\\warden-a_b");
    }
}
