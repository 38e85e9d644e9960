// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The user-visible "the application crashed" notice.

use std::time::Duration;

/// True when there is nobody to show a notice to.
pub fn is_headless(configured: bool) -> bool {
    if configured {
        return true;
    }
    #[cfg(all(unix, not(target_vendor = "apple")))]
    {
        std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none()
    }
    #[cfg(not(all(unix, not(target_vendor = "apple"))))]
    {
        false
    }
}

#[cfg(unix)]
pub fn is_debugger_attached() -> bool {
    warden_common::unix_utils::is_being_traced()
}

#[cfg(windows)]
pub fn is_debugger_attached() -> bool {
    unsafe { windows::Win32::System::Diagnostics::Debug::IsDebuggerPresent() }.as_bool()
}

/// Runs a dialog helper through [`ProcessExecutor`] and waits up to `timeout` for the user to
/// dismiss it. Returns whether a dialog was shown and closed by the user.
///
/// [`ProcessExecutor`]: crate::process::ProcessExecutor
#[cfg(unix)]
pub fn show(title: &str, message: &str, timeout: Duration) -> bool {
    use crate::process::{ChildExit, ProcessExecutor, TrustPolicy};
    use crate::shared::configuration::ExecutorConfig;
    use tracing::{debug, warn};

    let Some((program, args)) = dialog_command(title, message) else {
        debug!("No dialog helper available, skipping the crash notice");
        return false;
    };
    // `finish` closes the dialog's stdin and then waits `timeout` for it to exit on its own.
    let config = match ExecutorConfig::new(Duration::from_millis(200), timeout, None) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Invalid notice configuration");
            return false;
        }
    };
    let mut executor = ProcessExecutor::new(config, TrustPolicy::permissive());
    if let Err(e) = executor.spawn(&program, &args) {
        warn!(program = %program.display(), error = %e, "Unable to show the crash notice");
        return false;
    }
    matches!(executor.finish(), Some(ChildExit::Code(_)))
}

#[cfg(target_vendor = "apple")]
fn dialog_command(title: &str, message: &str) -> Option<(std::path::PathBuf, Vec<String>)> {
    let program = crate::process::find_in_path("osascript")?;
    let script = format!(
        "display alert \"{}\" message \"{}\" as critical",
        applescript_escape(title),
        applescript_escape(message)
    );
    Some((program, vec!["-e".to_string(), script]))
}

#[cfg(target_vendor = "apple")]
fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(all(unix, not(target_vendor = "apple")))]
fn dialog_command(title: &str, message: &str) -> Option<(std::path::PathBuf, Vec<String>)> {
    use crate::process::find_in_path;

    if let Some(zenity) = find_in_path("zenity") {
        let args = ["--error", "--no-markup", "--title", title, "--text", message];
        return Some((zenity, args.iter().map(|a| a.to_string()).collect()));
    }
    if let Some(kdialog) = find_in_path("kdialog") {
        let args = ["--title", title, "--error", message];
        return Some((kdialog, args.iter().map(|a| a.to_string()).collect()));
    }
    let xmessage = find_in_path("xmessage")?;
    Some((
        xmessage,
        vec!["-center".to_string(), format!("{title}\n\n{message}")],
    ))
}

/// Shows a system-modal message box. Blocks until it is dismissed; `timeout` is not enforced.
#[cfg(windows)]
pub fn show(title: &str, message: &str, _timeout: Duration) -> bool {
    use windows::core::PCWSTR;
    use windows::Win32::UI::WindowsAndMessaging::{
        MessageBoxW, MB_ICONERROR, MB_OK, MB_SYSTEMMODAL,
    };

    let title: Vec<u16> = title.encode_utf16().chain(Some(0)).collect();
    let message: Vec<u16> = message.encode_utf16().chain(Some(0)).collect();
    let result = unsafe {
        MessageBoxW(
            None,
            PCWSTR(message.as_ptr()),
            PCWSTR(title.as_ptr()),
            MB_OK | MB_ICONERROR | MB_SYSTEMMODAL,
        )
    };
    result.0 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_headless() {
        assert!(is_headless(true));
    }

    #[cfg(all(unix, not(target_vendor = "apple")))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_headless_without_display() {
        let has_display =
            std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some();
        assert_eq!(is_headless(false), !has_display);
    }
}
