//! Foreground application capture and reactivation.
//!
//! The focus coordinator captures the frontmost app before our UI takes focus
//! and hands it to the orchestrator, which reactivates it before pasting.

use log::{debug, warn};

#[cfg(not(target_os = "windows"))]
use std::process::Command;

/// Opaque, platform-specific identity of an application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppToken {
    /// Raw `HWND`.
    Window(isize),
    /// X11 window id as printed by `xdotool`.
    X11Window(u64),
    /// Application name understood by the OS scripting layer.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousApp {
    pub token: AppToken,
    pub name: String,
}

impl PreviousApp {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            token: AppToken::Named(name.clone()),
            name,
        }
    }
}

/// Brings a captured application back to the foreground.
pub trait AppActivator: Send + Sync {
    fn activate(&self, app: &PreviousApp) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFocus;

impl AppActivator for SystemFocus {
    fn activate(&self, app: &PreviousApp) -> bool {
        let activated = activate_app(app);
        if !activated {
            warn!("Failed to reactivate '{}'", app.name);
        }
        activated
    }
}

/// Gets the frontmost/active window title for context variables.
#[cfg(target_os = "windows")]
pub fn get_frontmost_app_name() -> Option<String> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use windows::Win32::UI::WindowsAndMessaging::{
        GetForegroundWindow, GetWindowTextLengthW, GetWindowTextW,
    };

    unsafe {
        let hwnd = GetForegroundWindow();
        let length = GetWindowTextLengthW(hwnd);
        if length <= 0 {
            return None;
        }

        let mut buffer: Vec<u16> = vec![0; (length + 1) as usize];
        let copied = GetWindowTextW(hwnd, &mut buffer);
        if copied <= 0 {
            return None;
        }

        buffer.truncate(copied as usize);
        let title = OsString::from_wide(&buffer)
            .to_string_lossy()
            .trim()
            .to_string();
        if title.is_empty() {
            None
        } else {
            Some(title)
        }
    }
}

#[cfg(target_os = "macos")]
pub fn get_frontmost_app_name() -> Option<String> {
    run_capture(
        "osascript",
        &[
            "-e",
            "tell application \"System Events\" to get name of first application process whose frontmost is true",
        ],
    )
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn get_frontmost_app_name() -> Option<String> {
    run_capture("xdotool", &["getactivewindow", "getwindowname"])
}

#[cfg(target_os = "windows")]
pub fn capture_foreground_app() -> Option<PreviousApp> {
    use windows::Win32::UI::WindowsAndMessaging::GetForegroundWindow;

    let hwnd = unsafe { GetForegroundWindow() };
    if hwnd.0.is_null() {
        return None;
    }
    Some(PreviousApp {
        token: AppToken::Window(hwnd.0 as isize),
        name: get_frontmost_app_name().unwrap_or_default(),
    })
}

#[cfg(target_os = "macos")]
pub fn capture_foreground_app() -> Option<PreviousApp> {
    get_frontmost_app_name().map(PreviousApp::named)
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn capture_foreground_app() -> Option<PreviousApp> {
    let id = run_capture("xdotool", &["getactivewindow"])?
        .parse::<u64>()
        .ok()?;
    Some(PreviousApp {
        token: AppToken::X11Window(id),
        name: get_frontmost_app_name().unwrap_or_default(),
    })
}

#[cfg(target_os = "windows")]
fn activate_app(app: &PreviousApp) -> bool {
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::SetForegroundWindow;

    let AppToken::Window(raw) = app.token else {
        debug!("Cannot activate non-window token on Windows: {:?}", app.token);
        return false;
    };
    let hwnd = HWND(raw as *mut std::ffi::c_void);
    unsafe { SetForegroundWindow(hwnd).as_bool() }
}

#[cfg(target_os = "macos")]
fn activate_app(app: &PreviousApp) -> bool {
    let name = match &app.token {
        AppToken::Named(name) => name.as_str(),
        other => {
            debug!("Cannot activate {:?} on macOS", other);
            return false;
        }
    };
    let script = format!(
        "tell application \"{}\" to activate",
        name.replace('\\', "\\\\").replace('"', "\\\"")
    );
    run_status("osascript", &["-e", &script])
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn activate_app(app: &PreviousApp) -> bool {
    match &app.token {
        AppToken::X11Window(id) => run_status("xdotool", &["windowactivate", &id.to_string()]),
        AppToken::Named(name) => run_status("xdotool", &["search", "--name", name, "windowactivate"]),
        AppToken::Window(_) => {
            debug!("Cannot activate HWND token on this platform");
            false
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(not(target_os = "windows"))]
fn run_status(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
