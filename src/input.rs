//! Synthetic keyboard input for paste and select-all.

use crate::settings::PasteMethod;
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use log::debug;
use std::sync::Mutex;

#[cfg(target_os = "linux")]
use crate::utils::is_wayland;
#[cfg(target_os = "linux")]
use std::process::Command;

/// Sends OS-level key combinations to whatever window has focus.
pub trait KeySynthesizer: Send + Sync {
    fn send_paste(&self) -> Result<(), String>;
    fn send_select_all(&self) -> Result<(), String>;
}

/// Modifier used for clipboard shortcuts on this platform.
#[cfg(target_os = "macos")]
const COMMAND_KEY: Key = Key::Meta;
#[cfg(not(target_os = "macos"))]
const COMMAND_KEY: Key = Key::Control;

pub struct EnigoInput {
    paste_method: PasteMethod,
    enigo: Mutex<Option<Enigo>>,
}

impl EnigoInput {
    pub fn new(paste_method: PasteMethod) -> Self {
        Self {
            paste_method,
            enigo: Mutex::new(None),
        }
    }

    /// Enigo is created lazily: on some systems it needs a display connection
    /// that may not exist yet when we start.
    fn with_enigo(&self, op: impl FnOnce(&mut Enigo) -> Result<(), String>) -> Result<(), String> {
        let mut guard = self
            .enigo
            .lock()
            .map_err(|e| format!("Failed to lock Enigo: {}", e))?;
        if guard.is_none() {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| format!("Failed to initialize Enigo: {}", e))?;
            *guard = Some(enigo);
        }
        match guard.as_mut() {
            Some(enigo) => op(enigo),
            None => Err("Enigo state not initialized".into()),
        }
    }
}

impl KeySynthesizer for EnigoInput {
    fn send_paste(&self) -> Result<(), String> {
        #[cfg(target_os = "linux")]
        if try_wayland_send_paste(&self.paste_method)? {
            return Ok(());
        }

        debug!("Sending paste via {:?}", self.paste_method);
        match self.paste_method {
            PasteMethod::CtrlV => self.with_enigo(|enigo| send_combo(enigo, &[COMMAND_KEY], Key::Unicode('v'))),
            PasteMethod::CtrlShiftV => self.with_enigo(|enigo| {
                send_combo(enigo, &[COMMAND_KEY, Key::Shift], Key::Unicode('v'))
            }),
            PasteMethod::ShiftInsert => self.with_enigo(send_shift_insert),
        }
    }

    fn send_select_all(&self) -> Result<(), String> {
        #[cfg(target_os = "linux")]
        if is_wayland() && is_tool_available("wtype") {
            return run_tool("wtype", &["-M", "ctrl", "-k", "a"]);
        }

        self.with_enigo(|enigo| send_combo(enigo, &[COMMAND_KEY], Key::Unicode('a')))
    }
}

/// Presses `modifiers`, clicks `key`, releases the modifiers in reverse.
fn send_combo(enigo: &mut Enigo, modifiers: &[Key], key: Key) -> Result<(), String> {
    for modifier in modifiers {
        enigo
            .key(*modifier, Direction::Press)
            .map_err(|e| format!("Failed to press modifier: {}", e))?;
    }

    let clicked = enigo
        .key(key, Direction::Click)
        .map_err(|e| format!("Failed to click key: {}", e));

    // Always release, even when the click failed, so no modifier stays stuck.
    for modifier in modifiers.iter().rev() {
        enigo
            .key(*modifier, Direction::Release)
            .map_err(|e| format!("Failed to release modifier: {}", e))?;
    }

    clicked
}

#[cfg(not(target_os = "macos"))]
fn send_shift_insert(enigo: &mut Enigo) -> Result<(), String> {
    send_combo(enigo, &[Key::Shift], Key::Insert)
}

#[cfg(target_os = "macos")]
fn send_shift_insert(enigo: &mut Enigo) -> Result<(), String> {
    log::info!("Shift+Insert is not available on macOS, using Cmd+V");
    send_combo(enigo, &[COMMAND_KEY], Key::Unicode('v'))
}

/// Attempts to paste using Wayland-specific tools (`wtype` or `dotool`).
/// Returns `Ok(true)` if a Wayland tool handled the paste, `Ok(false)` if not applicable,
/// or `Err` on failure from the underlying tool.
#[cfg(target_os = "linux")]
fn try_wayland_send_paste(paste_method: &PasteMethod) -> Result<bool, String> {
    if !is_wayland() {
        return Ok(false);
    }

    if is_tool_available("wtype") {
        let args: &[&str] = match paste_method {
            PasteMethod::CtrlV => &["-M", "ctrl", "-k", "v"],
            PasteMethod::ShiftInsert => &["-M", "shift", "-k", "Insert"],
            PasteMethod::CtrlShiftV => &["-M", "ctrl", "-M", "shift", "-k", "v"],
        };
        run_tool("wtype", args)?;
        return Ok(true);
    }

    if is_tool_available("dotool") {
        let command = match paste_method {
            PasteMethod::CtrlV => "echo key ctrl+v | dotool",
            PasteMethod::ShiftInsert => "echo key shift+insert | dotool",
            PasteMethod::CtrlShiftV => "echo key ctrl+shift+v | dotool",
        };
        run_tool("sh", &["-c", command])?;
        return Ok(true);
    }

    log::info!("Wayland session without wtype/dotool, falling back to Enigo");
    Ok(false)
}

#[cfg(target_os = "linux")]
fn is_tool_available(tool: &str) -> bool {
    Command::new("which")
        .arg(tool)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Run an input tool and return a friendly error on failure.
#[cfg(target_os = "linux")]
fn run_tool(program: &str, args: &[&str]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("Failed to execute {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed: {}", program, stderr));
    }

    Ok(())
}
