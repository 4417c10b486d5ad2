//! Timing and behaviour knobs for the insertion pipeline.
//!
//! Stored as JSON. Missing keys take their defaults and out-of-range values
//! are clamped on load, so a hand-edited file never wedges the pipeline.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_DIR: &str = "promptrelay";
const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_SETTLE_DELAY_MS: u64 = 150;
const DEFAULT_VERIFY_DELAY_MS: u64 = 50;
const DEFAULT_VERIFY_RETRY_DELAY_MS: u64 = 40;
const DEFAULT_MAX_VERIFY_ATTEMPTS: u32 = 3;
const DEFAULT_PASTE_FLAG_WINDOW_MS: u64 = 150;
const DEFAULT_RESTORE_DELAY_MS: u64 = 300;
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 2000;
const DEFAULT_PERMISSION_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_PROBE_MAX_DEPTH: usize = 6;
const DEFAULT_PROBE_MAX_NODES: usize = 200;
const DEFAULT_QUEUE_CAPACITY: usize = 1;

const MAX_DELAY_MS: u64 = 5000;
const MAX_VERIFY_ATTEMPTS: u32 = 10;
const MIN_PASTE_FLAG_WINDOW_MS: u64 = 20;
const MAX_PASTE_FLAG_WINDOW_MS: u64 = 1000;
const MIN_PERMISSION_POLL_INTERVAL_MS: u64 = 250;
const MAX_PROBE_MAX_DEPTH: usize = 32;
const MAX_PROBE_MAX_NODES: usize = 5000;
const MAX_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasteMethod {
    #[default]
    CtrlV,
    CtrlShiftV,
    ShiftInsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClipboardHandling {
    /// Restore the previous clipboard text after pasting.
    #[default]
    RestoreText,
    /// Windows: restore every clipboard format, not just text.
    RestoreAdvanced,
    /// Leave the inserted text on the clipboard.
    KeepInserted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertionSettings {
    pub settle_delay_ms: u64,
    pub verify_delay_ms: u64,
    pub verify_retry_delay_ms: u64,
    pub max_verify_attempts: u32,
    pub paste_flag_window_ms: u64,
    pub restore_delay_ms: u64,
    pub slow_threshold_ms: u64,
    pub permission_poll_interval_ms: u64,
    pub probe_max_depth: usize,
    pub probe_max_nodes: usize,
    pub queue_capacity: usize,
    pub paste_method: PasteMethod,
    pub clipboard_handling: ClipboardHandling,
    pub convert_lf_to_crlf: bool,
}

impl Default for InsertionSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            verify_delay_ms: DEFAULT_VERIFY_DELAY_MS,
            verify_retry_delay_ms: DEFAULT_VERIFY_RETRY_DELAY_MS,
            max_verify_attempts: DEFAULT_MAX_VERIFY_ATTEMPTS,
            paste_flag_window_ms: DEFAULT_PASTE_FLAG_WINDOW_MS,
            restore_delay_ms: DEFAULT_RESTORE_DELAY_MS,
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
            permission_poll_interval_ms: DEFAULT_PERMISSION_POLL_INTERVAL_MS,
            probe_max_depth: DEFAULT_PROBE_MAX_DEPTH,
            probe_max_nodes: DEFAULT_PROBE_MAX_NODES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            paste_method: PasteMethod::CtrlV,
            clipboard_handling: ClipboardHandling::RestoreText,
            convert_lf_to_crlf: false,
        }
    }
}

impl InsertionSettings {
    /// Clamps every value into its supported range.
    pub fn normalized(mut self) -> Self {
        self.settle_delay_ms = self.settle_delay_ms.min(MAX_DELAY_MS);
        self.verify_delay_ms = self.verify_delay_ms.min(MAX_DELAY_MS);
        self.verify_retry_delay_ms = self.verify_retry_delay_ms.min(MAX_DELAY_MS);
        self.max_verify_attempts = self.max_verify_attempts.min(MAX_VERIFY_ATTEMPTS);
        self.paste_flag_window_ms = self
            .paste_flag_window_ms
            .clamp(MIN_PASTE_FLAG_WINDOW_MS, MAX_PASTE_FLAG_WINDOW_MS);
        self.restore_delay_ms = self.restore_delay_ms.min(MAX_DELAY_MS);
        self.permission_poll_interval_ms = self
            .permission_poll_interval_ms
            .max(MIN_PERMISSION_POLL_INTERVAL_MS);
        self.probe_max_depth = self.probe_max_depth.clamp(1, MAX_PROBE_MAX_DEPTH);
        self.probe_max_nodes = self.probe_max_nodes.clamp(1, MAX_PROBE_MAX_NODES);
        self.queue_capacity = self.queue_capacity.clamp(1, MAX_QUEUE_CAPACITY);
        self
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn verify_retry_delay(&self) -> Duration {
        Duration::from_millis(self.verify_retry_delay_ms)
    }

    pub fn paste_flag_window(&self) -> Duration {
        Duration::from_millis(self.paste_flag_window_ms)
    }

    pub fn restore_delay(&self) -> Duration {
        Duration::from_millis(self.restore_delay_ms)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    pub fn permission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.permission_poll_interval_ms)
    }
}

pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
}

/// Loads settings from `path`, falling back to defaults when it does not exist.
pub fn load_settings(path: &Path) -> Result<InsertionSettings> {
    if !path.exists() {
        debug!("No settings at {}, using defaults", path.display());
        return Ok(InsertionSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    let settings: InsertionSettings = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
    info!("Loaded insertion settings from {}", path.display());
    Ok(settings.normalized())
}

pub fn get_settings() -> Result<InsertionSettings> {
    match default_settings_path() {
        Some(path) => load_settings(&path),
        None => Ok(InsertionSettings::default()),
    }
}

pub fn write_settings(path: &Path, settings: &InsertionSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
