//! Failure taxonomy for the insertion pipeline.
//!
//! None of these escape the orchestrator as `Err`. Each one is recovered locally
//! (usually by falling back to the clipboard strategy), recorded on the
//! [`InsertionReport`](crate::orchestrator::InsertionReport) and signalled to
//! telemetry.

use crate::permissions::Capability;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertionError {
    #[error("{0} permission is not granted")]
    PermissionUnavailable(Capability),

    #[error("no previously focused application was captured")]
    FocusUnavailable,

    #[error("no text element found under the focused element")]
    ProbeMiss,

    #[error("wrap placement requested without a selection")]
    SelectionRequired,

    #[error("clipboard content was overwritten before paste ({attempts} rewrite attempts)")]
    ClipboardRace { attempts: u32 },

    #[error("direct write into the focused element failed")]
    DirectWriteFailed,

    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(String),

    #[error("failed to synthesize key events: {0}")]
    KeySynthesisFailed(String),
}

impl InsertionError {
    /// Stable identifier used as the telemetry `kind` property.
    pub fn kind(&self) -> &'static str {
        match self {
            InsertionError::PermissionUnavailable(_) => "permission_unavailable",
            InsertionError::FocusUnavailable => "focus_unavailable",
            InsertionError::ProbeMiss => "probe_miss",
            InsertionError::SelectionRequired => "selection_required",
            InsertionError::ClipboardRace { .. } => "clipboard_race",
            InsertionError::DirectWriteFailed => "direct_write_failed",
            InsertionError::ClipboardUnavailable(_) => "clipboard_unavailable",
            InsertionError::KeySynthesisFailed(_) => "key_synthesis_failed",
        }
    }
}
