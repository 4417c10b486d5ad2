//! Marks key events that we generate ourselves.
//!
//! The global hotkey listener lives outside this crate and would otherwise see
//! our synthetic paste as a user shortcut. It only gets a read-only
//! [`SyntheticPasteProbe`]; raising the flag is reserved for the orchestrator.

use crate::clock::Clock;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct FlagState {
    generation: u64,
    active_until: Option<Instant>,
}

pub struct SyntheticPasteFlag {
    state: Arc<Mutex<FlagState>>,
    clock: Arc<dyn Clock>,
}

impl SyntheticPasteFlag {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlagState::default())),
            clock,
        }
    }

    /// Raises the flag for at most `window`. Dropping the guard lowers it early.
    pub(crate) fn raise(&self, window: Duration) -> SyntheticPasteGuard {
        let deadline = self.clock.now() + window;
        let generation = match self.state.lock() {
            Ok(mut state) => {
                state.generation += 1;
                state.active_until = Some(deadline);
                state.generation
            }
            Err(e) => {
                debug!("Failed to lock synthetic paste flag: {}", e);
                0
            }
        };

        SyntheticPasteGuard {
            state: Arc::clone(&self.state),
            generation,
        }
    }

    pub fn probe(&self) -> SyntheticPasteProbe {
        SyntheticPasteProbe {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Read-only view handed to the hotkey listener.
#[derive(Clone)]
pub struct SyntheticPasteProbe {
    state: Arc<Mutex<FlagState>>,
    clock: Arc<dyn Clock>,
}

impl SyntheticPasteProbe {
    pub fn is_active(&self) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .map(|state| matches!(state.active_until, Some(deadline) if now < deadline))
            .unwrap_or(false)
    }
}

pub(crate) struct SyntheticPasteGuard {
    state: Arc<Mutex<FlagState>>,
    generation: u64,
}

impl Drop for SyntheticPasteGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            // A newer guard owns the flag now.
            if state.generation == self.generation {
                state.active_until = None;
            }
        }
    }
}
