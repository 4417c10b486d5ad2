//! Tracks the two OS capabilities the pipeline depends on.
//!
//! UI automation ("accessibility") lets us read and write foreign text fields.
//! Event delivery ("automation") lets us synthesize the paste keystroke. Both
//! are granted by the user outside our control, so the gate polls them while
//! monitoring is active and tells subscribers when either flips.

use crate::clock::Clock;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    UiAutomation,
    EventDelivery,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::UiAutomation, Capability::EventDelivery];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::UiAutomation => f.write_str("UI automation"),
            Capability::EventDelivery => f.write_str("event delivery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Partial,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PermissionState {
    pub can_automate_ui: bool,
    pub can_send_events: bool,
}

impl PermissionState {
    pub fn status(&self) -> PermissionStatus {
        match (self.can_automate_ui, self.can_send_events) {
            (true, true) => PermissionStatus::Granted,
            (false, false) => PermissionStatus::Denied,
            _ => PermissionStatus::Partial,
        }
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        match capability {
            Capability::UiAutomation => self.can_automate_ui,
            Capability::EventDelivery => self.can_send_events,
        }
    }

    fn slot_mut(&mut self, capability: Capability) -> &mut bool {
        match capability {
            Capability::UiAutomation => &mut self.can_automate_ui,
            Capability::EventDelivery => &mut self.can_send_events,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionChange {
    pub capability: Capability,
    pub granted: bool,
}

/// Queries the OS for a capability. `prompt` allows a system dialog.
pub trait CapabilityChecker: Send + Sync {
    fn check(&self, capability: Capability, prompt: bool) -> bool;
}

type Subscriber = Arc<dyn Fn(PermissionChange) + Send + Sync>;

/// Current flags plus the changes still waiting to be announced. Both live
/// under one lock so announcements follow the order of the updates.
#[derive(Default)]
struct GateState {
    current: PermissionState,
    pending: VecDeque<PermissionChange>,
    delivering: bool,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PermissionGate {
    checker: Arc<dyn CapabilityChecker>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    state: Mutex<GateState>,
    subscribers: Mutex<Vec<Subscriber>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl PermissionGate {
    pub fn new(
        checker: Arc<dyn CapabilityChecker>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            checker,
            clock,
            poll_interval,
            state: Mutex::new(GateState::default()),
            subscribers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PermissionState {
        self.state
            .lock()
            .map(|state| state.current)
            .unwrap_or_default()
    }

    pub fn status(&self) -> PermissionStatus {
        self.state().status()
    }

    /// Re-checks both capabilities without prompting.
    pub fn check_all(&self) -> PermissionState {
        for capability in Capability::ALL {
            let granted = self.checker.check(capability, false);
            self.record(capability, granted);
        }
        self.state()
    }

    /// Checks one capability, allowing the OS to prompt the user.
    pub fn request(&self, capability: Capability) -> bool {
        info!("Requesting {} permission", capability);
        let granted = self.checker.check(capability, true);
        self.record(capability, granted);
        granted
    }

    /// Registers an observer. Observers are never removed.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(PermissionChange) + Send + Sync + 'static,
    {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Arc::new(callback)),
            Err(e) => warn!("Failed to lock permission subscribers: {}", e),
        }
    }

    pub fn has_accessibility_permissions(&self) -> bool {
        self.state().can_automate_ui
    }

    pub fn request_accessibility_permissions(&self) -> bool {
        self.request(Capability::UiAutomation)
    }

    pub fn check_permission_status(&self) -> PermissionStatus {
        self.check_all().status()
    }

    /// Called when our app comes to the foreground; the user may have just
    /// toggled a permission in system settings.
    pub fn notify_app_activated(&self) {
        debug!("App activated, re-checking permissions");
        self.check_all();
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .map(|monitor| monitor.is_some())
            .unwrap_or(false)
    }

    /// Starts periodic polling. No-op if already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let Ok(mut monitor) = self.monitor.lock() else {
            warn!("Failed to lock permission monitor");
            return;
        };
        if monitor.is_some() {
            debug!("Permission monitoring already running");
            return;
        }

        let cancel = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let clock = Arc::clone(&self.clock);
        let interval = self.poll_interval;
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = clock.sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
                match weak.upgrade() {
                    Some(gate) => {
                        gate.check_all();
                    }
                    None => break,
                }
            }
            debug!("Permission monitoring loop exited");
        });

        *monitor = Some(MonitorHandle { cancel, task });
        info!(
            "Permission monitoring started (interval {} ms)",
            interval.as_millis()
        );
    }

    pub fn stop_monitoring(&self) {
        let handle = self.monitor.lock().ok().and_then(|mut monitor| monitor.take());
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.task.abort();
            info!("Permission monitoring stopped");
        }
    }

    fn record(&self, capability: Capability, granted: bool) {
        let change = PermissionChange {
            capability,
            granted,
        };
        {
            let Ok(mut state) = self.state.lock() else {
                warn!("Failed to lock permission state");
                return;
            };
            let slot = state.current.slot_mut(capability);
            if *slot == granted {
                return;
            }
            *slot = granted;
            info!(
                "{} permission {}",
                capability,
                if granted { "granted" } else { "revoked" }
            );
            state.pending.push_back(change);
            // Whoever is already delivering will announce this change too.
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        self.deliver_pending();
    }

    /// Announces queued changes one at a time, without holding the state
    /// lock, so callbacks can call back into the gate.
    fn deliver_pending(&self) {
        loop {
            let next = match self.state.lock() {
                Ok(mut state) => {
                    let next = state.pending.pop_front();
                    if next.is_none() {
                        state.delivering = false;
                    }
                    next
                }
                Err(e) => {
                    warn!("Failed to lock permission state: {}", e);
                    None
                }
            };
            let Some(change) = next else {
                return;
            };

            let subscribers: Vec<Subscriber> = self
                .subscribers
                .lock()
                .map(|subscribers| subscribers.clone())
                .unwrap_or_default();
            for subscriber in subscribers {
                subscriber(change);
            }
        }
    }
}

impl Drop for PermissionGate {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Platform checker used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCapabilityChecker;

impl CapabilityChecker for SystemCapabilityChecker {
    fn check(&self, capability: Capability, prompt: bool) -> bool {
        platform::check(capability, prompt)
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::Capability;
    use std::process::Command;

    #[link(name = "ApplicationServices", kind = "framework")]
    extern "C" {
        fn AXIsProcessTrusted() -> bool;
    }

    #[link(name = "CoreGraphics", kind = "framework")]
    extern "C" {
        fn CGPreflightPostEventAccess() -> bool;
        fn CGRequestPostEventAccess() -> bool;
    }

    const ACCESSIBILITY_PANE: &str =
        "x-apple.systempreferences:com.apple.preference.security?Privacy_Accessibility";

    pub fn check(capability: Capability, prompt: bool) -> bool {
        match capability {
            Capability::UiAutomation => {
                let trusted = unsafe { AXIsProcessTrusted() };
                if !trusted && prompt {
                    if let Err(e) = Command::new("open").arg(ACCESSIBILITY_PANE).output() {
                        log::warn!("Failed to open accessibility settings: {}", e);
                    }
                }
                trusted
            }
            Capability::EventDelivery => unsafe {
                if prompt {
                    CGRequestPostEventAccess()
                } else {
                    CGPreflightPostEventAccess()
                }
            },
        }
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use super::Capability;

    // Windows has no per-app permission for either capability.
    pub fn check(_capability: Capability, _prompt: bool) -> bool {
        true
    }
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
mod platform {
    use super::Capability;

    pub fn check(capability: Capability, _prompt: bool) -> bool {
        match capability {
            // No AT-SPI backend yet.
            Capability::UiAutomation => false,
            Capability::EventDelivery => true,
        }
    }
}
