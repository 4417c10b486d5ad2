//! Cross-application prompt insertion.
//!
//! [`PromptRelay`] is the application root: it owns the permission gate and the
//! insertion service and wires them to the platform backends. Collaborators
//! (hotkey listener, focus coordinator, UI) talk to those two handles only.

pub mod accessibility;
pub mod active_app;
pub mod clipboard;
pub mod clock;
pub mod enhancement;
pub mod error;
pub mod input;
pub mod logging;
pub mod orchestrator;
pub mod permissions;
pub mod settings;
pub mod synthetic_paste;
pub mod telemetry;
pub mod text_context;
mod utils;

use std::sync::Arc;

use accessibility::PlatformTree;
use active_app::SystemFocus;
use clipboard::SystemClipboard;
use clock::{Clock, TokioClock};
use input::EnigoInput;
use log::info;
use orchestrator::{InsertionService, OrchestratorBackends};
use permissions::{PermissionGate, SystemCapabilityChecker};
use settings::InsertionSettings;
use telemetry::{LogTelemetry, Telemetry};
use text_context::{SearchBounds, TextContextProbe};

pub use enhancement::{Enhancement, Placement, Transform};
pub use error::InsertionError;
pub use orchestrator::{InsertionOutcome, InsertionReport};

pub struct PromptRelay {
    permissions: Arc<PermissionGate>,
    service: InsertionService,
    settings: InsertionSettings,
}

impl PromptRelay {
    /// Builds the root with the system backends. Must run inside a tokio runtime.
    pub fn new(settings: InsertionSettings) -> Self {
        Self::with_telemetry(settings, Arc::new(LogTelemetry))
    }

    pub fn with_telemetry(settings: InsertionSettings, telemetry: Arc<dyn Telemetry>) -> Self {
        let settings = settings.normalized();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);

        let permissions = Arc::new(PermissionGate::new(
            Arc::new(SystemCapabilityChecker),
            Arc::clone(&clock),
            settings.permission_poll_interval(),
        ));
        let probe = TextContextProbe::new(
            PlatformTree::default(),
            Arc::clone(&permissions),
            SearchBounds {
                max_depth: settings.probe_max_depth,
                max_nodes: settings.probe_max_nodes,
            },
        );

        let backends = OrchestratorBackends {
            clipboard: Arc::new(SystemClipboard::new()),
            keys: Arc::new(EnigoInput::new(settings.paste_method)),
            focus: Arc::new(SystemFocus),
            probe: Arc::new(probe),
            permissions: Arc::clone(&permissions),
            telemetry,
            clock,
        };
        Self::with_backends(backends, settings)
    }

    /// Builds the root around caller-provided backends.
    pub fn with_backends(backends: OrchestratorBackends, settings: InsertionSettings) -> Self {
        let permissions = Arc::clone(&backends.permissions);
        let state = permissions.check_all();
        info!("Initial permission status: {:?}", state.status());
        permissions.start_monitoring();

        let service = InsertionService::spawn(backends, settings.clone());
        Self {
            permissions,
            service,
            settings,
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionGate> {
        &self.permissions
    }

    pub fn service(&self) -> &InsertionService {
        &self.service
    }

    pub fn settings(&self) -> &InsertionSettings {
        &self.settings
    }

    pub fn shutdown(&self) {
        self.permissions.stop_monitoring();
        self.service.cancel_in_flight();
    }
}
