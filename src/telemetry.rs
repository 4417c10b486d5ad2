//! Lightweight product telemetry.
//!
//! Events never carry user text; only timings, strategies and error kinds.

use log::info;
use serde_json::{Map, Value};

pub const EVENT_INSERTION_SLOW: &str = "insertion_slow";
pub const EVENT_INSERTION_FAILURE: &str = "insertion_failure";

pub trait Telemetry: Send + Sync {
    fn track(&self, event: &str, properties: Map<String, Value>);
}

/// Writes telemetry events to the log under the `telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn track(&self, event: &str, properties: Map<String, Value>) {
        info!(target: "telemetry", "{} {}", event, Value::Object(properties));
    }
}
