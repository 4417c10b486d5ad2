//! Stderr logging through `tracing-subscriber`, with `RUST_LOG`-style
//! directives and a runtime level knob.
//!
//! The crate itself logs through `log`; the subscriber's `tracing-log` bridge
//! picks those records up.

use log::LevelFilter;
use once_cell::sync::OnceCell;
use tracing_subscriber::filter::LevelFilter as TracingLevel;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub const LOG_ENV_VAR: &str = "PROMPTRELAY_LOG";

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

fn tracing_level(level: LevelFilter) -> TracingLevel {
    match level {
        LevelFilter::Off => TracingLevel::OFF,
        LevelFilter::Error => TracingLevel::ERROR,
        LevelFilter::Warn => TracingLevel::WARN,
        LevelFilter::Info => TracingLevel::INFO,
        LevelFilter::Debug => TracingLevel::DEBUG,
        LevelFilter::Trace => TracingLevel::TRACE,
    }
}

/// `default_level` applies when `directives` is absent or names nothing.
fn build_filter(directives: Option<&str>, default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing_level(default_level).into())
        .parse_lossy(directives.unwrap_or_default())
}

/// Installs the global subscriber. Directives come from `PROMPTRELAY_LOG`,
/// defaulting to `default_level`. Calling it twice is a no-op.
pub fn init_logging(default_level: LevelFilter) {
    let directives = std::env::var(LOG_ENV_VAR).ok();
    let filter = build_filter(directives.as_deref(), default_level);
    let (filter_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();

    if installed.is_ok() {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Swaps the active filter for a plain `level` filter without reinstalling
/// the subscriber.
pub fn set_log_level(level: LevelFilter) {
    if let Some(handle) = FILTER_HANDLE.get() {
        if let Err(e) = handle.reload(build_filter(None, level)) {
            log::warn!("Failed to reload log filter: {e}");
        }
    }
    log::set_max_level(level);
}
