mod diagnostics;
mod stats;

pub use diagnostics::{DiagnosticRecord, DiagnosticsBuffer, DiagnosticsLayer};
pub use stats::{PipelineStats, StatsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "pulse_pipeline" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to keep a ring of warn+ diagnostics for bug reports.
    pub diagnostics_enabled: bool,
    /// Ring capacity.
    pub diagnostics_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            diagnostics_enabled: true,
            diagnostics_capacity: 256,
        }
    }
}

/// Handle to the telemetry subsystem. Levels are fixed at init time; the
/// RUST_LOG env var is the override mechanism, as everywhere else.
pub struct TelemetryGuard {
    diagnostics: Option<Arc<DiagnosticsBuffer>>,
}

impl TelemetryGuard {
    /// Access the diagnostics ring for bug-report extraction.
    pub fn diagnostics(&self) -> Option<&DiagnosticsBuffer> {
        self.diagnostics.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup. Silently yields
/// to a subscriber the host app already installed.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    // Build the env filter from config
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    // Optional diagnostics ring for warn+ events
    let (diag_layer, diag_buffer) = if config.diagnostics_enabled {
        let buffer = Arc::new(DiagnosticsBuffer::new(config.diagnostics_capacity));
        let layer = DiagnosticsLayer::new(buffer.clone());
        (Some(layer), Some(buffer))
    } else {
        (None, None)
    };

    // The host app may own the global subscriber already; ours then
    // becomes a no-op rather than panicking inside the SDK.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(diag_layer)
        .try_init();

    TelemetryGuard {
        diagnostics: diag_buffer,
    }
}
