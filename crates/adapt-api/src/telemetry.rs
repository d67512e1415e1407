//! Logging and metrics initialisation for the binary.

use crate::config::{LogFormat, LoggingSettings};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Counter incremented once per throttled request, labelled by outcome code.
pub const ADMISSION_OUTCOMES: &str = "admission_outcomes_total";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter.
pub fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_target(false)
            .compact()
            .with_env_filter(filter)
            .init(),
    }
}

/// Install the Prometheus recorder.
///
/// Returns `None` (and logs) if a recorder is already installed.
pub fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            metrics::describe_counter!(
                ADMISSION_OUTCOMES,
                "Throttled requests by admission outcome code"
            );
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            None
        }
    }
}

/// Record the outcome of one admission attempt.
pub fn record_outcome(code: &'static str) {
    metrics::counter!(ADMISSION_OUTCOMES, "code" => code).increment(1);
}
