pub mod diagnostics;

pub use diagnostics::{
    ConversionStats, DiagnosticEvent, DiagnosticSink, Diagnostics, DropReason, NullSink,
    RecordingSink, SinkError, TracingSink,
};

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO"));

    // The replay binary writes SSE to stdout, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Log the outcome of a converted stream.
pub fn log_stream_complete(backend_model: &str, stats: &ConversionStats, started: std::time::Instant) {
    tracing::info!(
        model = backend_model,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        tool_calls = stats.tool_calls_finalized,
        dropped = stats.dropped_total(),
        corrections = stats.corrections_emitted,
        conversion_faults = stats.conversion_faults,
        "stream complete"
    );
}
