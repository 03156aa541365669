use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

/// Why a backend fragment was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Same id, different stream index than the one it registered on.
    GhostStream,
    /// New id whose fingerprint belongs to an earlier call.
    DuplicateOperation,
    /// Id previously classified as a duplicate.
    Skipped,
    /// No tool name and no registration to attach to.
    Malformed,
    /// Fragment for a call that was already finalized.
    Late,
}

/// Fire-and-forget telemetry about one request's conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    FragmentDropped {
        reason: DropReason,
        tool_call_id: Option<String>,
        stream_index: usize,
    },
    FingerprintCollision {
        fingerprint: String,
        /// Call that registered the fingerprint first.
        owner: String,
        duplicate: String,
    },
    ParseFailure {
        tool_call_id: String,
        message: String,
    },
    CorrectionEmitted {
        tool_call_id: String,
        bytes: usize,
    },
    UnpatchableMembers {
        tool_call_id: String,
        members: Vec<String>,
    },
    StreamCompleted(ConversionStats),
}

/// Error returned by a telemetry collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("diagnostic sink unavailable: {0}")]
    Unavailable(String),
    #[error("diagnostic sink rejected event: {0}")]
    Rejected(String),
}

/// Receiver of diagnostic events. Implementations may fail; failures never
/// reach the request path.
pub trait DiagnosticSink: Send + Sync {
    /// Record one event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the event could not be recorded.
    fn record(&self, event: &DiagnosticEvent) -> Result<(), SinkError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _event: &DiagnosticEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes events to the `tracing` subscriber at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: &DiagnosticEvent) -> Result<(), SinkError> {
        match event {
            DiagnosticEvent::StreamCompleted(stats) => {
                tracing::debug!(target: "toolbridge::diagnostics", ?stats, "stream completed");
            }
            other => tracing::debug!(target: "toolbridge::diagnostics", event = ?other),
        }
        Ok(())
    }
}

/// Keeps every event in memory, for inspection by callers and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn count_dropped(&self, reason: DropReason) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| {
                matches!(event, DiagnosticEvent::FragmentDropped { reason: r, .. } if *r == reason)
            })
            .count()
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&self, event: &DiagnosticEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Per-request counters kept by the conversion engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionStats {
    pub fragments_forwarded: u64,
    pub ghost_dropped: u64,
    pub duplicate_dropped: u64,
    pub skipped_dropped: u64,
    pub malformed_dropped: u64,
    pub late_dropped: u64,
    pub corrections_emitted: u64,
    pub unpatchable_calls: u64,
    pub conversion_faults: u64,
    pub tool_calls_finalized: u64,
    pub sink_faults: u64,
}

impl ConversionStats {
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.ghost_dropped
            + self.duplicate_dropped
            + self.skipped_dropped
            + self.malformed_dropped
            + self.late_dropped
    }

    pub(crate) fn count_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::GhostStream => self.ghost_dropped += 1,
            DropReason::DuplicateOperation => self.duplicate_dropped += 1,
            DropReason::Skipped => self.skipped_dropped += 1,
            DropReason::Malformed => self.malformed_dropped += 1,
            DropReason::Late => self.late_dropped += 1,
        }
    }
}

/// Request-scoped handle to a sink plus the request's counters.
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    pub(crate) stats: ConversionStats,
}

impl Diagnostics {
    #[must_use]
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            stats: ConversionStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ConversionStats {
        &self.stats
    }

    /// Hand an event to the sink. Errors and panics inside the sink are
    /// absorbed and only logged.
    pub fn report(&mut self, event: DiagnosticEvent) {
        let sink = &self.sink;
        let outcome = catch_unwind(AssertUnwindSafe(|| sink.record(&event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.stats.sink_faults += 1;
                tracing::warn!("diagnostic sink error ignored: {}", err);
            }
            Err(_) => {
                self.stats.sink_faults += 1;
                tracing::warn!("diagnostic sink panicked; event discarded");
            }
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
