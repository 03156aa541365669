pub mod non_streaming;
pub mod streaming;

pub use non_streaming::{collect_message, normalize_response_tool_calls};
pub use streaming::{pump, PumpOutcome};

use std::sync::atomic::{AtomicU64, Ordering};

use crate::fc::history::rewrite_history;
use crate::protocol::anthropic::FrontHistoryMessage;
use crate::routing::{limits_for, ModelLimits, ModelTierResolver};

/// Process-wide source of request ids.
pub struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn next_uuid(&self) -> uuid::Uuid {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::from_u128(self.seed ^ u128::from(seq))
    }
}

/// What one request needs to know about itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: uuid::Uuid,
    pub front_model: String,
    pub backend_model: String,
    pub limits: ModelLimits,
}

impl RequestContext {
    #[must_use]
    pub fn new(ids: &RequestIdGenerator, resolver: &ModelTierResolver, front_model: &str) -> Self {
        let backend_model = resolver.resolve(front_model);
        let limits = limits_for(&backend_model);
        Self {
            request_id: ids.next_uuid(),
            front_model: front_model.to_string(),
            backend_model,
            limits,
        }
    }

    /// Clamp a client `max_tokens` to what the backend model can produce.
    #[must_use]
    pub fn clamp_max_tokens(&self, requested: Option<u64>) -> u64 {
        requested.map_or(self.limits.max_output, |n| n.min(self.limits.max_output))
    }

    /// Put prior tool calls back into the backend's argument vocabulary
    /// before the conversation is sent upstream.
    pub fn prepare_history(&self, messages: &mut [FrontHistoryMessage]) -> usize {
        rewrite_history(messages)
    }
}
