pub mod engine;
pub mod sse;

pub use engine::{EngineOptions, FinalizedToolCall, FragmentDisposition, StreamConverter};
pub use sse::{sse_frame_stream, SseParser};

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}
