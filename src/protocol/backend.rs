//! Backend event-stream wire format.
//!
//! The backend body is SSE; each frame's JSON payload is one of:
//! - `{"content": "..."}` assistant text
//! - `{"toolUseId": "...", "name": "...", "input": "...", "stop": bool, "index": n}`
//!   a tool-call fragment; continuation fragments may omit `toolUseId`/`name`
//! - `{"usage": {"inputTokens": n, "outputTokens": n}}`
//! - `{"stopReason": "..."}` end of message
//! - `{"message": "...", "status": n}` error
//!
//! The SSE event name, when present, selects the shape; otherwise it is
//! inferred from the fields.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::stream::sse::sse_frame_stream;
use crate::stream::SseEvent;

/// One backend tool-call event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    /// Absent on continuation fragments that only carry `stream_index`.
    pub id: Option<String>,
    pub stream_index: usize,
    pub tool_name: Option<String>,
    pub argument_text: String,
    pub is_final: bool,
}

/// Decoded backend event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Text(String),
    ToolCall(ToolCallFragment),
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    End {
        stop_reason: Option<String>,
    },
    /// The backend rejected the request or failed mid-stream.
    Error {
        status: u16,
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendPayload {
    content: Option<String>,
    tool_use_id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
    index: Option<usize>,
    stop: Option<bool>,
    usage: Option<Value>,
    stop_reason: Option<String>,
    message: Option<String>,
    status: Option<u16>,
    error: Option<BackendErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    message: Option<String>,
    status: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Text,
    Tool,
    Usage,
    End,
    Error,
}

fn kind_from_event_name(name: &str) -> Option<PayloadKind> {
    match name {
        "assistantResponseEvent" => Some(PayloadKind::Text),
        "toolUseEvent" => Some(PayloadKind::Tool),
        "metadataEvent" | "meteringEvent" => Some(PayloadKind::Usage),
        "messageStopEvent" => Some(PayloadKind::End),
        "error" | "exception" => Some(PayloadKind::Error),
        _ => None,
    }
}

fn kind_from_fields(payload: &BackendPayload) -> Option<PayloadKind> {
    if payload.error.is_some() || payload.status.is_some() {
        return Some(PayloadKind::Error);
    }
    // Tool fields take precedence over everything but errors.
    if payload.tool_use_id.is_some()
        || payload.input.is_some()
        || payload.stop.is_some()
        || payload.name.is_some()
    {
        return Some(PayloadKind::Tool);
    }
    if payload.usage.is_some() {
        return Some(PayloadKind::Usage);
    }
    if payload.stop_reason.is_some() {
        return Some(PayloadKind::End);
    }
    if payload.content.is_some() {
        return Some(PayloadKind::Text);
    }
    None
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn input_text(input: Option<Value>) -> String {
    match input {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        // Some backends send the complete input as an object in one event.
        Some(other) => other.to_string(),
    }
}

fn usage_tokens(usage: &Value) -> Option<(u64, u64)> {
    let object = usage.as_object()?;
    let read = |camel: &str, snake: &str| {
        object
            .get(camel)
            .or_else(|| object.get(snake))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    Some((
        read("inputTokens", "input_tokens"),
        read("outputTokens", "output_tokens"),
    ))
}

/// Decode one SSE frame payload. Frames that cannot be decoded are logged
/// and skipped.
#[must_use]
pub fn decode_backend_event(event_name: Option<&str>, data: &str) -> Option<UpstreamEvent> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    let payload: BackendPayload = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("skipping undecodable backend frame: {}", e);
            return None;
        }
    };

    let kind = event_name
        .and_then(kind_from_event_name)
        .or_else(|| kind_from_fields(&payload));
    let Some(kind) = kind else {
        tracing::debug!(event = ?event_name, "ignoring backend frame without a known shape");
        return None;
    };

    match kind {
        PayloadKind::Text => {
            let text = payload.content.unwrap_or_default();
            (!text.is_empty()).then_some(UpstreamEvent::Text(text))
        }
        PayloadKind::Tool => Some(UpstreamEvent::ToolCall(ToolCallFragment {
            id: non_empty(payload.tool_use_id),
            stream_index: payload.index.unwrap_or(0),
            tool_name: non_empty(payload.name),
            argument_text: input_text(payload.input),
            is_final: payload.stop.unwrap_or(false),
        })),
        PayloadKind::Usage => {
            let (input_tokens, output_tokens) =
                payload.usage.as_ref().and_then(usage_tokens)?;
            Some(UpstreamEvent::Usage {
                input_tokens,
                output_tokens,
            })
        }
        PayloadKind::End => Some(UpstreamEvent::End {
            stop_reason: non_empty(payload.stop_reason),
        }),
        PayloadKind::Error => {
            let body = payload.error.unwrap_or_default();
            let status = payload.status.or(body.status).unwrap_or(500);
            let message = payload
                .message
                .or(body.message)
                .unwrap_or_else(|| "backend error".to_string());
            Some(UpstreamEvent::Error { status, message })
        }
    }
}

fn decode_frame(frame: &SseEvent) -> Option<UpstreamEvent> {
    decode_backend_event(frame.event.as_deref(), &frame.data)
}

/// Turn a backend body into decoded upstream events. Body errors become
/// [`GatewayError::Transport`].
pub fn upstream_events<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<UpstreamEvent, GatewayError>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    sse_frame_stream(byte_stream).filter_map(|frame| async move {
        match frame {
            Ok(frame) => decode_frame(&frame).map(Ok),
            Err(e) => Some(Err(GatewayError::Transport(e.to_string()))),
        }
    })
}
