pub mod stream;

pub use stream::FrontEncoder;

use serde::{Deserialize, Serialize};

use super::mapping::front_stop_str;
use crate::error::{client_message, ErrorCategory, GatewayError};
use crate::util::next_message_id;

/// Fresh front-protocol message id.
#[must_use]
pub fn new_message_id() -> String {
    next_message_id()
}

/// Front-protocol `stop_reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontStopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl FrontStopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        front_stop_str(self)
    }
}

/// Front-protocol usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One front-protocol stream event, before SSE framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontEvent {
    MessageStart,
    TextBlockStart {
        index: usize,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    BlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: FrontStopReason,
        usage: FrontUsage,
    },
    MessageStop,
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl FrontEvent {
    /// Terminal error event for a failed stream.
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        FrontEvent::Error {
            category: err.category(),
            message: client_message(err),
        }
    }

    /// SSE `event:` name of this event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            FrontEvent::MessageStart => "message_start",
            FrontEvent::TextBlockStart { .. } | FrontEvent::ToolUseStart { .. } => {
                "content_block_start"
            }
            FrontEvent::TextDelta { .. } | FrontEvent::InputJsonDelta { .. } => {
                "content_block_delta"
            }
            FrontEvent::BlockStop { .. } => "content_block_stop",
            FrontEvent::MessageDelta { .. } => "message_delta",
            FrontEvent::MessageStop => "message_stop",
            FrontEvent::Error { .. } => "error",
        }
    }
}

/// Front-protocol non-streaming response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub role: String,
    pub model: String,
    pub content: Vec<FrontContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<FrontStopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: FrontUsage,
}

impl FrontMessage {
    #[must_use]
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model,
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: FrontUsage::default(),
        }
    }
}

/// A content block in a front-protocol response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrontContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// A message of front-protocol conversation history. `content` is either a
/// plain string or an array of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontHistoryMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_body_serializes_like_front_protocol() {
        let mut message = FrontMessage::new("msg_1".into(), "claude-sonnet-4.5".into());
        message.content.push(FrontContentBlock::ToolUse {
            id: "t1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        });
        message.stop_reason = Some(FrontStopReason::ToolUse);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["stop_reason"], "tool_use");
        assert_eq!(value["content"][0]["type"], "tool_use");
        assert_eq!(value["content"][0]["input"]["command"], "ls");
        assert!(value.get("stop_sequence").is_none());
    }

    #[test]
    fn error_event_keeps_upstream_message() {
        let event = FrontEvent::from_error(&GatewayError::Upstream {
            status: 403,
            message: "denied".into(),
        });
        assert_eq!(
            event,
            FrontEvent::Error {
                category: ErrorCategory::Permission,
                message: "denied".into()
            }
        );
        assert_eq!(event.event_name(), "error");
    }
}
