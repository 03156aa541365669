use super::FrontEvent;
use crate::protocol::error_shapes::anthropic_error_type;
use crate::stream::sse::push_named_event_frame;
use crate::util::{next_message_id, push_json_string_escaped, push_u64_decimal, push_usize_decimal};

/// Encodes [`FrontEvent`]s into front-protocol SSE frames for one response.
///
/// `model` and the message id fill in the `message_start` envelope.
#[derive(Debug, Clone)]
pub struct FrontEncoder {
    model: String,
    message_id: String,
    json: String,
}

impl FrontEncoder {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_message_id(model, next_message_id())
    }

    #[must_use]
    pub fn with_message_id(model: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: message_id.into(),
            json: String::with_capacity(256),
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Append the SSE frame for `event` to `out`.
    pub fn encode(&mut self, event: &FrontEvent, out: &mut String) {
        let mut json = std::mem::take(&mut self.json);
        json.clear();
        self.encode_json_into(event, &mut json);
        push_named_event_frame(out, event.event_name(), &json);
        self.json = json;
    }

    /// The SSE frame for `event` as a new string.
    #[must_use]
    pub fn encode_to_string(&mut self, event: &FrontEvent) -> String {
        let mut out = String::with_capacity(128);
        self.encode(event, &mut out);
        out
    }

    fn encode_json_into(&self, event: &FrontEvent, json: &mut String) {
        match event {
            FrontEvent::MessageStart => {
                json.push_str("{\"type\":\"message_start\",\"message\":{\"id\":");
                push_json_string_escaped(json, &self.message_id);
                json.push_str(",\"type\":\"message\",\"role\":\"assistant\",\"model\":");
                push_json_string_escaped(json, &self.model);
                json.push_str(",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null");
                json.push_str(",\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}");
            }
            FrontEvent::TextBlockStart { index } => {
                json.push_str("{\"type\":\"content_block_start\",\"index\":");
                push_usize_decimal(json, *index);
                json.push_str(",\"content_block\":{\"type\":\"text\",\"text\":\"\"}}");
            }
            FrontEvent::TextDelta { index, text } => {
                json.push_str("{\"type\":\"content_block_delta\",\"index\":");
                push_usize_decimal(json, *index);
                json.push_str(",\"delta\":{\"type\":\"text_delta\",\"text\":");
                push_json_string_escaped(json, text);
                json.push_str("}}");
            }
            FrontEvent::ToolUseStart { index, id, name } => {
                json.push_str("{\"type\":\"content_block_start\",\"index\":");
                push_usize_decimal(json, *index);
                json.push_str(",\"content_block\":{\"type\":\"tool_use\",\"id\":");
                push_json_string_escaped(json, id);
                json.push_str(",\"name\":");
                push_json_string_escaped(json, name);
                json.push_str(",\"input\":{}}}");
            }
            FrontEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                json.push_str("{\"type\":\"content_block_delta\",\"index\":");
                push_usize_decimal(json, *index);
                json.push_str(",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":");
                push_json_string_escaped(json, partial_json);
                json.push_str("}}");
            }
            FrontEvent::BlockStop { index } => {
                json.push_str("{\"type\":\"content_block_stop\",\"index\":");
                push_usize_decimal(json, *index);
                json.push('}');
            }
            FrontEvent::MessageDelta { stop_reason, usage } => {
                json.push_str("{\"type\":\"message_delta\",\"delta\":{\"stop_reason\":");
                push_json_string_escaped(json, stop_reason.as_str());
                json.push_str(",\"stop_sequence\":null},\"usage\":{\"input_tokens\":");
                push_u64_decimal(json, usage.input_tokens);
                json.push_str(",\"output_tokens\":");
                push_u64_decimal(json, usage.output_tokens);
                json.push_str("}}");
            }
            FrontEvent::MessageStop => {
                json.push_str("{\"type\":\"message_stop\"}");
            }
            FrontEvent::Error { category, message } => {
                json.push_str("{\"type\":\"error\",\"error\":{\"type\":");
                push_json_string_escaped(json, anthropic_error_type(*category));
                json.push_str(",\"message\":");
                push_json_string_escaped(json, message);
                json.push_str("}}");
            }
        }
    }
}
