use futures_util::{Stream, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::RequestContext;
use crate::error::GatewayError;
use crate::fc::normalize::normalize_value;
use crate::protocol::anthropic::{FrontContentBlock, FrontEvent, FrontMessage, FrontStopReason};
use crate::protocol::backend::UpstreamEvent;
use crate::stream::engine::FinalizedToolCall;
use crate::stream::StreamConverter;

/// Run the engine over a whole backend reply and assemble one front-protocol
/// message.
///
/// Tool-use inputs come from the finalized (tier-2) arguments, never from the
/// streamed text. A call whose arguments could not be converted is left out;
/// the engine's text block naming the fault takes its place.
///
/// # Errors
///
/// Returns the upstream or transport error that ended the backend reply.
pub async fn collect_message<S>(
    upstream: S,
    mut converter: StreamConverter,
    message_id: String,
    ctx: &RequestContext,
) -> Result<FrontMessage, GatewayError>
where
    S: Stream<Item = Result<UpstreamEvent, GatewayError>>,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut builder = MessageBuilder::new(FrontMessage::new(message_id, ctx.front_model.clone()));
    let mut events = Vec::with_capacity(8);

    while let Some(event) = upstream.next().await {
        converter.push(event?, &mut events)?;
        builder.apply(events.drain(..));
    }
    converter.finish(&mut events);
    builder.apply(events.drain(..));

    let message = builder.build(converter.take_finalized());
    tracing::debug!(
        request_id = %ctx.request_id,
        blocks = message.content.len(),
        stop_reason = ?message.stop_reason,
        "buffered response assembled"
    );
    Ok(message)
}

struct MessageBuilder {
    message: FrontMessage,
    /// front block index -> position in `message.content`
    positions: FxHashMap<usize, usize>,
    /// tool call id -> position in `message.content`
    tool_positions: FxHashMap<String, usize>,
}

impl MessageBuilder {
    fn new(message: FrontMessage) -> Self {
        Self {
            message,
            positions: FxHashMap::default(),
            tool_positions: FxHashMap::default(),
        }
    }

    fn apply(&mut self, events: impl Iterator<Item = FrontEvent>) {
        for event in events {
            match event {
                FrontEvent::TextBlockStart { index } => {
                    self.positions.insert(index, self.message.content.len());
                    self.message.content.push(FrontContentBlock::Text {
                        text: String::new(),
                    });
                }
                FrontEvent::TextDelta { index, text: delta } => {
                    let position = self.positions.get(&index).copied();
                    if let Some(FrontContentBlock::Text { text }) =
                        position.and_then(|pos| self.message.content.get_mut(pos))
                    {
                        text.push_str(&delta);
                    }
                }
                FrontEvent::ToolUseStart { index, id, name } => {
                    let position = self.message.content.len();
                    self.positions.insert(index, position);
                    self.tool_positions.insert(id.clone(), position);
                    self.message.content.push(FrontContentBlock::ToolUse {
                        id,
                        name,
                        input: Value::Object(serde_json::Map::new()),
                    });
                }
                FrontEvent::MessageDelta { stop_reason, usage } => {
                    self.message.stop_reason = Some(stop_reason);
                    self.message.usage = usage;
                }
                FrontEvent::MessageStart
                | FrontEvent::InputJsonDelta { .. }
                | FrontEvent::BlockStop { .. }
                | FrontEvent::MessageStop
                | FrontEvent::Error { .. } => {}
            }
        }
    }

    fn build(mut self, finalized: Vec<FinalizedToolCall>) -> FrontMessage {
        let mut faulted = Vec::new();
        for call in finalized {
            let Some(&position) = self.tool_positions.get(&call.id) else {
                continue;
            };
            match call.outcome {
                Ok(args) => {
                    self.message.content[position] = FrontContentBlock::ToolUse {
                        id: call.id,
                        name: call.name,
                        input: Value::Object(args),
                    };
                }
                Err(_) => faulted.push(position),
            }
        }
        if !faulted.is_empty() {
            let content = std::mem::take(&mut self.message.content);
            self.message.content = content
                .into_iter()
                .enumerate()
                .filter(|(position, _)| !faulted.contains(position))
                .map(|(_, block)| block)
                .collect();
        }

        let has_tool_use = self
            .message
            .content
            .iter()
            .any(|block| matches!(block, FrontContentBlock::ToolUse { .. }));
        if !has_tool_use && self.message.stop_reason == Some(FrontStopReason::ToolUse) {
            self.message.stop_reason = Some(FrontStopReason::EndTurn);
        }
        self.message
    }
}

/// Apply tier-2 normalization to every `tool_use` block of a buffered
/// response. Returns the number of blocks whose input changed.
pub fn normalize_response_tool_calls(message: &mut FrontMessage) -> usize {
    let mut changed = 0usize;
    for block in &mut message.content {
        let FrontContentBlock::ToolUse { name, input, .. } = block else {
            continue;
        };
        let original = std::mem::take(input);
        let normalized = normalize_value(name, original.clone());
        if normalized != original {
            changed += 1;
        }
        *input = normalized;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestIdGenerator;
    use crate::observability::NullSink;
    use crate::protocol::backend::ToolCallFragment;
    use crate::routing::ModelTierResolver;
    use crate::stream::EngineOptions;
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> RequestContext {
        RequestContext::new(
            &RequestIdGenerator::new(),
            &ModelTierResolver::default(),
            "claude-sonnet-4-5",
        )
    }

    fn fragment(id: &str, name: Option<&str>, text: &str, is_final: bool) -> UpstreamEvent {
        UpstreamEvent::ToolCall(ToolCallFragment {
            id: Some(id.into()),
            stream_index: 0,
            tool_name: name.map(Into::into),
            argument_text: text.into(),
            is_final,
        })
    }

    async fn collect(events: Vec<UpstreamEvent>) -> Result<FrontMessage, GatewayError> {
        let upstream = futures_util::stream::iter(events.into_iter().map(Ok::<_, GatewayError>));
        let converter = StreamConverter::new(EngineOptions::default(), Arc::new(NullSink));
        collect_message(upstream, converter, "msg_test".into(), &context()).await
    }

    #[tokio::test]
    async fn assembles_text_and_normalized_tool_use() {
        let message = collect(vec![
            UpstreamEvent::Text("Running it.".into()),
            fragment("t1", Some("Bash"), "{\"prompt\":\"ls", false),
            fragment("t1", None, " -la\"}", true),
            UpstreamEvent::End {
                stop_reason: Some("tool_use".into()),
            },
        ])
        .await
        .unwrap();

        assert_eq!(message.id, "msg_test");
        assert_eq!(message.model, "claude-sonnet-4-5");
        assert_eq!(message.stop_reason, Some(FrontStopReason::ToolUse));
        assert_eq!(
            message.content,
            vec![
                FrontContentBlock::Text {
                    text: "Running it.".into()
                },
                FrontContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "Bash".into(),
                    input: json!({"command": "ls -la"}),
                },
            ]
        );
    }

    #[tokio::test]
    async fn conversion_fault_becomes_text_block() {
        let message = collect(vec![fragment("t1", Some("Bash"), "{\"prompt\": nope", true)])
            .await
            .unwrap();
        assert_eq!(message.content.len(), 1);
        let FrontContentBlock::Text { text } = &message.content[0] else {
            panic!("expected text block, got {:?}", message.content[0]);
        };
        assert!(text.starts_with("[tool call t1 (Bash) failed:"), "{text}");
        assert_eq!(message.stop_reason, Some(FrontStopReason::EndTurn));
    }

    #[tokio::test]
    async fn upstream_error_is_returned() {
        let err = collect(vec![
            UpstreamEvent::Text("partial".into()),
            UpstreamEvent::Error {
                status: 400,
                message: "model not allowed".into(),
            },
        ])
        .await
        .unwrap_err();
        assert!(err.is_upstream_rejection());
    }

    #[test]
    fn normalizes_buffered_tool_use_blocks() {
        let mut message = FrontMessage::new("msg_1".into(), "m".into());
        message.content.push(FrontContentBlock::ToolUse {
            id: "t1".into(),
            name: "Task".into(),
            input: json!({"prompt": "investigate X"}),
        });
        message.content.push(FrontContentBlock::ToolUse {
            id: "t2".into(),
            name: "Read".into(),
            input: json!({"file_path": "/a"}),
        });
        assert_eq!(normalize_response_tool_calls(&mut message), 1);
        let FrontContentBlock::ToolUse { input, .. } = &message.content[0] else {
            unreachable!()
        };
        assert_eq!(
            input,
            &json!({"description": "investigate X", "subagent_type": "Explore"})
        );
    }
}
