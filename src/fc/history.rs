use serde_json::Value;

use super::normalize::{move_fields, Args};
use super::schema::schema_for;
use crate::protocol::anthropic::FrontHistoryMessage;

/// Rename front-protocol argument fields back to the backend's native names.
///
/// Uses the same rename rows as [`super::normalize::normalize`], reversed, so
/// the backend recognizes its own earlier tool calls when they are replayed
/// as history. Defaults and enum coercions are not undone.
#[must_use]
pub fn to_backend_form(tool_name: &str, mut args: Args) -> Args {
    if let Some(schema) = schema_for(tool_name) {
        move_fields(
            &mut args,
            schema
                .field_renames
                .iter()
                .rev()
                .map(|&(backend, front)| (front, backend)),
        );
    }
    args
}

/// Rewrite every assistant `tool_use` block in `messages` into backend form.
///
/// Returns the number of blocks rewritten.
pub fn rewrite_history(messages: &mut [FrontHistoryMessage]) -> usize {
    let mut rewritten = 0usize;
    for message in messages.iter_mut().filter(|m| m.role == "assistant") {
        let Value::Array(blocks) = &mut message.content else {
            continue;
        };
        for block in blocks.iter_mut() {
            if rewrite_tool_use_block(block) {
                rewritten += 1;
            }
        }
    }
    if rewritten > 0 {
        tracing::debug!("rewrote {} historical tool_use blocks to backend form", rewritten);
    }
    rewritten
}

fn rewrite_tool_use_block(block: &mut Value) -> bool {
    let Value::Object(fields) = block else {
        return false;
    };
    if fields.get("type").and_then(Value::as_str) != Some("tool_use") {
        return false;
    }
    let Some(name) = fields.get("name").and_then(Value::as_str) else {
        return false;
    };
    if schema_for(name).is_none() {
        return false;
    }
    let name = name.to_string();
    let Some(Value::Object(input)) = fields.get_mut("input") else {
        return false;
    };
    let args = std::mem::take(input);
    *input = to_backend_form(&name, args);
    true
}
