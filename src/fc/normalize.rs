use serde_json::{Map, Value};

use super::schema::{schema_for, EnumRule};

/// A tool call's argument object.
pub type Args = Map<String, Value>;

/// Structural (tier-2) normalization of a fully materialized argument object
/// into front-protocol form.
///
/// Applies the tool's renames with move semantics, then injects defaults for
/// fields that are still absent, then coerces enum fields. Unknown tools are
/// returned unchanged. The function is idempotent.
#[must_use]
pub fn normalize(tool_name: &str, mut args: Args) -> Args {
    let Some(schema) = schema_for(tool_name) else {
        return args;
    };

    move_fields(&mut args, schema.field_renames.iter().copied());

    for (field, default) in schema.defaults {
        if !args.contains_key(*field) {
            args.insert((*field).to_string(), default.to_value());
        }
    }

    for (field, rule) in schema.enum_validation {
        if let Some(value) = args.get_mut(*field) {
            coerce_enum(value, rule);
        }
    }

    args
}

/// [`normalize`] for an arbitrary JSON value. Non-object values are returned
/// unchanged.
#[must_use]
pub fn normalize_value(tool_name: &str, value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize(tool_name, map)),
        other => other,
    }
}

/// Rename `from` to `to` for every pair. The source key never survives: if
/// the target is already present it wins and the source is dropped.
pub(crate) fn move_fields<'a>(args: &mut Args, renames: impl Iterator<Item = (&'a str, &'a str)>) {
    for (from, to) in renames {
        if let Some(value) = args.remove(from) {
            if !args.contains_key(to) {
                args.insert(to.to_string(), value);
            }
        }
    }
}

fn coerce_enum(value: &mut Value, rule: &EnumRule) {
    let canonical = value
        .as_str()
        .and_then(|raw| rule.canonical_member(raw))
        .unwrap_or(rule.fallback);
    if value.as_str() != Some(canonical) {
        tracing::debug!(
            "coercing enum value {} to '{}'",
            value,
            canonical
        );
        *value = Value::String(canonical.to_string());
    }
}

/// Parse an accumulated argument buffer into an object.
///
/// An empty (or whitespace-only) buffer is an empty object: the backend omits
/// input for tools that take no arguments.
///
/// # Errors
///
/// Returns a description of the problem when the buffer is not valid JSON or
/// is not a JSON object.
pub fn parse_arguments(buffer: &str) -> Result<Args, String> {
    if buffer.trim().is_empty() {
        return Ok(Args::new());
    }
    match serde_json::from_str::<Value>(buffer) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "tool arguments must be a JSON object, got {}",
            json_kind(&other)
        )),
        Err(e) => Err(format!("invalid tool arguments JSON: {e}")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
