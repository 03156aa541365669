use serde_json::Value;

use super::normalize::{parse_arguments, Args};
use crate::util::{is_json_whitespace, push_json_string_escaped};

/// Difference between the object the streamed text materializes to and the
/// authoritative tier-2 object, at top-level member granularity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// Members to (re)send; a later duplicate key overrides an earlier one.
    pub overrides: Vec<(String, Value)>,
    /// Members present in the streamed text that tier-2 does not have.
    /// Appending cannot remove them.
    pub residual: Vec<String>,
}

impl Patch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.residual.is_empty()
    }

    /// Render the overrides as object members, each preceded by a comma
    /// except the very first when the object has no members yet.
    #[must_use]
    pub fn render_members(&self, object_has_members: bool) -> String {
        let mut out = String::new();
        let mut need_comma = object_has_members;
        for (key, value) in &self.overrides {
            if need_comma {
                out.push(',');
            }
            push_json_string_escaped(&mut out, key);
            out.push(':');
            out.push_str(&value.to_string());
            need_comma = true;
        }
        out
    }
}

/// Member-level diff of `streamed` against `authoritative`.
#[must_use]
pub fn diff(streamed: &Args, authoritative: &Args) -> Patch {
    let overrides = authoritative
        .iter()
        .filter(|(key, value)| streamed.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let residual = streamed
        .keys()
        .filter(|key| !authoritative.contains_key(key.as_str()))
        .cloned()
        .collect();
    Patch {
        overrides,
        residual,
    }
}

/// How to finish a tool call's argument stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Remaining tier-1 text to forward (may be empty).
    pub text: String,
    /// Trailing correction fragment, sent after `text`.
    pub correction: Option<String>,
    /// Members the client-side text still gets wrong after the correction.
    pub residual: Vec<String>,
}

/// Decide the final fragments for a tool call.
///
/// `emitted` is the tier-1 text already forwarded, `unsent` the tier-1
/// rendering of the held-back tail. The concatenation of `emitted`, `text`
/// and `correction` parses to `authoritative` unless `residual` is non-empty.
#[must_use]
pub fn complete(emitted: &str, unsent: &str, authoritative: &Args) -> Completion {
    let mut full = String::with_capacity(emitted.len() + unsent.len());
    full.push_str(emitted);
    full.push_str(unsent);
    let streamed = parse_arguments(&full).ok();

    if streamed.as_ref() == Some(authoritative) && !full.trim().is_empty() {
        return Completion {
            text: unsent.to_string(),
            correction: None,
            residual: Vec::new(),
        };
    }

    if emitted.trim().is_empty() {
        return Completion {
            text: String::new(),
            correction: Some(Value::Object(authoritative.clone()).to_string()),
            residual: Vec::new(),
        };
    }

    let closing = unsent
        .as_bytes()
        .iter()
        .rposition(|&b| !is_json_whitespace(b))
        .filter(|&pos| unsent.as_bytes()[pos] == b'}');

    match (streamed, closing) {
        (Some(streamed), Some(brace)) => {
            let patch = diff(&streamed, authoritative);
            let mut correction = patch.render_members(!streamed.is_empty());
            correction.push('}');
            Completion {
                text: unsent[..brace].to_string(),
                correction: Some(correction),
                residual: patch.residual,
            }
        }
        (streamed, _) => {
            let residual = match streamed {
                Some(streamed) => {
                    let patch = diff(&streamed, authoritative);
                    patch
                        .overrides
                        .into_iter()
                        .map(|(key, _)| key)
                        .chain(patch.residual)
                        .collect()
                }
                None => authoritative.keys().cloned().collect(),
            };
            Completion {
                text: unsent.to_string(),
                correction: None,
                residual,
            }
        }
    }
}

/// Suffix that turns a streamed argument prefix into a JSON object, checked
/// by parsing. `None` when the prefix already holds text no suffix can fix.
#[must_use]
pub fn close_prefix(prefix: &str) -> Option<String> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for &byte in prefix.as_bytes() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => closers.push('}'),
            b'[' => closers.push(']'),
            b'}' | b']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut open = String::new();
    if escaped {
        open.push('\\');
    }
    if in_string {
        open.push('"');
    }
    let closing: String = closers.iter().rev().collect();
    // a dangling key, value position, or trailing comma
    ["", ":null", "null", "\"\":null"].iter().find_map(|filler| {
        let suffix = format!("{open}{filler}{closing}");
        let mut full = String::with_capacity(prefix.len() + suffix.len());
        full.push_str(prefix);
        full.push_str(&suffix);
        matches!(serde_json::from_str::<Value>(&full), Ok(Value::Object(_))).then_some(suffix)
    })
}
