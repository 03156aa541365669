use std::borrow::Cow;
use std::sync::LazyLock;

use memchr::{memchr_iter, memrchr};
use rustc_hash::FxHashMap;

use super::schema::all_schemas;
use crate::util::is_json_whitespace;

// Tier-1 transform: rewrites backend key tokens directly in raw argument
// text. No JSON parsing, so it runs per chunk; a token only counts when it
// sits in key position (preceded by `{` or `,`) and is followed by `:`.

#[derive(Debug)]
struct KeyToken {
    /// Quoted backend key, e.g. `"prompt"`.
    from: String,
    /// Quoted front key, e.g. `"command"`.
    to: String,
}

/// Precomputed key-token substitutions for one tool.
#[derive(Debug)]
pub struct KeyRewriter {
    tokens: Vec<KeyToken>,
}

static REWRITERS: LazyLock<FxHashMap<&'static str, KeyRewriter>> = LazyLock::new(|| {
    all_schemas()
        .iter()
        .filter(|schema| !schema.field_renames.is_empty())
        .map(|schema| {
            let tokens = schema
                .field_renames
                .iter()
                .map(|(from, to)| KeyToken {
                    from: format!("\"{from}\""),
                    to: format!("\"{to}\""),
                })
                .collect();
            (schema.tool_name, KeyRewriter { tokens })
        })
        .collect()
});

/// The tier-1 rewriter for a tool, if its schema declares any renames.
#[must_use]
pub fn rewriter_for(tool_name: &str) -> Option<&'static KeyRewriter> {
    REWRITERS.get(tool_name)
}

impl KeyRewriter {
    /// Substitute every complete backend key token in `text`.
    ///
    /// `lead` is the last non-whitespace byte that preceded `text` in the
    /// argument stream, used to decide key position for a token at the very
    /// start of the chunk.
    #[must_use]
    pub fn rewrite<'t>(&self, text: &'t str, lead: Option<u8>) -> Cow<'t, str> {
        let bytes = text.as_bytes();
        let mut out: Option<String> = None;
        let mut copied_up_to = 0usize;

        for quote in memchr_iter(b'"', bytes) {
            if quote < copied_up_to || !is_key_position(bytes, quote, lead) {
                continue;
            }
            let Some(token) = self.complete_token_at(bytes, quote) else {
                continue;
            };
            let buf = out.get_or_insert_with(|| String::with_capacity(text.len() + 16));
            buf.push_str(&text[copied_up_to..quote]);
            buf.push_str(&token.to);
            copied_up_to = quote + token.from.len();
        }

        match out {
            None => Cow::Borrowed(text),
            Some(mut buf) => {
                buf.push_str(&text[copied_up_to..]);
                Cow::Owned(buf)
            }
        }
    }

    /// Length of the suffix of `text` that may still turn into a key token
    /// once more text arrives, and so must not be forwarded yet.
    #[must_use]
    pub fn pending_suffix_len(&self, text: &str, lead: Option<u8>) -> usize {
        let bytes = text.as_bytes();
        // A partial token contains at most two quotes: the opening one and,
        // once the key is complete but the colon has not arrived, the closing one.
        let Some(last) = memrchr(b'"', bytes) else {
            return 0;
        };
        let mut candidates = [Some(last), None];
        if last > 0 {
            candidates[1] = memrchr(b'"', &bytes[..last]);
        }
        for start in candidates.into_iter().flatten() {
            if is_key_position(bytes, start, lead) && self.could_become_token(&bytes[start..]) {
                return bytes.len() - start;
            }
        }
        0
    }

    fn complete_token_at(&self, bytes: &[u8], quote: usize) -> Option<&KeyToken> {
        let rest = &bytes[quote..];
        self.tokens.iter().find(|token| {
            let from = token.from.as_bytes();
            if !rest.starts_with(from) {
                return false;
            }
            let after = &rest[from.len()..];
            after
                .iter()
                .find(|&&b| !is_json_whitespace(b))
                .is_some_and(|&b| b == b':')
        })
    }

    fn could_become_token(&self, tail: &[u8]) -> bool {
        self.tokens.iter().any(|token| {
            let from = token.from.as_bytes();
            if tail.len() < from.len() {
                from.starts_with(tail)
            } else {
                tail.starts_with(from) && tail[from.len()..].iter().all(|&b| is_json_whitespace(b))
            }
        })
    }
}

fn is_key_position(bytes: &[u8], quote: usize, lead: Option<u8>) -> bool {
    let preceding = bytes[..quote]
        .iter()
        .rev()
        .find(|&&b| !is_json_whitespace(b))
        .copied()
        .or(lead);
    matches!(preceding, Some(b'{' | b','))
}

/// Length of a trailing `}` (plus whitespace) that closes the argument
/// object. It is held back so structural corrections can still be appended
/// inside the object.
#[must_use]
pub fn closing_suffix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let Some(pos) = bytes.iter().rposition(|&b| !is_json_whitespace(b)) else {
        return 0;
    };
    if bytes[pos] == b'}' {
        bytes.len() - pos
    } else {
        0
    }
}
