pub mod capacity;

use serde::{Deserialize, Serialize};

pub use capacity::{limits_for, ModelLimits, DEFAULT_LIMITS};

/// Model size tier of a front-protocol model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Small,
    Middle,
    Big,
}

/// One row of a keyword dispatch table: the first row whose keyword occurs
/// (case-insensitively) in the model id decides the result.
#[derive(Debug, Clone, Copy)]
pub struct KeywordRule<T: Copy> {
    pub keyword: &'static str,
    pub value: T,
}

const fn rule<T: Copy>(keyword: &'static str, value: T) -> KeywordRule<T> {
    KeywordRule { keyword, value }
}

static TIER_RULES: &[KeywordRule<ModelTier>] = &[
    rule("haiku", ModelTier::Small),
    rule("sonnet", ModelTier::Middle),
    rule("opus", ModelTier::Big),
];

// Earlier rows take precedence, so generation-specific rows sit above the
// family-wide ones.
static REASONING_RULES: &[KeywordRule<bool>] = &[
    rule("thinking", true),
    rule("claude-3-haiku", false),
    rule("claude-3-5", false),
    rule("claude-3.5", false),
    rule("claude-3-opus", false),
    rule("claude-3-7", true),
    rule("claude-3.7", true),
    rule("opus", true),
    rule("sonnet", true),
    rule("haiku-4", true),
];

pub const DEFAULT_SMALL_MODEL: &str = "claude-haiku-4.5";
pub const DEFAULT_MIDDLE_MODEL: &str = "claude-sonnet-4.5";
pub const DEFAULT_BIG_MODEL: &str = "claude-opus-4.5";

/// Return the value of the first rule whose keyword occurs in `model`.
#[must_use]
pub fn first_match<T: Copy>(rules: &[KeywordRule<T>], model: &str) -> Option<T> {
    let lowered = model.to_ascii_lowercase();
    rules
        .iter()
        .find(|rule| lowered.contains(rule.keyword))
        .map(|rule| rule.value)
}

/// Classify a front-protocol model id into a tier.
#[must_use]
pub fn classify(model: &str) -> Option<ModelTier> {
    first_match(TIER_RULES, model)
}

/// Whether a backend model accepts extended thinking.
#[must_use]
pub fn supports_reasoning(model: &str) -> bool {
    first_match(REASONING_RULES, model).unwrap_or(false)
}

/// Per-tier backend model overrides supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverrides {
    #[serde(default)]
    pub small: Option<String>,
    #[serde(default)]
    pub middle: Option<String>,
    #[serde(default)]
    pub big: Option<String>,
}

impl TierOverrides {
    /// Build overrides from plain key-value strings (`small_model`,
    /// `middle_model`, `big_model`). Unknown keys are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut overrides = Self::default();
        for (key, value) in pairs {
            overrides.set(key, value);
        }
        overrides
    }

    /// Apply one key-value override. Returns whether the key was recognized.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let slot = match key.trim().to_ascii_lowercase().as_str() {
            "small" | "small_model" => &mut self.small,
            "middle" | "middle_model" => &mut self.middle,
            "big" | "big_model" => &mut self.big,
            _ => {
                tracing::debug!("ignoring unknown model tier key '{}'", key);
                return false;
            }
        };
        *slot = Some(value.trim().to_string());
        true
    }

    /// The override for `tier`, if present and well-formed.
    #[must_use]
    pub fn get(&self, tier: ModelTier) -> Option<&str> {
        let value = match tier {
            ModelTier::Small => self.small.as_deref(),
            ModelTier::Middle => self.middle.as_deref(),
            ModelTier::Big => self.big.as_deref(),
        }?;
        if is_well_formed_model_id(value) {
            Some(value)
        } else {
            tracing::debug!("ignoring malformed {:?} tier override '{}'", tier, value);
            None
        }
    }
}

fn is_well_formed_model_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':' | b'/'))
}

fn tier_default(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Small => DEFAULT_SMALL_MODEL,
        ModelTier::Middle => DEFAULT_MIDDLE_MODEL,
        ModelTier::Big => DEFAULT_BIG_MODEL,
    }
}

/// Map a front-protocol model id to a backend model id.
///
/// Tiered ids resolve to the tier override, or the tier default when the
/// override is absent or malformed. Anything else passes through unchanged so
/// that direct backend ids keep working; an id the backend does not know is
/// rejected upstream.
#[must_use]
pub fn resolve(front_model: &str, overrides: &TierOverrides) -> String {
    match classify(front_model) {
        Some(tier) => overrides
            .get(tier)
            .unwrap_or_else(|| tier_default(tier))
            .to_string(),
        None => front_model.to_string(),
    }
}

/// Resolver bound to the configured overrides.
#[derive(Debug, Clone, Default)]
pub struct ModelTierResolver {
    overrides: TierOverrides,
}

impl ModelTierResolver {
    #[must_use]
    pub fn new(overrides: TierOverrides) -> Self {
        Self { overrides }
    }

    #[must_use]
    pub fn resolve(&self, front_model: &str) -> String {
        let backend = resolve(front_model, &self.overrides);
        if backend != front_model {
            tracing::debug!("model '{}' resolved to '{}'", front_model, backend);
        }
        backend
    }

    #[must_use]
    pub fn overrides(&self) -> &TierOverrides {
        &self.overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_resolve_to_defaults() {
        let none = TierOverrides::default();
        assert_eq!(resolve("claude-3-5-haiku-20241022", &none), DEFAULT_SMALL_MODEL);
        assert_eq!(resolve("claude-sonnet-4-5-20250929", &none), DEFAULT_MIDDLE_MODEL);
        assert_eq!(resolve("Claude-OPUS-4-1", &none), DEFAULT_BIG_MODEL);
    }

    #[test]
    fn overrides_win_when_well_formed() {
        let overrides = TierOverrides::from_pairs([
            ("small_model", "claude-haiku-4.5"),
            ("big_model", "  claude-opus-4.1 "),
            ("middle_model", "has spaces"),
            ("colour", "blue"),
        ]);
        assert_eq!(resolve("claude-opus-4", &overrides), "claude-opus-4.1");
        assert_eq!(resolve("claude-sonnet-4", &overrides), DEFAULT_MIDDLE_MODEL);
        assert_eq!(resolve("haiku", &overrides), "claude-haiku-4.5");
    }

    #[test]
    fn unknown_ids_pass_through() {
        let none = TierOverrides::default();
        assert_eq!(resolve("gpt-9000", &none), "gpt-9000");
        assert_eq!(resolve("", &none), "");
    }

    #[test]
    fn first_matching_row_wins() {
        assert_eq!(classify("haiku-vs-opus"), Some(ModelTier::Small));
        assert!(!supports_reasoning("claude-3-5-sonnet-20241022"));
        assert!(supports_reasoning("claude-3-7-sonnet-20250219"));
        assert!(supports_reasoning("claude-sonnet-4.5"));
        assert!(!supports_reasoning("gpt-9000"));
    }

    #[test]
    fn resolver_uses_configured_overrides() {
        let resolver = ModelTierResolver::new(TierOverrides {
            middle: Some("claude-sonnet-4".into()),
            ..TierOverrides::default()
        });
        assert_eq!(resolver.resolve("claude-sonnet-4-5"), "claude-sonnet-4");
        assert_eq!(resolver.overrides().middle.as_deref(), Some("claude-sonnet-4"));
    }
}
