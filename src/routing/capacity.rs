use std::sync::LazyLock;

use rustc_hash::FxHashMap;

/// Context capacity of a backend model, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_window: u64,
    pub max_output: u64,
}

/// Limits assumed for backend models missing from the table.
pub const DEFAULT_LIMITS: ModelLimits = ModelLimits {
    context_window: 128_000,
    max_output: 4_096,
};

const fn limits(context_window: u64, max_output: u64) -> ModelLimits {
    ModelLimits {
        context_window,
        max_output,
    }
}

static CAPACITY_ROWS: &[(&str, ModelLimits)] = &[
    ("claude-haiku-4.5", limits(200_000, 64_000)),
    ("claude-sonnet-4.5", limits(200_000, 64_000)),
    ("claude-sonnet-4", limits(200_000, 64_000)),
    ("claude-opus-4.5", limits(200_000, 64_000)),
    ("claude-opus-4.1", limits(200_000, 32_000)),
    ("claude-3.7-sonnet", limits(200_000, 64_000)),
    ("claude-3.5-haiku", limits(200_000, 8_192)),
];

static CAPACITY_TABLE: LazyLock<FxHashMap<&'static str, ModelLimits>> =
    LazyLock::new(|| CAPACITY_ROWS.iter().copied().collect());

/// Capacity of a backend model; [`DEFAULT_LIMITS`] for unknown ids.
#[must_use]
pub fn limits_for(backend_model: &str) -> ModelLimits {
    let key = backend_model.trim();
    if let Some(limits) = CAPACITY_TABLE.get(key) {
        return *limits;
    }
    CAPACITY_TABLE
        .get(key.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(DEFAULT_LIMITS)
}
