use std::sync::LazyLock;

use rustc_hash::FxHashMap;
use serde_json::Value;

// Per-tool argument schema differences between the backend and the front
// protocol. Renames are written backend -> front; the reverse direction used
// for history replay is derived from the same rows.

/// A default value injected when a field is still absent after renames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Str(&'static str),
    Bool(bool),
    Int(i64),
}

impl DefaultValue {
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            DefaultValue::Str(s) => Value::String(s.to_string()),
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::Int(n) => Value::from(n),
        }
    }
}

/// Allowed values for an enum-typed field and the value used when the
/// backend sends something unrecognized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnumRule {
    pub allowed: &'static [&'static str],
    pub fallback: &'static str,
}

/// Schema differences for one tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolSchema {
    pub tool_name: &'static str,
    /// `(backend_field, front_field)` pairs, applied in order.
    pub field_renames: &'static [(&'static str, &'static str)],
    pub defaults: &'static [(&'static str, DefaultValue)],
    pub enum_validation: &'static [(&'static str, EnumRule)],
}

const SUBAGENT_TYPES: EnumRule = EnumRule {
    allowed: &[
        "general-purpose",
        "Explore",
        "Plan",
        "statusline-setup",
        "output-style-setup",
    ],
    fallback: "Explore",
};

const GREP_OUTPUT_MODES: EnumRule = EnumRule {
    allowed: &["content", "files_with_matches", "count"],
    fallback: "files_with_matches",
};

static TOOL_SCHEMAS: &[ToolSchema] = &[
    ToolSchema {
        tool_name: "Bash",
        field_renames: &[("prompt", "command")],
        defaults: &[],
        enum_validation: &[],
    },
    ToolSchema {
        tool_name: "Task",
        field_renames: &[("prompt", "description")],
        defaults: &[("subagent_type", DefaultValue::Str("Explore"))],
        enum_validation: &[("subagent_type", SUBAGENT_TYPES)],
    },
    ToolSchema {
        tool_name: "Read",
        field_renames: &[("path", "file_path")],
        defaults: &[],
        enum_validation: &[],
    },
    ToolSchema {
        tool_name: "Write",
        field_renames: &[("path", "file_path")],
        defaults: &[],
        enum_validation: &[],
    },
    ToolSchema {
        tool_name: "Edit",
        field_renames: &[
            ("path", "file_path"),
            ("old_text", "old_string"),
            ("new_text", "new_string"),
        ],
        defaults: &[],
        enum_validation: &[],
    },
    ToolSchema {
        tool_name: "Glob",
        field_renames: &[("glob", "pattern")],
        defaults: &[],
        enum_validation: &[],
    },
    ToolSchema {
        tool_name: "Grep",
        field_renames: &[("query", "pattern")],
        defaults: &[(
            "output_mode",
            DefaultValue::Str("files_with_matches"),
        )],
        enum_validation: &[("output_mode", GREP_OUTPUT_MODES)],
    },
    ToolSchema {
        tool_name: "WebSearch",
        field_renames: &[("q", "query")],
        defaults: &[],
        enum_validation: &[],
    },
];

static SCHEMA_INDEX: LazyLock<FxHashMap<&'static str, &'static ToolSchema>> =
    LazyLock::new(|| {
        TOOL_SCHEMAS
            .iter()
            .map(|schema| (schema.tool_name, schema))
            .collect()
    });

/// Look up the schema entry for a tool. Tool names are matched exactly.
#[must_use]
pub fn schema_for(tool_name: &str) -> Option<&'static ToolSchema> {
    SCHEMA_INDEX.get(tool_name).copied()
}

/// Every registered schema entry, in table order.
#[must_use]
pub fn all_schemas() -> &'static [ToolSchema] {
    TOOL_SCHEMAS
}

impl EnumRule {
    /// Map `raw` onto an allowed member, tolerating case and `_`/`-`
    /// differences.
    #[must_use]
    pub fn canonical_member(&self, raw: &str) -> Option<&'static str> {
        if let Some(exact) = self.allowed.iter().find(|m| **m == raw) {
            return Some(*exact);
        }
        let wanted = fold_member(raw);
        self.allowed
            .iter()
            .find(|member| fold_member(member) == wanted)
            .copied()
    }
}

fn fold_member(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c.to_ascii_lowercase() })
        .collect()
}
