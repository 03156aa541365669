pub mod history;
pub mod normalize;
pub mod reconcile;
pub mod schema;
pub mod textual;

pub use history::{rewrite_history, to_backend_form};
pub use normalize::{normalize, normalize_value, parse_arguments, Args};
pub use reconcile::{close_prefix, complete, diff, Completion, Patch};
pub use schema::{schema_for, ToolSchema};
pub use textual::{rewriter_for, KeyRewriter};
