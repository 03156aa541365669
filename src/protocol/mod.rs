pub mod anthropic;
pub mod backend;
pub(crate) mod error_shapes;
pub mod mapping;
