//! Field dependency graph built from business rules and templates.

mod dependency;

pub use dependency::{extract_tokens, Cascade, CascadeStep, DependencyGraph};
