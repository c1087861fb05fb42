//! Template substitution and boolean predicates over message records.
//!
//! Both faces share the `{{NAME}}` placeholder syntax: templates render
//! placeholders into strings, while predicates evaluate them as operands
//! of a small fixed comparison grammar. Callers supply a lookup closure,
//! so the crate is agnostic to whether values come from a message or from
//! the engine's environment snapshot.

mod predicate;
mod template;

pub use predicate::{Predicate, PredicateError};
pub use template::{expand, render, TemplateError};
