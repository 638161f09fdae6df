//! DAG structural validation (spec.md §4.1).

mod validator;

pub use validator::{validate, ValidationReport};
