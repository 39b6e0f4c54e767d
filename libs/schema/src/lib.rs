//! Schema-aware validation and deterministic data generation.
//!
//! Validation compiles JSON Schemas through a permissive draft-7 profile
//! that tolerates the OpenAPI dialect (`nullable`, `example`, integer
//! formats, vendor extensions) and caches compiled validators by
//! identifier. Generation synthesizes values from schemas with seeded
//! pseudo-randomness: the same seed produces the same document on every
//! run.

mod generate;
mod validate;

use thiserror::Error;

pub use generate::{Generator, GeneratorConfig};
pub use validate::{
    coerce_scalar, RequestSlots, SchemaValidator, ValidationIssue,
};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema compilation failed: {0}")]
    Compile(String),
}
