//! The request pipeline: session extraction, operation dispatch, request
//! validation, rule execution, response rendering and validation, problem
//! shaping — plus the thin axum adapter that feeds it.

pub mod config;
pub mod http;
pub mod pipeline;
pub mod problem;
pub mod request;
pub mod session;

pub use config::{PipelineConfig, ResponseValidation};
pub use http::{router, HttpOptions};
pub use pipeline::{SandboxEngine, SandboxResponse, REQUEST_ID_HEADER};
pub use request::{ParsedRequest, RawRequest};
