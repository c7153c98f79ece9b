//! # Orchestrator
//!
//! The Tonecraft driver: turns a prompt into a preset by way of the response
//! cache, the breaker-gated worker pool, the oracle and the content
//! generators, with every request tracked by the request state machine.

pub mod cache;
pub mod driver;
pub mod error;
pub mod generator;

pub use cache::{cache_key, normalize_prompt, CacheStats, ResponseCache};
pub use driver::{
    Components, MaintenanceReport, Orchestrator, OrchestratorConfig, OrchestratorStats, Outcome,
    RequestStatus, Submission,
};
pub use error::{OrchestratorError, Result};
pub use generator::{ContentGenerator, GenerationError, ParameterNudger};
