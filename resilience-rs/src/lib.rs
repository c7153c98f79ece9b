//! # Resilience
//!
//! Shared failure-handling building blocks for the Tonecraft workspace:
//!
//! - A classified error taxonomy (transient, resource-exhausted, corpus-empty,
//!   persistence, ...) that every service crate maps its own errors onto
//! - Structured logging initialisation on top of `tracing`
//! - A counter-based circuit breaker guarding the inference call
//! - Exponential backoff with jitter for stage retries
//! - An injectable clock so time-dependent behaviour is testable

pub mod clock;
pub mod types;
pub mod logging;
pub mod retry;
pub mod circuit_breaker;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use types::{Error, ErrorKind, Result, ServiceError, Severity};
pub use logging::{init_logging, LoggingConfig};
pub use retry::{RetryConfig, RetryPolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
