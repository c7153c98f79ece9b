use std::time::Duration;

use request_state::{Stage, StateError};
use resilience::{ErrorKind, ServiceError};
use thiserror::Error;
use uuid::Uuid;
use worker_pool::PoolError;

use crate::generator::GenerationError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("inference circuit is open")]
    CircuitOpen,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("request {id}: unreadable {stage} input: {source}")]
    CorruptStageInput {
        id: Uuid,
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error("request {id} failed: {error}")]
    RequestFailed { id: Uuid, error: String },

    #[error("request {id} still running after {after:?}")]
    DeadlineExceeded { id: Uuid, after: Duration },

    #[error("internal orchestrator error: {0}")]
    Internal(String),
}

impl ServiceError for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::CircuitOpen => ErrorKind::CircuitOpen,
            OrchestratorError::Pool(e) => e.kind(),
            OrchestratorError::State(e) => e.kind(),
            OrchestratorError::CorruptStageInput { .. } => ErrorKind::Serialization,
            OrchestratorError::DeadlineExceeded { .. } => ErrorKind::Timeout,
            OrchestratorError::Generation(_)
            | OrchestratorError::RequestFailed { .. }
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn service(&self) -> &'static str {
        "orchestrator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_keep_their_classification() {
        let crashed = OrchestratorError::from(PoolError::WorkerCrashed("eof".into()));
        assert!(crashed.is_transient());
        assert_eq!(crashed.kind(), ErrorKind::WorkerCrashed);

        let exhausted = OrchestratorError::from(PoolError::ResourceExhausted { restarts: 5 });
        assert!(!exhausted.is_transient());
        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn open_circuit_is_retriable() {
        assert!(OrchestratorError::CircuitOpen.is_transient());
        let err = OrchestratorError::CircuitOpen.to_error();
        assert_eq!(err.service.as_deref(), Some("orchestrator"));
    }
}
