use std::time::Duration;

use resilience::{ErrorKind, ServiceError};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("call {id} timed out after {after:?}")]
    Timeout { id: Uuid, after: Duration },

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("worker pool exhausted its restart budget ({restarts} restarts)")]
    ResourceExhausted { restarts: u32 },

    #[error("worker pool is not running")]
    NotRunning,

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl ServiceError for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Timeout { .. } => ErrorKind::Timeout,
            PoolError::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            PoolError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            PoolError::NotRunning | PoolError::ShuttingDown => ErrorKind::Shutdown,
            PoolError::Spawn(_) => ErrorKind::Configuration,
            PoolError::Inference(_) => ErrorKind::Internal,
        }
    }

    fn service(&self) -> &'static str {
        "worker-pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let timeout = PoolError::Timeout {
            id: Uuid::new_v4(),
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_transient());
        assert!(PoolError::WorkerCrashed("eof".into()).is_transient());
        assert!(!PoolError::ResourceExhausted { restarts: 3 }.is_transient());
        assert!(!PoolError::Inference("no match".into()).is_transient());
        assert_eq!(PoolError::ShuttingDown.kind(), ErrorKind::Shutdown);
    }
}
