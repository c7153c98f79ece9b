use resilience::{ErrorKind, ServiceError};
use thiserror::Error;
use uuid::Uuid;

use crate::request::Stage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("request {0} not found")]
    NotFound(Uuid),

    #[error("request {id}: invalid transition {from} -> {to}")]
    InvalidTransition { id: Uuid, from: Stage, to: Stage },

    #[error("request {id} persistence failed: {source}")]
    Persistence {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

impl ServiceError for StateError {
    fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            StateError::Persistence { .. } => ErrorKind::Persistence,
        }
    }

    fn service(&self) -> &'static str {
        "request-state"
    }
}

impl ServiceError for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Serialization(_) => ErrorKind::Serialization,
            StoreError::Io(_) | StoreError::Unavailable(_) => ErrorKind::Persistence,
        }
    }

    fn service(&self) -> &'static str {
        "request-store"
    }
}
