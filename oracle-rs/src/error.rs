use resilience::{ErrorKind, ServiceError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OracleError>;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("failed to read corpus {path}: {source}")]
    CorpusRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse corpus: {0}")]
    CorpusParse(#[from] serde_json::Error),

    #[error("vector {index} has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("corpus is empty")]
    CorpusEmpty,
}

impl ServiceError for OracleError {
    fn kind(&self) -> ErrorKind {
        match self {
            OracleError::CorpusRead { .. } => ErrorKind::Configuration,
            OracleError::CorpusParse(_) => ErrorKind::Serialization,
            OracleError::DimensionMismatch { .. } => ErrorKind::Internal,
            OracleError::CorpusEmpty => ErrorKind::CorpusEmpty,
        }
    }

    fn service(&self) -> &'static str {
        "oracle"
    }
}
