//! # Error Taxonomy
//!
//! Every Tonecraft crate keeps its own `thiserror` enum and classifies it
//! through [`ServiceError`]. The orchestrating driver only ever looks at the
//! classification: transient errors are retried (subject to the circuit
//! breaker), everything else ends the request.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    /// Expected and handled by a fallback
    Info,
    /// Recoverable by retrying
    Minor,
    /// Ends the affected request
    #[default]
    Major,
    /// Ends every subsequent request until an operator steps in
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Categorizes failures by how the caller should react to them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The inference call missed its deadline
    Timeout,
    /// The worker died while a call was in flight
    WorkerCrashed,
    /// The circuit breaker refused the attempt
    CircuitOpen,
    /// The worker pool exhausted its restart budget
    ResourceExhausted,
    /// The corpus had nothing to offer; resolved with a default entry
    CorpusEmpty,
    /// Durable storage rejected a read or write
    Persistence,
    /// A request was advanced out of order or after it finished
    InvalidTransition,
    /// No such request
    NotFound,
    /// Bad or missing configuration
    Configuration,
    /// Malformed data crossing a boundary
    Serialization,
    /// The component is shutting down
    Shutdown,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Whether a retry (or fallback) can be expected to succeed
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::WorkerCrashed | ErrorKind::CircuitOpen
        )
    }

    /// Default severity for this kind of failure
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::CorpusEmpty => Severity::Info,
            ErrorKind::Timeout | ErrorKind::WorkerCrashed | ErrorKind::CircuitOpen => Severity::Minor,
            ErrorKind::ResourceExhausted => Severity::Critical,
            _ => Severity::Major,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::WorkerCrashed => write!(f, "Worker Crash Error"),
            ErrorKind::CircuitOpen => write!(f, "Circuit Open Error"),
            ErrorKind::ResourceExhausted => write!(f, "Resource Exhausted Error"),
            ErrorKind::CorpusEmpty => write!(f, "Corpus Empty Error"),
            ErrorKind::Persistence => write!(f, "Persistence Error"),
            ErrorKind::InvalidTransition => write!(f, "Invalid Transition Error"),
            ErrorKind::NotFound => write!(f, "Not Found Error"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Serialization => write!(f, "Serialization Error"),
            ErrorKind::Shutdown => write!(f, "Shutdown Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type shared across the workspace
///
/// `Clone` is implemented manually so that cloned errors drop the opaque
/// `cause`, keeping them serializable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Error severity level
    pub severity: Severity,
    /// The component where the error originated
    pub service: Option<String>,
    /// Request the error belongs to, if any
    pub request_id: Option<String>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Chain of causes (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    /// Flag indicating if this is a transient error that might succeed on retry
    pub transient: bool,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            service: self.service.clone(),
            request_id: self.request_id.clone(),
            context: self.context.clone(),
            cause: None,
            transient: self.transient,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: kind.severity(),
            service: None,
            request_id: None,
            context: serde_json::Map::new(),
            cause: None,
            transient: kind.is_transient(),
        }
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the originating component
    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Ties the error to a request
    pub fn request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns true if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(service) = &self.service {
            write!(f, " [Service: {}]", service)?;
        }

        if let Some(request_id) = &self.request_id {
            write!(f, " [Request: {}]", request_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Persistence, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

/// Classification hook implemented by every crate-level error enum
pub trait ServiceError: StdError + Send + Sync + 'static {
    /// Where this error sits in the taxonomy
    fn kind(&self) -> ErrorKind;

    /// Name of the component raising the error
    fn service(&self) -> &'static str;

    /// Returns true if this error is transient and might succeed on retry
    fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Returns the error's severity level
    fn severity(&self) -> Severity {
        self.kind().severity()
    }

    /// Converts the service error to the standard Error type
    fn to_error(&self) -> Error {
        Error::new(self.kind(), self.to_string())
            .service(self.service())
            .severity(self.severity())
    }
}
