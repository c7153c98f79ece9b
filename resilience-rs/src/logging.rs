//! # Structured Logging
//!
//! Installs the global `tracing` subscriber and provides helpers for
//! attaching request ids to spans and logging classified errors.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, ErrorKind, Result, Severity};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to also write logs to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "tonecraft".to_string(),
            json_format: false,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Initializes the structured logging system.
///
/// `RUST_LOG` wins over the configured level when set. Calling this more than
/// once is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let subscriber = Registry::default().with(filter);

    // Console output goes to stderr; stdout belongs to the binaries' results.
    let (json_layer, text_layer) = if config.json_format {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr);
        (Some(layer), None)
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);
        (None, Some(layer))
    };
    let subscriber = subscriber.with(json_layer).with(text_layer);

    let file_layer = match (config.file_output, config.log_dir.as_ref()) {
        (true, Some(log_dir)) => {
            let file_appender = RollingFileAppender::new(
                tracing_appender::rolling::Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = NonBlocking::new(file_appender);

            // The guard flushes on drop; it has to live as long as the process.
            Box::leak(Box::new(guard));

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };
    let subscriber = subscriber.with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        Error::new(
            ErrorKind::Configuration,
            format!("Failed to set global subscriber: {}", e),
        )
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Span carrying the request id; enter it (or `instrument` a future with it)
/// around everything done on behalf of one request.
pub fn request_span(request_id: &str) -> Span {
    tracing::info_span!("request", request_id = %request_id)
}

/// Logs an error at the level matching its severity
pub fn log_structured_error(error: &Error) {
    let service = error.service.as_deref().unwrap_or("unknown");
    let request_id = error.request_id.as_deref().unwrap_or("-");

    match error.severity {
        Severity::Critical => tracing::error!(
            error_id = %error.id,
            error_kind = %error.kind,
            service = %service,
            request_id = %request_id,
            message = %error.message,
            context = ?error.context,
            "Critical error occurred"
        ),
        Severity::Major => tracing::error!(
            error_id = %error.id,
            error_kind = %error.kind,
            service = %service,
            request_id = %request_id,
            message = %error.message,
            "Error occurred"
        ),
        Severity::Minor => tracing::warn!(
            error_id = %error.id,
            error_kind = %error.kind,
            service = %service,
            request_id = %request_id,
            message = %error.message,
            transient = %error.transient,
            "Recoverable error occurred"
        ),
        Severity::Info => tracing::info!(
            error_kind = %error.kind,
            service = %service,
            request_id = %request_id,
            message = %error.message,
            "Handled error"
        ),
    }
}
