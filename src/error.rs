/// Error types for the metric access pipeline
use thiserror::Error;

/// Main error type for access operations
#[derive(Error, Debug)]
pub enum AccessError {
    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// KV store operation failed
    #[error("KV error: {0}")]
    Kv(#[from] redis::RedisError),

    /// KV value had an unexpected shape
    #[error("KV type error on {key}: {message}")]
    KvType {
        /// Offending key
        key: String,
        /// What went wrong
        message: String,
    },

    /// Kafka operation failed
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// External data source query failed
    #[error("Data source error: {0}")]
    DataSource(String),

    /// Detector queue is over its hard cap
    #[error("Critical: queue {key} has {length} records pending, limit {limit}")]
    QueueOverflow {
        /// Detector queue key
        key: String,
        /// Current queue length
        length: usize,
        /// Hard cap
        limit: usize,
    },

    /// A filter failed to evaluate
    #[error("Filter error: {0}")]
    Filter(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The process is shutting down
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for access operations
pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Dropped record or skipped step, processing continues
    Warning,
    /// The current iteration failed, next cycle retries
    Error,
    /// Operator attention required
    Critical,
}

impl AccessError {
    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AccessError::Decode(_) | AccessError::Filter(_) => ErrorSeverity::Warning,
            AccessError::Kafka(_) | AccessError::Kv(_) | AccessError::KvType { .. } => {
                ErrorSeverity::Warning
            }
            AccessError::Shutdown(_) => ErrorSeverity::Warning,
            AccessError::QueueOverflow { .. } => ErrorSeverity::Critical,
            AccessError::Config(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Emit this error through `tracing` at a level matching its severity
    pub fn log(&self, context: &str) {
        match self.severity() {
            ErrorSeverity::Warning => tracing::warn!("{}: {}", context, self),
            ErrorSeverity::Error => tracing::error!("{}: {}", context, self),
            ErrorSeverity::Critical => {
                tracing::error!(severity = "critical", "{}: {}", context, self)
            }
        }
    }
}

/// Error chain helper for adding context
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, msg: impl Into<String>) -> AccessResult<T>;

    /// Add context with format
    fn with_context<F>(self, f: F) -> AccessResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for AccessResult<T> {
    fn context(self, msg: impl Into<String>) -> AccessResult<T> {
        self.map_err(|e| AccessError::Internal(format!("{}: {}", msg.into(), e)))
    }

    fn with_context<F>(self, f: F) -> AccessResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AccessError::Internal(format!("{}: {}", f(), e)))
    }
}

/// Convert from channel send errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AccessError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AccessError::Shutdown(format!("Failed to send: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AccessError::QueueOverflow {
            key: "access.data.1.2".to_string(),
            length: 100_001,
            limit: 100_000,
        };
        assert_eq!(
            err.to_string(),
            "Critical: queue access.data.1.2 has 100001 records pending, limit 100000"
        );
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            AccessError::Decode("bad".into()).severity(),
            ErrorSeverity::Warning
        );
        assert_eq!(
            AccessError::DataSource("down".into()).severity(),
            ErrorSeverity::Error
        );
    }

    #[test]
    fn test_error_context() {
        let result: AccessResult<()> = Err(AccessError::Decode("test".to_string()));
        let with_context = result.context("while flattening record");
        assert!(with_context
            .unwrap_err()
            .to_string()
            .contains("while flattening record"));
    }
}
