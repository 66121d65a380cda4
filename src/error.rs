use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Intent, TaskId};

/// Classification used by the agent runtime to decide whether a failure
/// is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/transport fault, provider timeout, rate limit.
    Transient,
    /// Unknown intent, malformed payload, validation failure.
    Permanent,
    /// A per-task or per-stage timeout elapsed.
    Timeout,
    /// The task was cancelled before it produced a result.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::providers::ProviderError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Unknown intent: {0}")]
    UnknownIntent(Intent),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task cancelled: {0}")]
    Cancelled(TaskId),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Stage {stage} failed: {kind}: {message}")]
    StageFailed {
        stage: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Parent task {parent} is not running")]
    ParentNotRunning { parent: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

impl Error {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportUnavailable(_) | Error::Io(_) | Error::TaskJoin(_) => {
                ErrorKind::Transient
            }
            Error::Provider(e) => e.kind(),
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::StageFailed { kind, .. } => *kind,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedPayload(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!("{}", Error::TransportUnavailable("mem://local".to_string())),
            "Broker unavailable: mem://local"
        );
        assert_eq!(
            format!("{}", Error::UnknownIntent(Intent::Unknown("Dance".to_string()))),
            "Unknown intent: Dance"
        );
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let err = Error::TransportUnavailable("down".to_string());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_payload_errors_are_permanent() {
        assert_eq!(Error::malformed("missing entity").kind(), ErrorKind::Permanent);
        assert_eq!(
            Error::Validation("bad".to_string()).kind(),
            ErrorKind::Permanent
        );
        assert!(!Error::UnknownIntent(Intent::Unknown("x".to_string())).is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = Error::Timeout(Duration::from_secs(1));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!Error::Cancelled(TaskId::new()).is_retryable());
    }

    #[test]
    fn test_provider_error_kind_passes_through() {
        let err: Error = ProviderError::RateLimited("429".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err: Error = ProviderError::InvalidResponse("garbage".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_error_kind_serialization_format() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::Transient).unwrap(),
            r#""transient""#
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::Timeout).unwrap(),
            r#""timeout""#
        );
    }
}
