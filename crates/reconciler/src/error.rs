//! Error types for reconciliation.
//!
//! Apply errors are categorized so the sync orchestrator can decide between
//! retrying with backoff and failing the operation outright. Render errors
//! stop an operation before any destination call is made.

use crate::types::ResourceKey;
use std::path::PathBuf;
use thiserror::Error;

/// Categories of destination errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limiting, lost connectivity, optimistic-concurrency conflicts
    Transient,
    /// Validation rejection, forbidden operations, missing objects
    Permanent,
}

impl ErrorCategory {
    /// Whether this error category is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Short label used in operation messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Errors returned by a destination adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// The destination asked us to slow down
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// The destination could not be reached
    #[error("destination unavailable: {message}")]
    Unavailable { message: String },

    /// The object changed underneath us (stale resource version)
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// The call did not complete in time
    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// The manifest was rejected by schema validation
    #[error("invalid {key}: {message}")]
    Invalid { key: String, message: String },

    /// The operation is not permitted
    #[error("forbidden {key}: {message}")]
    Forbidden { key: String, message: String },

    /// The object does not exist
    #[error("not found: {key}")]
    NotFound { key: String },

    /// The destination cannot stream changes
    #[error("watch not supported by destination {destination}")]
    WatchUnsupported { destination: String },

    /// The operation was stopped before the call was issued
    #[error("stopped before the call was issued")]
    Cancelled,
}

impl ApplyError {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. }
            | Self::Unavailable { .. }
            | Self::Conflict { .. }
            | Self::Timeout { .. } => ErrorCategory::Transient,
            Self::Invalid { .. }
            | Self::Forbidden { .. }
            | Self::NotFound { .. }
            | Self::WatchUnsupported { .. }
            | Self::Cancelled => ErrorCategory::Permanent,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether this error means the object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classify a status code returned by an API-style destination.
    pub fn from_status(status: u16, key: &ResourceKey, message: &str) -> Self {
        let key = key.to_string();
        let message = message.trim().to_string();
        match status {
            429 => Self::RateLimited { message },
            409 => Self::Conflict { key, message },
            408 | 504 => Self::Timeout { message },
            403 | 401 => Self::Forbidden { key, message },
            404 => Self::NotFound { key },
            400 | 422 => Self::Invalid { key, message },
            _ if status >= 500 => Self::Unavailable { message },
            _ => Self::Invalid { key, message },
        }
    }

    /// Classify a filesystem error raised while touching `key`.
    pub fn from_io(err: &std::io::Error, key: &ResourceKey) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NotFound {
                key: key.to_string(),
            },
            ErrorKind::PermissionDenied => Self::Forbidden {
                key: key.to_string(),
                message: err.to_string(),
            },
            ErrorKind::InvalidData => Self::Invalid {
                key: key.to_string(),
                message: err.to_string(),
            },
            ErrorKind::TimedOut => Self::Timeout {
                message: err.to_string(),
            },
            _ => Self::Unavailable {
                message: err.to_string(),
            },
        }
    }
}

/// Errors raised while turning a rendered manifest set into desired resources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// Rendered output could not be read
    #[error("cannot read {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// A document is not valid YAML or JSON
    #[error("cannot parse {origin}: {message}")]
    Parse { origin: String, message: String },

    /// A manifest lacks a required field
    #[error("manifest #{index} is missing {field}")]
    MissingField { index: usize, field: &'static str },

    /// An annotation carries a value we cannot interpret
    #[error("{key}: invalid annotation {annotation}={value}")]
    InvalidAnnotation {
        key: String,
        annotation: &'static str,
        value: String,
    },

    /// Two manifests resolve to the same resource
    #[error("duplicate resource {key}")]
    Duplicate { key: String },

    /// The requested revision does not exist in the source
    #[error("revision {revision} not found for {app}")]
    UnknownRevision { app: String, revision: String },
}

/// Errors returned by the controller's command surface.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No application registered under this name
    #[error("unknown application: {0}")]
    UnknownApplication(String),

    /// An application with this name is already registered
    #[error("application already registered: {0}")]
    DuplicateApplication(String),

    /// The application targets a destination that was never added
    #[error("unknown destination {destination} for application {app}")]
    UnknownDestination { app: String, destination: String },

    /// Desired state could not be rendered
    #[error(transparent)]
    Render(#[from] RenderError),

    /// A destination call failed outside of a sync operation
    #[error(transparent)]
    Destination(#[from] ApplyError),

    /// Rollback target is not a successful entry in history
    #[error("revision {revision} is not in the sync history of {app}")]
    RevisionNotInHistory { app: String, revision: String },

    /// Rollback would immediately be undone by automated sync
    #[error("rollback is not allowed while automated sync is enabled for {0}")]
    RollbackWithAutomatedSync(String),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
