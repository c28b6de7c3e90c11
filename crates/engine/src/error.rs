//! Error types for the topic engine

use std::fmt;

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the engine
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Validation, msg)
    }

    /// Create an operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::OperationFailed, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Storage, msg)
    }

    /// Create a consensus error
    pub fn consensus(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Consensus, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }

    /// Whether this error is fatal for the replica (storage divergence or a
    /// broken consensus invariant; the replica must stop serving)
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Storage | ErrorKind::Consensus)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource not found
    NotFound,
    /// Invalid state for operation
    InvalidState,
    /// Operation failed
    OperationFailed,
    /// Operation timed out
    Timeout,
    /// Storage error
    Storage,
    /// Consensus error
    Consensus,
    /// Validation error
    Validation,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::OperationFailed => write!(f, "Operation failed"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::Consensus => write!(f, "Consensus error"),
            ErrorKind::Validation => write!(f, "Validation error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

// Conversion implementations for common error types

impl From<plume_storage::StorageError> for Error {
    fn from(err: plume_storage::StorageError) -> Self {
        Self {
            kind: ErrorKind::Storage,
            context: ErrorContext::Chain {
                message: "Storage operation failed".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            context: ErrorContext::Chain {
                message: "Serialization error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self {
            kind: ErrorKind::Internal,
            context: ErrorContext::Chain {
                message: "Task join error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<crate::subscription::SubscriptionError> for Error {
    fn from(err: crate::subscription::SubscriptionError) -> Self {
        Self::with_context(ErrorKind::InvalidState, format!("Subscription error: {err}"))
    }
}
