//! Error types and result aliases for lakeshare.
//!
//! Every error maps onto an [`ErrorClass`] so that callers (and the external
//! delivery scheduler) can decide whether a failed invocation is worth retrying.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The result type used throughout lakeshare.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used for retry and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or API throttling; safe to retry at the scheduler level.
    Transient,
    /// A listing, environment, or catalog object vanished. Terminal for the event.
    NotFound,
    /// A resource exists in a shape incompatible with expectations. Needs manual review.
    Conflict,
    /// The execution role lacks a privilege. Fatal configuration error.
    PermissionDenied,
    /// The input itself is malformed. Terminal for the event.
    Invalid,
}

impl ErrorClass {
    /// Returns true if a later redelivery of the same input may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if an operator must be alerted immediately.
    #[must_use]
    pub const fn requires_alert(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Conflict)
    }

    /// Returns the class as a stable label (metrics, audit).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission_denied",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by collaborators and shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A create call hit an existing resource with the same identity.
    #[error("already exists: {resource_type} {id}")]
    AlreadyExists {
        /// The type of resource.
        resource_type: &'static str,
        /// The identifier that collided.
        id: String,
    },

    /// A resource exists but does not match what the caller expects.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the mismatch.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denial.
        message: String,
    },

    /// A remote call failed in a way that may succeed on retry.
    #[error("transient failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new already-exists error.
    #[must_use]
    pub fn already_exists(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new permission-denied error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Creates a new transient error with the given message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the retry/alert classification for this error.
    ///
    /// `AlreadyExists` classifies as a conflict; callers that can treat an
    /// existing resource as success check for it before classifying.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_) | Self::Serialization { .. } => ErrorClass::Invalid,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => ErrorClass::Conflict,
            Self::PermissionDenied { .. } => ErrorClass::PermissionDenied,
            Self::Transient { .. } | Self::Storage { .. } | Self::Internal { .. } => {
                ErrorClass::Transient
            }
        }
    }

    /// Returns true if this is an [`Error::AlreadyExists`].
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is an [`Error::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
