//! Error types for grant ledger operations.

use thiserror::Error;

use lakeshare_core::ErrorClass;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The underlying storage failed.
    #[error("ledger storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The storage error.
        #[source]
        source: lakeshare_core::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("ledger serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Stored state contradicts the ledger protocol.
    #[error("ledger invariant violated: {message}")]
    InvariantViolation {
        /// Description of the violation.
        message: String,
    },

    /// Conditional writes kept losing to concurrent writers.
    #[error("ledger contention on {key} after {attempts} attempts")]
    Contention {
        /// Record key.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },
}

impl LedgerError {
    pub(crate) fn storage(message: impl Into<String>, source: lakeshare_core::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source,
        }
    }

    /// Returns the retry/alert classification for this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Storage { source, .. } => source.class(),
            Self::Serialization { .. } | Self::InvariantViolation { .. } => ErrorClass::Conflict,
            Self::Contention { .. } => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_inherit_class() {
        let err = LedgerError::storage("read", lakeshare_core::Error::transient("timeout"));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("ledger storage error"));
    }

    #[test]
    fn corrupt_records_need_review() {
        let err = LedgerError::Serialization {
            message: "bad json".into(),
        };
        assert!(err.class().requires_alert());
        assert!(
            LedgerError::Contention {
                key: "k".into(),
                attempts: 3
            }
            .class()
            .is_retryable()
        );
    }
}
