//! Error types for the dispatcher, grant handler and admin bootstrap.
//!
//! Each error classifies into an [`ErrorClass`]. `Transient` errors are
//! retried by the invoking scheduler; everything else is terminal for the event.

use thiserror::Error;

use lakeshare_core::ErrorClass;
use lakeshare_ledger::{GrantStep, LedgerError};

/// Errors returned by [`crate::dispatcher::Dispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The event is malformed.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// What is wrong with the event.
        message: String,
    },

    /// The listing or its environment no longer exists.
    #[error("unresolved destination for listing {listing_id}: {source}")]
    UnresolvedDestination {
        /// Listing that could not be resolved.
        listing_id: String,
        /// The lookup failure.
        #[source]
        source: lakeshare_core::Error,
    },

    /// A directory lookup failed for another reason.
    #[error("directory lookup failed: {source}")]
    Directory {
        /// The lookup failure.
        #[source]
        source: lakeshare_core::Error,
    },

    /// The destination bus rejected or failed the publish.
    #[error("publish to {bus} failed: {source}")]
    Publish {
        /// Destination bus ARN.
        bus: String,
        /// The publish failure.
        #[source]
        source: lakeshare_core::Error,
    },
}

impl DispatchError {
    /// Returns the retry/alert classification.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidEvent { .. } => ErrorClass::Invalid,
            Self::UnresolvedDestination { .. } => ErrorClass::NotFound,
            Self::Directory { source } | Self::Publish { source, .. } => source.class(),
        }
    }
}

/// Errors returned by [`crate::grant::GrantHandler::grant`].
#[derive(Debug, Error)]
pub enum GrantError {
    /// The event is malformed or cannot be granted.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// What is wrong with the event.
        message: String,
    },

    /// The ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A grant step failed. The record is marked failed at this step.
    #[error("grant step {step} failed: {source}")]
    Step {
        /// Step that failed.
        step: GrantStep,
        /// The collaborator failure.
        #[source]
        source: lakeshare_core::Error,
    },

    /// Another delivery took over the claim while this one was running.
    #[error("claim on {key} was lost to another delivery")]
    ClaimLost {
        /// Grant key.
        key: String,
    },
}

impl GrantError {
    /// Returns the retry/alert classification.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidEvent { .. } => ErrorClass::Invalid,
            Self::Ledger(e) => e.class(),
            Self::Step { source, .. } => source.class(),
            Self::ClaimLost { .. } => ErrorClass::Transient,
        }
    }

    /// Returns the failed step, if the error came from one.
    #[must_use]
    pub const fn step(&self) -> Option<GrantStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Errors returned by [`crate::bootstrap::AdminBootstrap::reconcile`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading or writing the administrator setting failed.
    #[error("lake settings call failed: {source}")]
    Settings {
        /// The settings failure.
        #[source]
        source: lakeshare_core::Error,
    },

    /// Validating a declared role failed.
    #[error("identity lookup failed: {source}")]
    Identity {
        /// The identity failure.
        #[source]
        source: lakeshare_core::Error,
    },

    /// Declared administrators were still missing after every attempt.
    #[error("administrators did not converge after {attempts} attempts; missing: {missing:?}")]
    Unconverged {
        /// Attempts made.
        attempts: u32,
        /// Declared administrators absent from the final read.
        missing: Vec<String>,
    },
}

impl ReconcileError {
    /// Returns the retry/alert classification.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Settings { source } | Self::Identity { source } => source.class(),
            Self::Unconverged { .. } => ErrorClass::Conflict,
        }
    }
}
