//! # lakeshare-ledger
//!
//! Durable idempotency ledger for cross-account grants.
//!
//! Each `(principal, asset)` pair owns exactly one [`GrantRecord`]. Every
//! delivery of a subscription event, duplicate or not, goes through the ledger
//! before touching any external system; conditional writes on the record
//! version are the only coordination between concurrent deliveries.
//!
//! ## Storage Layout
//!
//! ```text
//! grants/
//! └── {key_hash_prefix}/
//!     └── {key_hash}.json      # one GrantRecord per (principal, asset)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use lakeshare_core::{AssetRef, MemoryBackend};
//! use lakeshare_ledger::{ClaimOutcome, GrantKey, GrantLedger};
//!
//! # tokio_test::block_on(async {
//! let ledger = GrantLedger::new(Arc::new(MemoryBackend::new()));
//! let key = GrantKey::new(
//!     "arn:aws:iam::222222222222:role/consumer".parse().unwrap(),
//!     &AssetRef::new("sales", "orders"),
//! );
//!
//! let outcome = ledger.claim(&key, Some("req-1"), "evt-1").await.unwrap();
//! assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ledger;
pub mod metrics;
pub mod record;

pub use error::{LedgerError, Result};
pub use ledger::{
    ClaimOutcome, DEFAULT_STALE_TIMEOUT, FinalizeResult, GrantLedger, MAX_CAS_ATTEMPTS,
    RecordVersion,
};
pub use record::{GrantKey, GrantRecord, GrantStatus, GrantStep, VerificationFailure};
