//! # lakeshare-core
//!
//! Shared primitives for the lakeshare cross-account grant orchestrator.
//!
//! - **Identifiers**: account ids, regions, principal ARNs, asset references
//! - **Event model**: the subscription event envelope exchanged over event buses
//! - **Storage**: the conditional-write contract the grant ledger is built on
//! - **Errors**: shared error type with retry/alert classification
//! - **Observability**: logging initialization, span helpers, audit events
//!
//! ## Example
//!
//! ```rust
//! use lakeshare_core::prelude::*;
//!
//! let principal: PrincipalArn = "arn:aws:iam::222222222222:role/consumer".parse().unwrap();
//! let asset = AssetRef::new("sales", "orders");
//! assert_eq!(principal.role_name(), Some("consumer"));
//! assert_eq!(asset.qualified_name(), "sales.orders");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod asset;
pub mod audit;
pub mod error;
pub mod event;
pub mod id;
pub mod observability;
pub mod principal;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::asset::AssetRef;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::event::{
        DetailType, EnvironmentContext, SubscriptionDetail, SubscriptionEvent,
    };
    pub use crate::id::{AccountId, EventId, Region};
    pub use crate::principal::PrincipalArn;
    pub use crate::storage::{MemoryBackend, StorageBackend, WritePrecondition, WriteResult};
}

pub use asset::AssetRef;
pub use error::{Error, ErrorClass, Result};
pub use event::{DetailType, EnvironmentContext, SubscriptionDetail, SubscriptionEvent};
pub use id::{AccountId, EventId, Region};
pub use observability::{LogFormat, init_logging};
pub use principal::PrincipalArn;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
