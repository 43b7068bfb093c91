//! Shared test utilities for lakeshare integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory ledger storage with operation recording
//! - [`World`]: A wired domain account plus producer accounts, buses and handlers
//! - Factory functions for accounts, principals, listings and events
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use lakeshare_test_utils::fixtures::{self, PRODUCER_ACCOUNT, REGION};
//! use lakeshare_test_utils::World;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let world = World::builder()
//!         .producer(PRODUCER_ACCOUNT, REGION)
//!         .listing("L1", PRODUCER_ACCOUNT, REGION, fixtures::orders())
//!         .build()
//!         .await;
//!     let consumer = fixtures::role(PRODUCER_ACCOUNT, fixtures::CONSUMER_ROLE);
//!     world.accept("L1", &consumer, &fixtures::orders()).await;
//!     world.pump().await;
//!     // ... assert on world.producer(PRODUCER_ACCOUNT, REGION) ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod simulation;
pub mod storage;

pub use assertions::*;
pub use simulation::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lakeshare=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
