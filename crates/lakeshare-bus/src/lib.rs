//! # lakeshare-bus
//!
//! Event channel abstraction for lakeshare.
//!
//! This crate provides:
//!
//! - [`EventBusAddress`]: fully qualified regional bus address
//! - [`RoutingRule`] / [`EventPattern`]: declarative routing over `(detail type, source)`
//! - [`PublishPolicy`]: resource-level allow-list of publisher accounts
//! - [`EventChannel`]: trait for publishing onto a bus
//! - [`memory::InMemoryEventBus`]: in-memory multi-account bus for tests and simulation
//!
//! Delivery is at-least-once and unordered; consumers must be idempotent.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod address;
pub mod memory;
pub mod policy;
pub mod rule;

use async_trait::async_trait;

use lakeshare_core::{AccountId, EventId, Result, SubscriptionEvent};

pub use address::EventBusAddress;
pub use policy::PublishPolicy;
pub use rule::{EventPattern, RoutingRule, RuleTarget};

/// Acknowledgement of an accepted publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Id of the published envelope.
    pub event_id: EventId,
    /// Names of the rules the event matched on the target bus.
    pub matched_rules: Vec<String>,
}

/// Publishes events onto addressed buses.
///
/// ## Errors
///
/// - `NotFound` if the bus does not exist
/// - `PermissionDenied` if the bus policy does not allow the publisher
/// - `Transient` if the bus is temporarily unavailable
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publishes `event` onto `bus` on behalf of `publisher`.
    async fn publish(
        &self,
        bus: &EventBusAddress,
        publisher: &AccountId,
        event: &SubscriptionEvent,
    ) -> Result<PublishReceipt>;
}
