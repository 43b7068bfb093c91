//! In-memory event bus for testing and simulation.
//!
//! This module provides [`InMemoryEventBus`], a multi-account, multi-region
//! implementation of [`EventChannel`].
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Synchronous routing**: Rules are evaluated inside `publish`; handler
//!   targets are queued and must be drained by the caller
//! - **Bounded forwarding**: Bus-to-bus forwarding stops after [`MAX_HOPS`]

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use lakeshare_core::{AccountId, Error, Result, SubscriptionEvent};

use crate::{EventBusAddress, EventChannel, PublishPolicy, PublishReceipt, RoutingRule, RuleTarget};

/// Maximum bus-to-bus forwarding depth.
pub const MAX_HOPS: usize = 4;

/// An event accepted by a bus.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Bus that accepted the event.
    pub bus: EventBusAddress,
    /// Account that published it.
    pub publisher: AccountId,
    /// The event.
    pub event: SubscriptionEvent,
}

/// An event queued for a handler target.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Bus the event was published on.
    pub bus: EventBusAddress,
    /// Rule that matched.
    pub rule: String,
    /// The event.
    pub event: SubscriptionEvent,
}

#[derive(Debug)]
struct BusEntry {
    policy: PublishPolicy,
    rules: Vec<RoutingRule>,
}

/// Internal state protected by a single lock.
#[derive(Debug, Default)]
struct BusState {
    buses: HashMap<EventBusAddress, BusEntry>,
    published: Vec<PublishedEvent>,
    inboxes: HashMap<String, VecDeque<Delivery>>,
    fail_next: u32,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("event bus lock poisoned")
}

/// In-memory event bus.
///
/// ## Example
///
/// ```rust
/// use lakeshare_bus::memory::InMemoryEventBus;
/// use lakeshare_bus::{EventBusAddress, PublishPolicy};
///
/// let bus = InMemoryEventBus::new();
/// let address = EventBusAddress::new(
///     "222222222222".parse().unwrap(),
///     "us-east-1".parse().unwrap(),
///     "default",
/// );
/// bus.create_bus(address.clone(), PublishPolicy::owner_only(address.account.clone()))
///     .unwrap();
/// assert_eq!(bus.publish_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    state: RwLock<BusState>,
}

impl InMemoryEventBus {
    /// Creates an empty bus registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces the policy of) a bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn create_bus(&self, address: EventBusAddress, policy: PublishPolicy) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .buses
            .entry(address)
            .and_modify(|entry| entry.policy = policy.clone())
            .or_insert_with(|| BusEntry {
                policy,
                rules: Vec::new(),
            });
        drop(state);
        Ok(())
    }

    /// Adds or replaces a rule (by name) on a bus.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus does not exist.
    pub fn put_rule(&self, bus: &EventBusAddress, rule: RoutingRule) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state
            .buses
            .get_mut(bus)
            .ok_or_else(|| Error::not_found("event bus", bus))?;
        entry.rules.retain(|existing| existing.name != rule.name);
        entry.rules.push(rule);
        drop(state);
        Ok(())
    }

    /// Returns the rules attached to a bus.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus does not exist.
    pub fn rules(&self, bus: &EventBusAddress) -> Result<Vec<RoutingRule>> {
        let state = self.state.read().map_err(poison_err)?;
        state
            .buses
            .get(bus)
            .map(|entry| entry.rules.clone())
            .ok_or_else(|| Error::not_found("event bus", bus))
    }

    /// Makes the next `count` publish calls fail with a transient error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_publishes(&self, count: u32) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.fail_next = count;
        drop(state);
        Ok(())
    }

    /// Removes and returns every delivery queued for a handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self, handler: &str) -> Result<Vec<Delivery>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let drained = state
            .inboxes
            .get_mut(handler)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default();
        drop(state);
        Ok(drained)
    }

    /// Returns every event accepted so far, in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<PublishedEvent>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.published.clone())
    }

    /// Returns the number of accepted publishes (including forwarded ones).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn publish_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.published.len())
    }

    fn route(
        state: &mut BusState,
        bus: &EventBusAddress,
        publisher: &AccountId,
        event: &SubscriptionEvent,
        hops: usize,
    ) -> Result<Vec<String>> {
        let entry = state
            .buses
            .get(bus)
            .ok_or_else(|| Error::not_found("event bus", bus))?;
        if !entry.policy.permits(publisher) {
            return Err(Error::permission_denied(format!(
                "account {publisher} may not publish to {bus}"
            )));
        }

        let mut matched = Vec::new();
        let mut forwards = Vec::new();
        let mut deliveries = Vec::new();
        for rule in &entry.rules {
            let targets = rule.targets_for(event);
            if targets.is_empty() {
                continue;
            }
            matched.push(rule.name.clone());
            for target in targets {
                match target {
                    RuleTarget::Bus(next) => forwards.push(next.clone()),
                    RuleTarget::Handler(name) => deliveries.push((
                        name.clone(),
                        Delivery {
                            bus: bus.clone(),
                            rule: rule.name.clone(),
                            event: event.clone(),
                        },
                    )),
                }
            }
        }

        state.published.push(PublishedEvent {
            bus: bus.clone(),
            publisher: publisher.clone(),
            event: event.clone(),
        });
        for (handler, delivery) in deliveries {
            state.inboxes.entry(handler).or_default().push_back(delivery);
        }

        for next in forwards {
            if hops >= MAX_HOPS {
                tracing::warn!(bus = %bus, target = %next, "dropping forward beyond hop limit");
                continue;
            }
            // Forwarding publishes as the owner of the current bus. A rejected
            // forward does not fail the original publish.
            if let Err(e) = Self::route(state, &next, &bus.account, event, hops + 1) {
                tracing::warn!(bus = %bus, target = %next, error = %e, "forward rejected");
            }
        }

        Ok(matched)
    }
}

#[async_trait]
impl EventChannel for InMemoryEventBus {
    async fn publish(
        &self,
        bus: &EventBusAddress,
        publisher: &AccountId,
        event: &SubscriptionEvent,
    ) -> Result<PublishReceipt> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::transient(format!("injected publish failure on {bus}")));
        }
        let matched_rules = Self::route(&mut state, bus, publisher, event, 0)?;
        drop(state);

        tracing::debug!(bus = %bus, event_id = %event.id, rules = ?matched_rules, "published event");
        Ok(PublishReceipt {
            event_id: event.id.clone(),
            matched_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventPattern;
    use lakeshare_core::{AssetRef, DetailType, ErrorClass, SubscriptionDetail};

    fn account(id: &str) -> AccountId {
        id.parse().unwrap()
    }

    fn address(id: &str, region: &str) -> EventBusAddress {
        EventBusAddress::new(account(id), region.parse().unwrap(), "default")
    }

    fn event(detail_type: DetailType, source: &str) -> SubscriptionEvent {
        SubscriptionEvent::new(
            detail_type,
            source,
            SubscriptionDetail {
                listing_id: "L1".into(),
                target_principal_arn: "arn:aws:iam::222222222222:role/consumer".parse().unwrap(),
                target_asset_ref: AssetRef::new("sales", "orders"),
                origin_account_id: None,
                origin_region: None,
                domain_id: None,
                subscription_request_id: None,
                is_managed_asset: false,
                environment: None,
            },
        )
    }

    fn producer_bus() -> (InMemoryEventBus, EventBusAddress) {
        let bus = InMemoryEventBus::new();
        let producer = address("222222222222", "us-east-1");
        bus.create_bus(
            producer.clone(),
            PublishPolicy::owner_only(producer.account.clone()).allow(account("111111111111")),
        )
        .unwrap();
        bus.put_rule(
            &producer,
            RoutingRule::new(
                "unmanaged-acceptance",
                EventPattern::any()
                    .with_detail_type(DetailType::UnmanagedAssetSubscriptionRequestAccepted),
            )
            .with_target(RuleTarget::Handler("grant".into())),
        )
        .unwrap();
        (bus, producer)
    }

    #[tokio::test]
    async fn test_publish_routes_to_handler() {
        let (bus, producer) = producer_bus();
        let receipt = bus
            .publish(
                &producer,
                &account("111111111111"),
                &event(
                    DetailType::UnmanagedAssetSubscriptionRequestAccepted,
                    "custom.lakeshare",
                ),
            )
            .await
            .expect("publish");

        assert_eq!(receipt.matched_rules, vec!["unmanaged-acceptance".to_string()]);
        let deliveries = bus.drain("grant").expect("drain");
        assert_eq!(deliveries.len(), 1);
        assert!(bus.drain("grant").expect("drain").is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_event_is_accepted_but_not_delivered() {
        let (bus, producer) = producer_bus();
        let receipt = bus
            .publish(
                &producer,
                &account("222222222222"),
                &event(DetailType::UnmanagedAssetGranted, "custom.lakeshare"),
            )
            .await
            .expect("publish");
        assert!(receipt.matched_rules.is_empty());
        assert_eq!(bus.publish_count().expect("count"), 1);
        assert!(bus.drain("grant").expect("drain").is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_publisher_is_rejected() {
        let (bus, producer) = producer_bus();
        let err = bus
            .publish(
                &producer,
                &account("999999999999"),
                &event(DetailType::UnmanagedAssetSubscriptionRequestAccepted, "x"),
            )
            .await
            .expect_err("should be denied");
        assert_eq!(err.class(), ErrorClass::PermissionDenied);
        assert_eq!(bus.publish_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn test_unknown_bus_is_not_found() {
        let (bus, _) = producer_bus();
        let err = bus
            .publish(
                &address("333333333333", "eu-west-1"),
                &account("111111111111"),
                &event(DetailType::SubscriptionRequestAccepted, "aws.datazone"),
            )
            .await
            .expect_err("unknown bus");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let (bus, producer) = producer_bus();
        bus.fail_next_publishes(1).expect("inject");
        let e = event(DetailType::UnmanagedAssetSubscriptionRequestAccepted, "x");

        let err = bus
            .publish(&producer, &account("222222222222"), &e)
            .await
            .expect_err("injected");
        assert!(err.class().is_retryable());
        bus.publish(&producer, &account("222222222222"), &e)
            .await
            .expect("second publish succeeds");
    }

    #[tokio::test]
    async fn test_forwarding_between_buses() {
        let (bus, producer) = producer_bus();
        let domain = address("111111111111", "us-east-1");
        bus.create_bus(domain.clone(), PublishPolicy::owner_only(domain.account.clone()))
            .unwrap();
        bus.put_rule(
            &domain,
            RoutingRule::new("forward", EventPattern::any())
                .with_target(RuleTarget::Bus(producer.clone())),
        )
        .unwrap();

        bus.publish(
            &domain,
            &account("111111111111"),
            &event(DetailType::UnmanagedAssetSubscriptionRequestAccepted, "x"),
        )
        .await
        .expect("publish");

        assert_eq!(bus.publish_count().expect("count"), 2);
        assert_eq!(bus.drain("grant").expect("drain").len(), 1);
    }

    #[tokio::test]
    async fn test_forwarding_loops_terminate() {
        let bus = InMemoryEventBus::new();
        let a = address("111111111111", "us-east-1");
        let b = address("111111111111", "us-west-2");
        for (from, to) in [(&a, &b), (&b, &a)] {
            bus.create_bus(from.clone(), PublishPolicy::owner_only(from.account.clone()))
                .unwrap();
            bus.put_rule(
                from,
                RoutingRule::new("loop", EventPattern::any()).with_target(RuleTarget::Bus(to.clone())),
            )
            .unwrap();
        }

        bus.publish(
            &a,
            &account("111111111111"),
            &event(DetailType::SubscriptionRequestAccepted, "x"),
        )
        .await
        .expect("publish");
        assert_eq!(bus.publish_count().expect("count"), MAX_HOPS + 1);
    }
}
