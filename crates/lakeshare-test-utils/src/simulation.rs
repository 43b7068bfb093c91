//! Wired in-memory deployment for end-to-end scenarios.
//!
//! A [`World`] holds one governance domain account and any number of
//! producer accounts. Buses, allow-lists and rules come from the same
//! [`DeploymentPlan`] a real deployment uses; every producer gets its own
//! ledger, grant handler and in-memory account, with the execution role
//! promoted to administrator through [`AdminBootstrap`].
//!
//! Delivery is explicit: [`World::pump`] drains the dispatcher and grant
//! handler inboxes until both are empty, so scenarios stay deterministic.
//!
//! # Example
//!
//! ```rust,ignore
//! use lakeshare_test_utils::{World, fixtures};
//!
//! let world = World::builder()
//!     .producer(fixtures::PRODUCER_ACCOUNT, fixtures::REGION)
//!     .listing("L1", fixtures::PRODUCER_ACCOUNT, fixtures::REGION, fixtures::orders())
//!     .build()
//!     .await;
//! let consumer = fixtures::role(fixtures::PRODUCER_ACCOUNT, fixtures::CONSUMER_ROLE);
//! world.accept("L1", &consumer, &fixtures::orders()).await;
//! let report = world.pump().await;
//! assert_eq!(report.granted(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use lakeshare_bus::memory::{Delivery, InMemoryEventBus};
use lakeshare_bus::EventChannel;
use lakeshare_core::audit::{AuditEmitter, MemoryAuditSink};
use lakeshare_core::{AccountId, AssetRef, PrincipalArn, Region, SubscriptionEvent};
use lakeshare_flow::deployment::{ANNOUNCEMENTS, DISPATCHER, GRANT_HANDLER};
use lakeshare_flow::directory::memory::InMemoryDirectory;
use lakeshare_flow::ports::TableInfo;
use lakeshare_flow::ports::memory::InMemoryAccount;
use lakeshare_flow::{
    AdminBootstrap, Config, DeploymentPlan, DispatchError, DispatchOutcome, Dispatcher,
    GrantError, GrantHandler, GrantOutcome, GrantPorts,
};
use lakeshare_ledger::{GrantKey, GrantLedger, GrantRecord};

use crate::fixtures;
use crate::storage::TracingMemoryBackend;

/// Upper bound on pump rounds; forwarding never needs more than a few.
const MAX_PUMP_ROUNDS: usize = 16;

/// One producer account with its handler and ledger.
pub struct Producer {
    /// Handler configuration.
    pub config: Config,
    /// Catalog, permissions, shares, identity and settings of the account.
    pub account: Arc<InMemoryAccount>,
    /// Ledger storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Audit events emitted by the handler and bootstrap.
    pub audit: Arc<MemoryAuditSink>,
    /// Grant handler subscribed to the producer bus.
    pub handler: Arc<GrantHandler<TracingMemoryBackend>>,
}

impl Producer {
    /// Returns an admin bootstrap for this account.
    pub fn bootstrap(&self) -> AdminBootstrap {
        AdminBootstrap::new(&self.config, self.account.clone(), self.account.clone())
            .with_audit(AuditEmitter::new(self.audit.clone()))
    }

    /// Returns the ledger record of a grant key.
    pub async fn record(&self, principal: &PrincipalArn, asset: &AssetRef) -> Option<GrantRecord> {
        let key = GrantKey::new(principal.clone(), asset);
        self.handler
            .ledger()
            .get(&key)
            .await
            .expect("ledger read")
            .map(|(record, _)| record)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("account_id", &self.config.account_id)
            .field("region", &self.config.region)
            .finish_non_exhaustive()
    }
}

/// Outcomes of one [`World::pump`].
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Dispatcher results, in delivery order.
    pub dispatched: Vec<Result<DispatchOutcome, DispatchError>>,
    /// Grant handler results, in delivery order.
    pub grants: Vec<Result<GrantOutcome, GrantError>>,
}

impl PumpReport {
    /// Returns the number of deliveries that ended granted.
    pub fn granted(&self) -> usize {
        self.grants
            .iter()
            .filter(|r| matches!(r, Ok(GrantOutcome::Granted(_))))
            .count()
    }

    /// Returns the number of dispatches that published.
    pub fn published(&self) -> usize {
        self.dispatched
            .iter()
            .filter(|r| matches!(r, Ok(DispatchOutcome::Published { .. })))
            .count()
    }

    /// Returns the failed grant deliveries.
    pub fn grant_errors(&self) -> Vec<&GrantError> {
        self.grants.iter().filter_map(|r| r.as_ref().err()).collect()
    }

    /// Returns the failed dispatches.
    pub fn dispatch_errors(&self) -> Vec<&DispatchError> {
        self.dispatched.iter().filter_map(|r| r.as_ref().err()).collect()
    }
}

/// Builder for [`World`].
#[derive(Debug, Default)]
pub struct WorldBuilder {
    producers: Vec<(String, String)>,
    listings: Vec<(String, String, String, AssetRef)>,
    announce_grants: bool,
}

impl WorldBuilder {
    /// Adds a producer account with one environment.
    #[must_use]
    pub fn producer(mut self, account_id: &str, region: &str) -> Self {
        self.producers.push((account_id.to_string(), region.to_string()));
        self
    }

    /// Publishes `asset` from a producer under `listing_id`.
    #[must_use]
    pub fn listing(mut self, listing_id: &str, account_id: &str, region: &str, asset: AssetRef) -> Self {
        self.listings.push((
            listing_id.to_string(),
            account_id.to_string(),
            region.to_string(),
            asset,
        ));
        self
    }

    /// Enables grant announcements on every producer.
    #[must_use]
    pub fn announce_grants(mut self) -> Self {
        self.announce_grants = true;
        self
    }

    /// Wires the world and deploys its buses.
    pub async fn build(self) -> World {
        let directory = Arc::new(InMemoryDirectory::new());
        let bus = Arc::new(InMemoryEventBus::new());

        for (account_id, region) in &self.producers {
            directory
                .put_environment(fixtures::environment(
                    &environment_id(account_id, region),
                    account_id,
                    region,
                ))
                .expect("put environment");
        }
        for (listing_id, account_id, region, asset) in &self.listings {
            let environment = fixtures::environment(&environment_id(account_id, region), account_id, region);
            directory
                .put_listing(fixtures::listing(listing_id, &environment, asset))
                .expect("put listing");
        }

        let mut domain_config = fixtures::domain_config();
        domain_config.announce_grants = self.announce_grants;
        let plan = DeploymentPlan::plan(&domain_config, directory.as_ref())
            .await
            .expect("deployment plan");
        plan.apply(&bus).expect("apply deployment");

        let domain_audit = Arc::new(MemoryAuditSink::new());
        let dispatcher = Dispatcher::new(&domain_config, directory.clone(), bus.clone())
            .with_audit(AuditEmitter::new(domain_audit.clone()));

        let mut producers = BTreeMap::new();
        for (account_id, region) in &self.producers {
            let mut config = fixtures::producer_config(account_id, region);
            config.announce_grants = self.announce_grants;
            let assets = self
                .listings
                .iter()
                .filter(|(_, a, r, _)| a == account_id && r == region)
                .map(|(_, _, _, asset)| asset);
            let producer = provision(config, assets, &bus).await;
            producers.insert(
                (fixtures::account(account_id), fixtures::region(region)),
                producer,
            );
        }

        World {
            directory,
            bus,
            plan,
            dispatcher,
            domain_audit,
            domain_config,
            producers,
        }
    }
}

fn environment_id(account_id: &str, region: &str) -> String {
    format!("env-{account_id}-{region}")
}

async fn provision<'a>(
    config: Config,
    assets: impl Iterator<Item = &'a AssetRef>,
    bus: &Arc<InMemoryEventBus>,
) -> Producer {
    let account = Arc::new(InMemoryAccount::new(config.account_id.clone()));
    account.add_role(fixtures::EXECUTION_ROLE).expect("add role");
    account.add_role(fixtures::CONSUMER_ROLE).expect("add role");
    for asset in assets {
        account.add_database(&asset.database).expect("add database");
        account
            .add_table(
                &asset.database,
                TableInfo::physical(asset.table.clone()),
            )
            .expect("add table");
    }

    let storage = Arc::new(TracingMemoryBackend::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let ledger =
        GrantLedger::new(storage.clone()).with_stale_timeout(config.stale_claim_timeout());
    let handler = GrantHandler::new(&config, ledger, GrantPorts::single(&account))
        .expect("grant handler")
        .with_channel(bus.clone())
        .with_audit(AuditEmitter::new(audit.clone()));

    let producer = Producer {
        account,
        storage,
        audit,
        handler: Arc::new(handler),
        config,
    };
    let execution_role = producer.config.execution_role().expect("role").clone();
    producer
        .bootstrap()
        .reconcile(&[execution_role])
        .await
        .expect("admin bootstrap");
    producer
}

/// A wired domain account plus producer accounts.
pub struct World {
    /// Governance domain directory.
    pub directory: Arc<InMemoryDirectory>,
    /// Every bus of every account.
    pub bus: Arc<InMemoryEventBus>,
    /// Deployed buses and rules.
    pub plan: DeploymentPlan,
    /// Dispatcher subscribed to the domain bus.
    pub dispatcher: Dispatcher,
    /// Audit events emitted by the dispatcher.
    pub domain_audit: Arc<MemoryAuditSink>,
    /// Dispatcher configuration.
    pub domain_config: Config,
    producers: BTreeMap<(AccountId, Region), Producer>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("buses", &self.plan.buses.len())
            .field("producers", &self.producers.len())
            .finish_non_exhaustive()
    }
}

impl World {
    /// Starts building a world.
    pub fn builder() -> WorldBuilder {
        WorldBuilder::default()
    }

    /// Returns a producer.
    ///
    /// # Panics
    ///
    /// Panics if no producer exists in that location.
    pub fn producer(&self, account_id: &str, region: &str) -> &Producer {
        self.producers
            .get(&(fixtures::account(account_id), fixtures::region(region)))
            .unwrap_or_else(|| panic!("no producer {account_id}/{region}"))
    }

    /// Publishes a catalog acceptance onto the domain bus and returns it.
    pub async fn accept(
        &self,
        listing_id: &str,
        principal: &PrincipalArn,
        asset: &AssetRef,
    ) -> SubscriptionEvent {
        let event = fixtures::acceptance(listing_id, principal, asset);
        self.publish(&event).await;
        event
    }

    /// Publishes an event onto the domain bus as the domain account.
    pub async fn publish(&self, event: &SubscriptionEvent) {
        let bus = self.domain_config.local_bus();
        self.bus
            .publish(&bus, &self.domain_config.account_id, event)
            .await
            .expect("publish to domain bus");
    }

    /// Delivers queued events until every handler inbox is empty.
    pub async fn pump(&self) -> PumpReport {
        let mut report = PumpReport::default();
        for _ in 0..MAX_PUMP_ROUNDS {
            let dispatches = self.bus.drain(DISPATCHER).expect("drain dispatcher");
            let grants = self.bus.drain(GRANT_HANDLER).expect("drain grant handler");
            if dispatches.is_empty() && grants.is_empty() {
                return report;
            }
            for delivery in dispatches {
                report.dispatched.push(self.dispatcher.dispatch(&delivery.event).await);
            }
            for delivery in grants {
                report.grants.push(self.deliver_grant(&delivery).await);
            }
        }
        panic!("deliveries did not drain after {MAX_PUMP_ROUNDS} rounds");
    }

    /// Hands one delivery to the grant handler of the bus it arrived on.
    pub async fn deliver_grant(&self, delivery: &Delivery) -> Result<GrantOutcome, GrantError> {
        let producer = self.producer(delivery.bus.account.as_str(), delivery.bus.region.as_str());
        producer.handler.grant(&delivery.event).await
    }

    /// Drains grant announcements.
    pub fn announcements(&self) -> Vec<Delivery> {
        self.bus.drain(ANNOUNCEMENTS).expect("drain announcements")
    }
}
