//! Deployment planning: the buses, allow-lists and routing rules the system
//! needs, derived from configuration and the directory.
//!
//! Plans are stateless and recomputed on every deployment. The domain bus
//! routes catalog acceptances to the dispatcher. Each producer bus allows the
//! domain account to publish and routes forwarded acceptances to the grant
//! handler.

use std::collections::BTreeMap;

use serde::Serialize;

use lakeshare_bus::memory::InMemoryEventBus;
use lakeshare_bus::{EventBusAddress, EventPattern, PublishPolicy, RoutingRule, RuleTarget};
use lakeshare_core::event::CATALOG_EVENT_SOURCE;
use lakeshare_core::{AccountId, DetailType, Error, Region, Result};

use crate::config::Config;
use crate::directory::DirectoryClient;

/// Handler name of the dispatcher.
pub const DISPATCHER: &str = "dispatcher";

/// Handler name of the grant handler.
pub const GRANT_HANDLER: &str = "grant-handler";

/// Handler name receiving grant announcements.
pub const ANNOUNCEMENTS: &str = "announcements";

/// One bus with its policy and rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDeployment {
    /// Bus address.
    pub address: EventBusAddress,
    /// Publish allow-list.
    pub policy: PublishPolicy,
    /// Routing rules.
    pub rules: Vec<RoutingRule>,
}

impl BusDeployment {
    fn merge(&mut self, other: Self) {
        for account in other.policy.principals() {
            self.policy.insert(account.clone());
        }
        for rule in other.rules {
            self.rules.retain(|existing| existing.name != rule.name);
            self.rules.push(rule);
        }
    }
}

/// Returns the domain bus deployment: catalog acceptances go to the dispatcher.
#[must_use]
pub fn domain_bus(config: &Config) -> BusDeployment {
    let address = config.bus_in(config.domain_account().clone(), config.region.clone());
    BusDeployment {
        policy: PublishPolicy::owner_only(address.account.clone()),
        rules: vec![
            RoutingRule::new(
                "subscription-accepted",
                EventPattern::any()
                    .with_detail_type(DetailType::SubscriptionRequestAccepted)
                    .with_source(CATALOG_EVENT_SOURCE),
            )
            .with_target(RuleTarget::Handler(DISPATCHER.to_string())),
        ],
        address,
    }
}

/// Returns the deployment of a producer bus.
#[must_use]
pub fn producer_bus(config: &Config, account: AccountId, region: Region) -> BusDeployment {
    let address = config.bus_in(account, region);
    let source = config.event_source();
    let mut rules = vec![
        RoutingRule::new(
            "unmanaged-acceptance",
            EventPattern::any()
                .with_detail_type(DetailType::UnmanagedAssetSubscriptionRequestAccepted)
                .with_source(source.clone()),
        )
        .with_target(RuleTarget::Handler(GRANT_HANDLER.to_string())),
    ];
    if config.announce_grants {
        rules.push(
            RoutingRule::new(
                "granted-announcements",
                EventPattern::any()
                    .with_detail_type(DetailType::UnmanagedAssetGranted)
                    .with_source(source),
            )
            .with_target(RuleTarget::Handler(ANNOUNCEMENTS.to_string())),
        );
    }
    BusDeployment {
        policy: PublishPolicy::owner_only(address.account.clone())
            .allow(config.domain_account().clone()),
        rules,
        address,
    }
}

/// Every bus the system needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentPlan {
    /// Buses, ordered by address.
    pub buses: Vec<BusDeployment>,
}

impl DeploymentPlan {
    /// Plans the domain bus plus one producer bus per environment location.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if no domain is configured, or the
    /// directory error if environments cannot be listed.
    pub async fn plan(config: &Config, directory: &dyn DirectoryClient) -> Result<Self> {
        let domain_id = config.domain_id.as_deref().ok_or_else(|| {
            Error::InvalidInput("LAKESHARE_DOMAIN_ID is required for deployment planning".into())
        })?;
        let environments = directory.list_environments(domain_id).await?;

        let mut plan = Self::default();
        plan.add(domain_bus(config));
        for environment in environments {
            plan.add(producer_bus(config, environment.account_id, environment.region));
        }
        tracing::info!(buses = plan.buses.len(), "planned event buses");
        Ok(plan)
    }

    /// Plans only the buses of this process's own account and region.
    #[must_use]
    pub fn local(config: &Config) -> Self {
        let mut plan = Self::default();
        if config.domain_account() == &config.account_id {
            plan.add(domain_bus(config));
        }
        plan.add(producer_bus(
            config,
            config.account_id.clone(),
            config.region.clone(),
        ));
        plan
    }

    /// Adds a bus, merging with an existing deployment of the same address.
    pub fn add(&mut self, deployment: BusDeployment) {
        let mut by_address: BTreeMap<EventBusAddress, BusDeployment> = self
            .buses
            .drain(..)
            .map(|b| (b.address.clone(), b))
            .collect();
        match by_address.get_mut(&deployment.address) {
            Some(existing) => existing.merge(deployment),
            None => {
                by_address.insert(deployment.address.clone(), deployment);
            }
        }
        self.buses = by_address.into_values().collect();
    }

    /// Returns the deployment of a bus.
    #[must_use]
    pub fn bus(&self, address: &EventBusAddress) -> Option<&BusDeployment> {
        self.buses.iter().find(|b| &b.address == address)
    }

    /// Creates every bus and rule on an in-memory bus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn apply(&self, registry: &InMemoryEventBus) -> Result<()> {
        for bus in &self.buses {
            registry.create_bus(bus.address.clone(), bus.policy.clone())?;
            for rule in &bus.rules {
                registry.put_rule(&bus.address, rule.clone())?;
            }
        }
        Ok(())
    }
}
