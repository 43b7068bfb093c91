//! Scenario files for `lakeshare simulate`.
//!
//! A scenario describes a governance domain (directory entries plus the
//! dispatcher configuration), the producer accounts with their catalogs and
//! administrators, and the catalog events to replay.
//!
//! ```json
//! {
//!   "config": { "accountId": "111111111111", "region": "us-east-1", "domainId": "dzd-1" },
//!   "environments": [ ... ],
//!   "listings": [ ... ],
//!   "accounts": [
//!     {
//!       "accountId": "222222222222",
//!       "region": "us-east-1",
//!       "roles": ["lakeshare-grant", "consumer"],
//!       "tables": [{ "db": "sales", "table": "orders" }]
//!     }
//!   ],
//!   "events": [ ... ]
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use lakeshare_core::{AccountId, AssetRef, PrincipalArn, Region, SubscriptionEvent};
use lakeshare_flow::{Config, EnvironmentInfo, ListingInfo};

/// Role the grant handler runs as when an account names none.
pub const DEFAULT_EXECUTION_ROLE: &str = "lakeshare-grant";

/// A replayable scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Scenario {
    /// Dispatcher configuration; its account hosts the governance domain.
    pub config: Config,
    /// Domain environments.
    #[serde(default)]
    pub environments: Vec<EnvironmentInfo>,
    /// Domain listings.
    #[serde(default)]
    pub listings: Vec<ListingInfo>,
    /// Producer accounts.
    #[serde(default)]
    pub accounts: Vec<AccountSetup>,
    /// Catalog events, replayed in order onto the domain bus.
    #[serde(default)]
    pub events: Vec<SubscriptionEvent>,
}

/// Initial state of a producer account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountSetup {
    /// Account id.
    pub account_id: AccountId,
    /// Region the grant handler runs in.
    pub region: Region,
    /// Execution role; defaults to `role/lakeshare-grant` in this account.
    #[serde(default)]
    pub execution_role_arn: Option<PrincipalArn>,
    /// Read policy attached to subscriber roles.
    #[serde(default)]
    pub read_policy_arn: Option<String>,
    /// Existing role names.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Existing tables.
    #[serde(default)]
    pub tables: Vec<AssetRef>,
    /// Administrators before bootstrap.
    #[serde(default)]
    pub admins: Vec<PrincipalArn>,
    /// Administrators the bootstrap must ensure, besides the execution role.
    #[serde(default)]
    pub declared_admins: Vec<PrincipalArn>,
}

impl Scenario {
    /// Reads and validates a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
        Self::from_json(&content)
    }

    /// Parses and validates a scenario document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Self =
            serde_json::from_str(json).context("Failed to parse scenario JSON")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Checks configuration ranges and cross references.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        self.config.validate().context("Invalid dispatcher config")?;
        if self.config.domain_id.is_none() {
            bail!("Scenario config must set domainId");
        }
        for setup in &self.accounts {
            self.producer_config(setup)
                .validate()
                .with_context(|| format!("Invalid config for account {}", setup.account_id))?;
        }
        for listing in &self.listings {
            if !self
                .environments
                .iter()
                .any(|env| env.environment_id == listing.environment_id)
            {
                tracing::warn!(
                    listing = %listing.listing_id,
                    environment = %listing.environment_id,
                    "listing names an unknown environment; its events will be unresolved"
                );
            }
        }
        Ok(())
    }

    /// Derives the grant handler configuration of a producer account.
    #[must_use]
    pub fn producer_config(&self, setup: &AccountSetup) -> Config {
        let mut config = self.config.clone();
        config.domain_account_id = Some(self.config.domain_account().clone());
        config.account_id = setup.account_id.clone();
        config.region = setup.region.clone();

        let execution_role = setup
            .execution_role_arn
            .clone()
            .unwrap_or_else(|| PrincipalArn::role(&setup.account_id, DEFAULT_EXECUTION_ROLE));
        let mut declared = vec![execution_role.clone()];
        for admin in &setup.declared_admins {
            if !declared.contains(admin) {
                declared.push(admin.clone());
            }
        }
        config.execution_role_arn = Some(execution_role);
        config.read_policy_arn.clone_from(&setup.read_policy_arn);
        config.declared_admins = declared;
        config
    }
}
