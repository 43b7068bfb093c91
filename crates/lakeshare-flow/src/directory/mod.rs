//! Directory client: resolves listings and environments in the governance domain.
//!
//! The dispatcher uses it to find where a subscribed asset lives; deployment
//! planning uses it to enumerate every producer environment.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lakeshare_core::{AccountId, AssetRef, EnvironmentContext, PrincipalArn, Region, Result};

/// A published catalog listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingInfo {
    /// Listing identifier.
    pub listing_id: String,
    /// Governance domain the listing belongs to.
    pub domain_id: String,
    /// Catalog (account) owning the listed asset.
    pub catalog_id: AccountId,
    /// Region of the owning catalog.
    pub region: Region,
    /// Environment that published the listing.
    pub environment_id: String,
    /// Listed asset, when the listing names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
}

/// A governance-domain environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    /// Environment identifier.
    pub environment_id: String,
    /// Governance domain.
    pub domain_id: String,
    /// Account hosting the environment.
    pub account_id: AccountId,
    /// Region hosting the environment.
    pub region: Region,
    /// Database receiving resource links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_database: Option<String>,
    /// Runtime role of the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role_arn: Option<PrincipalArn>,
}

impl EnvironmentInfo {
    /// Returns the context attached to forwarded events.
    #[must_use]
    pub fn context(&self) -> EnvironmentContext {
        EnvironmentContext {
            environment_id: self.environment_id.clone(),
            consumer_database: self.consumer_database.clone(),
            user_role_arn: self.user_role_arn.clone(),
        }
    }
}

/// Read-only view of the governance domain.
///
/// Lookups return `Error::NotFound` when the listing or environment is gone.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Resolves a listing.
    async fn resolve_listing(&self, domain_id: &str, listing_id: &str) -> Result<ListingInfo>;

    /// Returns an environment.
    async fn get_environment(&self, domain_id: &str, environment_id: &str)
    -> Result<EnvironmentInfo>;

    /// Lists every environment of a domain.
    async fn list_environments(&self, domain_id: &str) -> Result<Vec<EnvironmentInfo>>;
}
