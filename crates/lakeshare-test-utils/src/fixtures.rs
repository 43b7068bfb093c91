//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create accounts, principals, directory
//! entries and events with sensible defaults.

use lakeshare_core::event::CATALOG_EVENT_SOURCE;
use lakeshare_core::{
    AccountId, AssetRef, DetailType, PrincipalArn, Region, SubscriptionDetail, SubscriptionEvent,
};
use lakeshare_flow::{Config, EnvironmentInfo, ListingInfo};

/// Account hosting the governance domain.
pub const DOMAIN_ACCOUNT: &str = "111111111111";

/// Default producer account.
pub const PRODUCER_ACCOUNT: &str = "222222222222";

/// Default region.
pub const REGION: &str = "us-east-1";

/// Governance domain id.
pub const DOMAIN_ID: &str = "dzd-test";

/// Role name the grant handler runs as in every producer account.
pub const EXECUTION_ROLE: &str = "lakeshare-grant";

/// Role name of the default subscriber.
pub const CONSUMER_ROLE: &str = "consumer";

/// Database receiving resource links in the default environment.
pub const CONSUMER_DATABASE: &str = "consumer_db";

/// Parses an account id.
pub fn account(id: &str) -> AccountId {
    id.parse().expect("valid account id")
}

/// Parses a region.
pub fn region(name: &str) -> Region {
    name.parse().expect("valid region")
}

/// Returns the ARN of a role in an account.
pub fn role(account_id: &str, name: &str) -> PrincipalArn {
    format!("arn:aws:iam::{account_id}:role/{name}")
        .parse()
        .expect("valid role arn")
}

/// Returns the ARN of a user in an account.
pub fn user(account_id: &str, name: &str) -> PrincipalArn {
    format!("arn:aws:iam::{account_id}:user/{name}")
        .parse()
        .expect("valid user arn")
}

/// Returns the execution role of an account.
pub fn execution_role(account_id: &str) -> PrincipalArn {
    role(account_id, EXECUTION_ROLE)
}

/// Returns the read policy ARN of an account.
pub fn read_policy(account_id: &str) -> String {
    format!("arn:aws:iam::{account_id}:policy/lakeshare-read")
}

/// Returns the configuration of the domain-side dispatcher.
pub fn domain_config() -> Config {
    let mut config = Config::new(account(DOMAIN_ACCOUNT), region(REGION));
    config.domain_id = Some(DOMAIN_ID.to_string());
    config
}

/// Returns the configuration of a producer-side grant handler.
pub fn producer_config(account_id: &str, region_name: &str) -> Config {
    let mut config = Config::new(account(account_id), region(region_name));
    config.domain_account_id = Some(account(DOMAIN_ACCOUNT));
    config.domain_id = Some(DOMAIN_ID.to_string());
    config.execution_role_arn = Some(execution_role(account_id));
    config.read_policy_arn = Some(read_policy(account_id));
    config
}

/// Returns an environment hosted in the given location.
pub fn environment(environment_id: &str, account_id: &str, region_name: &str) -> EnvironmentInfo {
    EnvironmentInfo {
        environment_id: environment_id.to_string(),
        domain_id: DOMAIN_ID.to_string(),
        account_id: account(account_id),
        region: region(region_name),
        consumer_database: Some(CONSUMER_DATABASE.to_string()),
        user_role_arn: Some(role(account_id, CONSUMER_ROLE)),
    }
}

/// Returns a listing published by an environment.
pub fn listing(listing_id: &str, environment: &EnvironmentInfo, asset: &AssetRef) -> ListingInfo {
    ListingInfo {
        listing_id: listing_id.to_string(),
        domain_id: DOMAIN_ID.to_string(),
        catalog_id: environment.account_id.clone(),
        region: environment.region.clone(),
        environment_id: environment.environment_id.clone(),
        asset: Some(asset.clone()),
    }
}

/// Returns the default subscribed asset.
pub fn orders() -> AssetRef {
    AssetRef::new("sales", "orders")
}

/// Returns a catalog acceptance as the domain bus receives it.
pub fn acceptance(listing_id: &str, principal: &PrincipalArn, asset: &AssetRef) -> SubscriptionEvent {
    SubscriptionEvent::new(
        DetailType::SubscriptionRequestAccepted,
        CATALOG_EVENT_SOURCE,
        SubscriptionDetail {
            listing_id: listing_id.to_string(),
            target_principal_arn: principal.clone(),
            target_asset_ref: asset.clone(),
            origin_account_id: Some(account(DOMAIN_ACCOUNT)),
            origin_region: Some(region(REGION)),
            domain_id: Some(DOMAIN_ID.to_string()),
            subscription_request_id: Some(format!("req-{listing_id}")),
            is_managed_asset: false,
            environment: None,
        },
    )
}

/// Returns the same acceptance under a new envelope id, as a redelivery would.
pub fn redelivery(event: &SubscriptionEvent) -> SubscriptionEvent {
    SubscriptionEvent::new(
        event.detail_type.clone(),
        event.source.clone(),
        event.detail.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_config_is_valid() {
        let config = producer_config(PRODUCER_ACCOUNT, REGION);
        config.validate().expect("valid");
        assert_eq!(config.domain_account(), &account(DOMAIN_ACCOUNT));
        assert_eq!(
            config.execution_role().expect("role"),
            &execution_role(PRODUCER_ACCOUNT)
        );
    }

    #[test]
    fn listing_points_at_environment_location() {
        let env = environment("env-pub", PRODUCER_ACCOUNT, "eu-west-1");
        let listing = listing("L1", &env, &orders());
        assert_eq!(listing.catalog_id, account(PRODUCER_ACCOUNT));
        assert_eq!(listing.region, region("eu-west-1"));
    }

    #[test]
    fn redelivery_keeps_payload() {
        let event = acceptance("L1", &role(PRODUCER_ACCOUNT, CONSUMER_ROLE), &orders());
        let again = redelivery(&event);
        assert_ne!(again.id, event.id);
        assert_eq!(again.detail, event.detail);
    }
}
