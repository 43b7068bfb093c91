//! Subscription event envelope.
//!
//! The envelope mirrors the shape of the upstream event bus: a `detail-type`
//! discriminator, a `source` identity, and a `detail` object. Events are
//! immutable once produced; normalization for forwarding builds a new envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::asset::AssetRef;
use crate::error::{Error, Result};
use crate::id::{AccountId, EventId, Region};
use crate::principal::PrincipalArn;

/// Source identity used by the catalog service for its own events.
pub const CATALOG_EVENT_SOURCE: &str = "aws.datazone";

/// Returns the source identity used for forwarded events: `custom.<namespace>`.
#[must_use]
pub fn custom_source(namespace: &str) -> String {
    format!("custom.{namespace}")
}

/// Event discriminator.
///
/// Serialized with the bus vocabulary; the compact identifiers are accepted on
/// input. Unknown values are preserved in [`DetailType::Other`] so that
/// overly broad subscriptions can be ignored instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DetailType {
    /// The catalog accepted a subscription request.
    SubscriptionRequestAccepted,
    /// A forwarded acceptance for an asset the catalog does not manage.
    UnmanagedAssetSubscriptionRequestAccepted,
    /// The producer side finished granting an unmanaged asset.
    UnmanagedAssetGranted,
    /// Any other detail type.
    Other(String),
}

impl DetailType {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SubscriptionRequestAccepted => "Subscription Request Accepted",
            Self::UnmanagedAssetSubscriptionRequestAccepted => {
                "Unmanaged Asset Subscription Request Accepted"
            }
            Self::UnmanagedAssetGranted => {
                "Unmanaged Asset Successfully Granted in Pub Environment"
            }
            Self::Other(other) => other,
        }
    }

    /// Returns true for the two acceptance variants.
    #[must_use]
    pub const fn is_acceptance(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionRequestAccepted | Self::UnmanagedAssetSubscriptionRequestAccepted
        )
    }
}

impl From<String> for DetailType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Subscription Request Accepted" | "SubscriptionRequestAccepted" => {
                Self::SubscriptionRequestAccepted
            }
            "Unmanaged Asset Subscription Request Accepted"
            | "UnmanagedAssetSubscriptionRequestAccepted" => {
                Self::UnmanagedAssetSubscriptionRequestAccepted
            }
            "Unmanaged Asset Successfully Granted in Pub Environment"
            | "UnmanagedAssetGranted" => Self::UnmanagedAssetGranted,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for DetailType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<DetailType> for String {
    fn from(value: DetailType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DetailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscriber environment context attached when forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentContext {
    /// Environment identifier in the catalog.
    pub environment_id: String,
    /// Database in the subscriber's catalog that receives resource links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_database: Option<String>,
    /// Runtime role of the subscriber environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role_arn: Option<PrincipalArn>,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetail {
    /// Catalog listing that was subscribed to.
    pub listing_id: String,
    /// Principal that receives read access.
    pub target_principal_arn: PrincipalArn,
    /// Asset the principal subscribed to.
    pub target_asset_ref: AssetRef,
    /// Account in which the approval originated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_account_id: Option<AccountId>,
    /// Region in which the approval originated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_region: Option<Region>,
    /// Governance domain of the approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    /// Identity of the approval (distinguishes re-approvals from redeliveries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_request_id: Option<String>,
    /// Managed assets are granted by the catalog itself.
    #[serde(default)]
    pub is_managed_asset: bool,
    /// Subscriber environment, attached by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentContext>,
}

/// Immutable subscription event envelope.
///
/// # Example
///
/// ```rust
/// use lakeshare_core::event::{DetailType, SubscriptionEvent};
///
/// let json = r#"{
///     "source": "aws.catalog",
///     "detailType": "SubscriptionRequestAccepted",
///     "detail": {
///         "listingId": "L1",
///         "targetPrincipalArn": "arn:aws:iam::222222222222:role/consumer",
///         "targetAssetRef": {"db": "sales", "table": "orders"}
///     }
/// }"#;
/// let event = SubscriptionEvent::from_json(json).unwrap();
/// assert_eq!(event.detail_type, DetailType::SubscriptionRequestAccepted);
/// assert_eq!(event.detail.target_asset_ref.qualified_name(), "sales.orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Envelope id.
    #[serde(default)]
    pub id: EventId,
    /// Event discriminator.
    #[serde(rename = "detail-type", alias = "detailType")]
    pub detail_type: DetailType,
    /// Producer identity.
    pub source: String,
    /// When the envelope was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Payload.
    pub detail: SubscriptionDetail,
}

impl SubscriptionEvent {
    /// Creates a new envelope with a fresh id and the current time.
    #[must_use]
    pub fn new(
        detail_type: DetailType,
        source: impl Into<String>,
        detail: SubscriptionDetail,
    ) -> Self {
        Self {
            id: EventId::generate(),
            detail_type,
            source: source.into(),
            time: Some(Utc::now()),
            detail,
        }
    }

    /// Parses an envelope from JSON and validates it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON and
    /// `Error::InvalidInput` for envelopes that fail [`Self::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(json).map_err(|e| Error::Serialization {
            message: format!("failed to parse subscription event: {e}"),
        })?;
        event.validate()?;
        Ok(event)
    }

    /// Serializes the envelope to JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization {
            message: format!("failed to serialize subscription event: {e}"),
        })
    }

    /// Validates required envelope fields.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::InvalidInput("source must be non-empty".into()));
        }
        if self.detail.listing_id.trim().is_empty() {
            return Err(Error::InvalidInput("listingId must be non-empty".into()));
        }
        self.detail.target_asset_ref.validate()
    }

    /// Builds the envelope forwarded to a producer channel.
    ///
    /// The payload is carried over unchanged except that `environment` is
    /// filled in when the original does not carry one. The envelope gets a new
    /// id, the given source, and the unmanaged-acceptance detail type.
    #[must_use]
    pub fn normalized(&self, source: &str, environment: Option<EnvironmentContext>) -> Self {
        let mut detail = self.detail.clone();
        if detail.environment.is_none() {
            detail.environment = environment;
        }
        Self::new(
            DetailType::UnmanagedAssetSubscriptionRequestAccepted,
            source,
            detail,
        )
    }

    /// Builds the announcement emitted after a successful grant.
    #[must_use]
    pub fn granted_announcement(&self, source: &str) -> Self {
        Self::new(DetailType::UnmanagedAssetGranted, source, self.detail.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(detail_type: &str) -> String {
        format!(
            r#"{{
                "id": "evt-1",
                "detail-type": "{detail_type}",
                "source": "aws.datazone",
                "detail": {{
                    "listingId": "L1",
                    "targetPrincipalArn": "arn:aws:iam::222222222222:role/consumer",
                    "targetAssetRef": {{"database": "sales", "table": "orders"}},
                    "originAccountId": "111111111111",
                    "originRegion": "eu-west-1",
                    "subscriptionRequestId": "req-1"
                }}
            }}"#
        )
    }

    #[test]
    fn parses_bus_vocabulary() {
        let event = SubscriptionEvent::from_json(&sample_json("Subscription Request Accepted"))
            .expect("parse");
        assert_eq!(event.id.as_str(), "evt-1");
        assert_eq!(event.detail_type, DetailType::SubscriptionRequestAccepted);
        assert_eq!(event.detail.subscription_request_id.as_deref(), Some("req-1"));
        assert!(!event.detail.is_managed_asset);
    }

    #[test]
    fn unknown_detail_type_is_preserved() {
        let event =
            SubscriptionEvent::from_json(&sample_json("Subscription Cancelled")).expect("parse");
        assert_eq!(
            event.detail_type,
            DetailType::Other("Subscription Cancelled".into())
        );
        assert!(!event.detail_type.is_acceptance());
    }

    #[test]
    fn detail_type_round_trips_wire_name() {
        for dt in [
            DetailType::SubscriptionRequestAccepted,
            DetailType::UnmanagedAssetSubscriptionRequestAccepted,
            DetailType::UnmanagedAssetGranted,
        ] {
            assert_eq!(DetailType::from(dt.as_str()), dt);
        }
        assert_eq!(
            DetailType::from("UnmanagedAssetGranted"),
            DetailType::UnmanagedAssetGranted
        );
    }

    #[test]
    fn normalized_keeps_payload_and_changes_identity() {
        let event = SubscriptionEvent::from_json(&sample_json("Subscription Request Accepted"))
            .expect("parse");
        let env = EnvironmentContext {
            environment_id: "env-1".into(),
            consumer_database: Some("consumer_db".into()),
            user_role_arn: None,
        };
        let forwarded = event.normalized(&custom_source("lakeshare"), Some(env.clone()));

        assert_ne!(forwarded.id, event.id);
        assert_eq!(forwarded.source, "custom.lakeshare");
        assert_eq!(
            forwarded.detail_type,
            DetailType::UnmanagedAssetSubscriptionRequestAccepted
        );
        assert_eq!(forwarded.detail.listing_id, event.detail.listing_id);
        assert_eq!(forwarded.detail.environment, Some(env));
    }

    #[test]
    fn normalized_does_not_overwrite_existing_environment() {
        let mut event = SubscriptionEvent::from_json(&sample_json("Subscription Request Accepted"))
            .expect("parse");
        let original = EnvironmentContext {
            environment_id: "env-original".into(),
            consumer_database: None,
            user_role_arn: None,
        };
        event.detail.environment = Some(original.clone());
        let forwarded = event.normalized(
            "custom.x",
            Some(EnvironmentContext {
                environment_id: "env-other".into(),
                consumer_database: None,
                user_role_arn: None,
            }),
        );
        assert_eq!(forwarded.detail.environment, Some(original));
    }

    #[test]
    fn rejects_empty_listing() {
        let json = sample_json("Subscription Request Accepted").replace("\"L1\"", "\"\"");
        let err = SubscriptionEvent::from_json(&json).expect_err("should fail");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn serializes_with_bus_field_names() {
        let event = SubscriptionEvent::from_json(&sample_json("Subscription Request Accepted"))
            .expect("parse");
        let json = event.to_json().expect("encode");
        assert!(json.contains("\"detail-type\":\"Subscription Request Accepted\""));
        assert!(json.contains("\"listingId\":\"L1\""));
    }
}
