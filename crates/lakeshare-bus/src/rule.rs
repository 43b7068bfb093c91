//! Routing rules: declarative predicates over `(detail type, source)`.

use serde::{Deserialize, Serialize};

use lakeshare_core::{DetailType, SubscriptionEvent};

use crate::address::EventBusAddress;

/// Event pattern. An empty list matches any value for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPattern {
    /// Accepted detail types.
    #[serde(default, rename = "detail-type", skip_serializing_if = "Vec::is_empty")]
    pub detail_types: Vec<DetailType>,
    /// Accepted sources.
    #[serde(default, rename = "source", skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl EventPattern {
    /// Pattern matching every event.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds an accepted detail type.
    #[must_use]
    pub fn with_detail_type(mut self, detail_type: DetailType) -> Self {
        self.detail_types.push(detail_type);
        self
    }

    /// Adds an accepted source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Returns true if the event satisfies every populated field.
    #[must_use]
    pub fn matches(&self, event: &SubscriptionEvent) -> bool {
        (self.detail_types.is_empty() || self.detail_types.contains(&event.detail_type))
            && (self.sources.is_empty() || self.sources.iter().any(|s| *s == event.source))
    }
}

/// Where a matching event goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RuleTarget {
    /// Another event bus, possibly in another account or region.
    Bus(EventBusAddress),
    /// A named local handler.
    Handler(String),
}

/// A named rule attached to a bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Rule name, unique per bus.
    pub name: String,
    /// Predicate.
    pub pattern: EventPattern,
    /// Targets receiving matching events.
    pub targets: Vec<RuleTarget>,
}

impl RoutingRule {
    /// Creates a rule without targets.
    #[must_use]
    pub fn new(name: impl Into<String>, pattern: EventPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            targets: Vec::new(),
        }
    }

    /// Adds a target.
    #[must_use]
    pub fn with_target(mut self, target: RuleTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Returns the rule's targets if the event matches, otherwise an empty slice.
    #[must_use]
    pub fn targets_for(&self, event: &SubscriptionEvent) -> &[RuleTarget] {
        if self.pattern.matches(event) {
            &self.targets
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeshare_core::{AssetRef, SubscriptionDetail};
    use proptest::prelude::*;

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

    fn detail_type_strategy() -> impl Strategy<Value = DetailType> {
        prop_oneof![
            Just(DetailType::SubscriptionRequestAccepted),
            Just(DetailType::UnmanagedAssetSubscriptionRequestAccepted),
            Just(DetailType::UnmanagedAssetGranted),
            "[A-Z][a-z]{2,10}( [A-Z][a-z]{2,10}){0,2}".prop_map(DetailType::from),
        ]
    }

    #[test]
    fn pattern_requires_both_fields() {
        let pattern = EventPattern::any()
            .with_detail_type(DetailType::UnmanagedAssetSubscriptionRequestAccepted)
            .with_source("custom.lakeshare");

        assert!(pattern.matches(&event(
            DetailType::UnmanagedAssetSubscriptionRequestAccepted,
            "custom.lakeshare"
        )));
        assert!(!pattern.matches(&event(
            DetailType::UnmanagedAssetSubscriptionRequestAccepted,
            "aws.datazone"
        )));
        assert!(!pattern.matches(&event(
            DetailType::SubscriptionRequestAccepted,
            "custom.lakeshare"
        )));
    }

    #[test]
    fn targets_only_on_match() {
        let rule = RoutingRule::new(
            "grants",
            EventPattern::any().with_detail_type(DetailType::UnmanagedAssetGranted),
        )
        .with_target(RuleTarget::Handler("announce".into()));

        assert_eq!(
            rule.targets_for(&event(DetailType::UnmanagedAssetGranted, "x")).len(),
            1
        );
        assert!(
            rule.targets_for(&event(DetailType::SubscriptionRequestAccepted, "x"))
                .is_empty()
        );
    }

    #[test]
    fn pattern_serializes_with_bus_field_names() {
        let pattern = EventPattern::any()
            .with_detail_type(DetailType::SubscriptionRequestAccepted)
            .with_source("aws.datazone");
        let json = serde_json::to_string(&pattern).expect("encode");
        assert_eq!(
            json,
            r#"{"detail-type":["Subscription Request Accepted"],"source":["aws.datazone"]}"#
        );
    }

    proptest! {
        #[test]
        fn empty_pattern_matches_everything(dt in detail_type_strategy(), source in "[a-z.]{1,20}") {
            prop_assert!(EventPattern::any().matches(&event(dt, &source)));
        }

        #[test]
        fn detail_type_filter_is_membership(
            accepted in proptest::collection::vec(detail_type_strategy(), 1..4),
            dt in detail_type_strategy(),
        ) {
            let pattern = accepted
                .iter()
                .cloned()
                .fold(EventPattern::any(), EventPattern::with_detail_type);
            prop_assert_eq!(pattern.matches(&event(dt.clone(), "s")), accepted.contains(&dt));
        }
    }
}
