//! Dispatcher: routes accepted subscriptions from the domain account to the
//! producer account's regional channel.
//!
//! One dispatch resolves the listing, looks up the publishing environment,
//! and publishes a normalized event exactly once. It never retries; a
//! transient failure is returned to the invoking scheduler.

use std::sync::Arc;

use tracing::Instrument;

use lakeshare_bus::{EventBusAddress, EventChannel};
use lakeshare_core::audit::{AuditAction, AuditEmitter, AuditEvent};
use lakeshare_core::observability::dispatch_span;
use lakeshare_core::{AccountId, EventId, SubscriptionEvent};

use crate::config::Config;
use crate::directory::DirectoryClient;
use crate::error::DispatchError;
use crate::metrics::record_dispatch;

const ACTOR: &str = "dispatcher";

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The normalized event was accepted by the destination bus.
    Published {
        /// Destination bus.
        bus: EventBusAddress,
        /// Id of the forwarded envelope.
        event_id: EventId,
        /// Rules the event matched on the destination bus.
        matched_rules: Vec<String>,
    },
    /// The event does not need routing.
    Ignored {
        /// Why it was ignored.
        reason: String,
    },
}

impl DispatchOutcome {
    /// Returns the metric label for this outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Routes accepted subscriptions to producer channels.
pub struct Dispatcher {
    directory: Arc<dyn DirectoryClient>,
    channel: Arc<dyn EventChannel>,
    publisher: AccountId,
    bus_name: String,
    source: String,
    default_domain_id: Option<String>,
    audit: AuditEmitter,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("publisher", &self.publisher)
            .field("bus_name", &self.bus_name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher publishing as the configured domain account.
    #[must_use]
    pub fn new(
        config: &Config,
        directory: Arc<dyn DirectoryClient>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            directory,
            channel,
            publisher: config.domain_account().clone(),
            bus_name: config.event_bus_name.clone(),
            source: config.event_source(),
            default_domain_id: config.domain_id.clone(),
            audit: AuditEmitter::default(),
        }
    }

    /// Replaces the audit emitter.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = audit;
        self
    }

    /// Routes one event.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidEvent`] if the event fails validation or names no domain
    /// - [`DispatchError::UnresolvedDestination`] if the listing or its environment is gone
    /// - [`DispatchError::Directory`] if a lookup fails for another reason
    /// - [`DispatchError::Publish`] if the destination bus rejects the event
    pub async fn dispatch(
        &self,
        event: &SubscriptionEvent,
    ) -> Result<DispatchOutcome, DispatchError> {
        let span = dispatch_span(
            event.id.as_str(),
            &event.detail.listing_id,
            event.detail_type.as_str(),
        );
        let result = self.dispatch_inner(event).instrument(span).await;
        match &result {
            Ok(outcome) => record_dispatch(outcome.as_str()),
            Err(DispatchError::UnresolvedDestination { .. }) => record_dispatch("unresolved"),
            Err(_) => record_dispatch("error"),
        }
        result
    }

    async fn dispatch_inner(
        &self,
        event: &SubscriptionEvent,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !event.detail_type.is_acceptance() {
            tracing::debug!("ignoring non-acceptance event");
            return Ok(DispatchOutcome::Ignored {
                reason: format!("detail type '{}' is not an acceptance", event.detail_type),
            });
        }
        if event.detail.is_managed_asset {
            tracing::info!("ignoring managed asset");
            return Ok(DispatchOutcome::Ignored {
                reason: "managed assets are granted by the catalog".to_string(),
            });
        }
        event.validate().map_err(|e| DispatchError::InvalidEvent {
            message: e.to_string(),
        })?;

        let domain_id = event
            .detail
            .domain_id
            .as_deref()
            .or(self.default_domain_id.as_deref())
            .ok_or_else(|| DispatchError::InvalidEvent {
                message: "event names no domain and no default domain is configured".to_string(),
            })?;
        let listing_id = &event.detail.listing_id;

        let listing = self
            .directory
            .resolve_listing(domain_id, listing_id)
            .await
            .map_err(|e| self.lookup_error(event, listing_id, e))?;
        let environment = self
            .directory
            .get_environment(domain_id, &listing.environment_id)
            .await
            .map_err(|e| self.lookup_error(event, listing_id, e))?;

        let bus = EventBusAddress::new(
            listing.catalog_id.clone(),
            listing.region.clone(),
            self.bus_name.clone(),
        );
        let forwarded = event.normalized(&self.source, Some(environment.context()));
        tracing::info!(bus = %bus, forwarded_id = %forwarded.id, "publishing to producer channel");

        let receipt = self
            .channel
            .publish(&bus, &self.publisher, &forwarded)
            .await
            .map_err(|source| {
                tracing::error!(bus = %bus, error = %source, "publish failed");
                DispatchError::Publish {
                    bus: bus.arn(),
                    source,
                }
            })?;

        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::DispatchPublished)
                .actor(ACTOR)
                .resource(bus.arn())
                .correlation_id(event.id.as_str())
                .reason(format!("listing {listing_id} -> {}", forwarded.id)),
        );

        Ok(DispatchOutcome::Published {
            bus,
            event_id: receipt.event_id,
            matched_rules: receipt.matched_rules,
        })
    }

    fn lookup_error(
        &self,
        event: &SubscriptionEvent,
        listing_id: &str,
        error: lakeshare_core::Error,
    ) -> DispatchError {
        if !error.is_not_found() {
            tracing::warn!(error = %error, "directory lookup failed");
            return DispatchError::Directory { source: error };
        }
        tracing::error!(error = %error, "destination unresolved; nothing published");
        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::DispatchUnresolved)
                .actor(ACTOR)
                .resource(format!("listing/{listing_id}"))
                .correlation_id(event.id.as_str())
                .reason(error.to_string()),
        );
        DispatchError::UnresolvedDestination {
            listing_id: listing_id.to_string(),
            source: error,
        }
    }
}
