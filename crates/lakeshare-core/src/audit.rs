//! Audit trail for grant-side decisions.
//!
//! Operators follow the life of a subscription through the ledger status and
//! through these audit events: one per routing decision, per grant step
//! transition, and per administrator merge.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use lakeshare_core::audit::{AuditAction, AuditEmitter, AuditEvent, MemoryAuditSink};
//!
//! let sink = Arc::new(MemoryAuditSink::new());
//! let emitter = AuditEmitter::new(sink.clone());
//!
//! let event = AuditEvent::builder()
//!     .action(AuditAction::GrantStepCompleted)
//!     .actor("arn:aws:iam::222222222222:role/lakeshare-grant")
//!     .resource("arn:aws:iam::222222222222:role/consumer|sales.orders")
//!     .step("share")
//!     .reason("created")
//!     .try_build()
//!     .unwrap();
//! emitter.emit(event);
//!
//! assert_eq!(sink.find_by_action(AuditAction::GrantStepCompleted).len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Version of the audit event schema.
pub const AUDIT_EVENT_VERSION: u32 = 1;

/// Audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum AuditAction {
    /// A forwarded event was published to a producer channel.
    DispatchPublished,
    /// A listing could not be resolved to a destination.
    DispatchUnresolved,
    /// A delivery won the ledger claim for a grant key.
    GrantClaimed,
    /// A grant step performed a side effect.
    GrantStepCompleted,
    /// A grant step found its effect already in place.
    GrantStepSatisfied,
    /// A grant step did not apply to this principal.
    GrantStepSkipped,
    /// The grant sequence finished and the ledger was finalized.
    GrantCompleted,
    /// The grant sequence aborted and the ledger records the failure.
    GrantFailed,
    /// Re-verifying an already granted key failed; the grant stays in place.
    GrantVerificationFailed,
    /// The administrator set was extended.
    AdminsMerged,
    /// The administrator set already contained every declared identity.
    AdminsUnchanged,
}

impl AuditAction {
    /// Returns true for actions that record a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DispatchUnresolved | Self::GrantFailed | Self::GrantVerificationFailed
        )
    }

    /// Returns the category of this action for grouping.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::DispatchPublished | Self::DispatchUnresolved => "dispatch",
            Self::GrantClaimed
            | Self::GrantStepCompleted
            | Self::GrantStepSatisfied
            | Self::GrantStepSkipped
            | Self::GrantCompleted
            | Self::GrantFailed
            | Self::GrantVerificationFailed => "grant",
            Self::AdminsMerged | Self::AdminsUnchanged => "admin",
        }
    }

    /// Returns the stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DispatchPublished => "DISPATCH_PUBLISHED",
            Self::DispatchUnresolved => "DISPATCH_UNRESOLVED",
            Self::GrantClaimed => "GRANT_CLAIMED",
            Self::GrantStepCompleted => "GRANT_STEP_COMPLETED",
            Self::GrantStepSatisfied => "GRANT_STEP_SATISFIED",
            Self::GrantStepSkipped => "GRANT_STEP_SKIPPED",
            Self::GrantCompleted => "GRANT_COMPLETED",
            Self::GrantFailed => "GRANT_FAILED",
            Self::GrantVerificationFailed => "GRANT_VERIFICATION_FAILED",
            Self::AdminsMerged => "ADMINS_MERGED",
            Self::AdminsUnchanged => "ADMINS_UNCHANGED",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Schema version for evolution.
    pub event_version: u32,

    /// Unique event identifier (ULID format).
    pub event_id: String,

    /// When the event occurred (UTC).
    pub timestamp: DateTime<Utc>,

    /// Id of the subscription event being processed, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Identity performing the action (execution role or component name).
    pub actor: String,

    /// The action taken.
    pub action: AuditAction,

    /// Resource acted upon (grant key, bus ARN, settings object).
    pub resource: String,

    /// Grant step, for step-level actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Why the action was taken or how it failed.
    pub reason: String,
}

impl AuditEvent {
    /// Creates a new builder for constructing audit events.
    #[must_use]
    pub fn builder() -> AuditEventBuilder {
        AuditEventBuilder::default()
    }
}

/// Error type for audit event validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditValidationError {
    /// A required field is missing.
    #[error("audit event missing required field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: &'static str,
    },
}

/// Builder for constructing [`AuditEvent`] instances.
#[derive(Debug, Default)]
pub struct AuditEventBuilder {
    action: Option<AuditAction>,
    actor: Option<String>,
    resource: Option<String>,
    reason: Option<String>,
    step: Option<String>,
    correlation_id: Option<String>,
}

impl AuditEventBuilder {
    /// Sets the action for this event.
    #[must_use]
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Sets the actor identity.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the resource acted upon.
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the grant step.
    #[must_use]
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Sets the correlation id (the subscription event id).
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Builds the audit event.
    ///
    /// # Errors
    ///
    /// Returns an error if `action`, `actor`, or `resource` is missing.
    pub fn try_build(self) -> Result<AuditEvent, AuditValidationError> {
        let action = self
            .action
            .ok_or(AuditValidationError::MissingField { field: "action" })?;
        let actor = self
            .actor
            .ok_or(AuditValidationError::MissingField { field: "actor" })?;
        let resource = self
            .resource
            .ok_or(AuditValidationError::MissingField { field: "resource" })?;

        Ok(AuditEvent {
            event_version: AUDIT_EVENT_VERSION,
            event_id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            actor,
            action,
            resource,
            step: self.step,
            reason: self.reason.unwrap_or_default(),
        })
    }
}

/// Trait for audit event sinks.
///
/// Implementations should be lightweight and non-blocking.
pub trait AuditSink: Send + Sync {
    /// Emit an audit event.
    fn emit(&self, event: AuditEvent);
}

/// Routes audit events to a sink. Emission is best effort: a sink failure
/// never fails the operation being audited.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEmitter").finish_non_exhaustive()
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::with_tracing()
    }
}

impl AuditEmitter {
    /// Creates a new audit emitter with the given sink.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Creates an audit emitter with the tracing sink (default for production).
    #[must_use]
    pub fn with_tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    /// Emits an audit event.
    pub fn emit(&self, event: AuditEvent) {
        self.sink.emit(event);
    }

    /// Builds and emits an event; a builder missing required fields is logged
    /// and dropped.
    pub fn record(&self, builder: AuditEventBuilder) {
        match builder.try_build() {
            Ok(event) => self.emit(event),
            Err(e) => tracing::warn!(error = %e, "dropping malformed audit event"),
        }
    }
}

/// Audit sink that emits events via tracing on the `audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        if event.action.is_failure() {
            tracing::warn!(
                target: "audit",
                event_id = %event.event_id,
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                step = ?event.step,
                correlation_id = ?event.correlation_id,
                reason = %event.reason,
                "grant_audit"
            );
        } else {
            tracing::info!(
                target: "audit",
                event_id = %event.event_id,
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                step = ?event.step,
                correlation_id = ?event.correlation_id,
                reason = %event.reason,
                "grant_audit"
            );
        }
    }
}

/// Audit sink that keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Returns the number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Returns true if no events have been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds events by action type.
    #[must_use]
    pub fn find_by_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .filter(|e| e.action == action)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        assert_eq!(AuditAction::GrantClaimed.to_string(), "GRANT_CLAIMED");
        assert_eq!(AuditAction::DispatchUnresolved.to_string(), "DISPATCH_UNRESOLVED");
    }

    #[test]
    fn test_failure_actions() {
        assert!(AuditAction::GrantFailed.is_failure());
        assert!(AuditAction::GrantVerificationFailed.is_failure());
        assert_eq!(AuditAction::GrantVerificationFailed.category(), "grant");
        assert!(AuditAction::DispatchUnresolved.is_failure());
        assert!(!AuditAction::GrantCompleted.is_failure());
        assert_eq!(AuditAction::AdminsMerged.category(), "admin");
    }

    #[test]
    fn test_builder_requires_fields() {
        let err = AuditEvent::builder()
            .action(AuditAction::GrantClaimed)
            .resource("k")
            .try_build()
            .expect_err("actor missing");
        assert_eq!(err, AuditValidationError::MissingField { field: "actor" });
    }

    #[test]
    fn test_serializes_camel_case() {
        let event = AuditEvent::builder()
            .action(AuditAction::GrantFailed)
            .actor("svc")
            .resource("k")
            .step("permissions")
            .correlation_id("evt-1")
            .reason("transient: throttled")
            .try_build()
            .expect("build");
        let json = serde_json::to_string(&event).expect("encode");
        assert!(json.contains("\"action\":\"GRANT_FAILED\""));
        assert!(json.contains("\"correlationId\":\"evt-1\""));
    }

    #[test]
    fn test_record_drops_malformed() {
        let sink = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::new(sink.clone());
        emitter.record(AuditEvent::builder().action(AuditAction::GrantClaimed));
        assert!(sink.is_empty());
    }
}
