//! Grant handler: performs the producer-side grant sequence for one event.
//!
//! ## Sequence
//!
//! Every delivery first claims the `(principal, asset)` key in the ledger.
//! The claimant then runs the steps in order, each checking existence
//! before acting:
//!
//! 1. **Materialize**: consumer database, execution-role access to it, and a
//!    resource-link table targeting the asset
//! 2. **Share**: resource share for the table, principal associated
//! 3. **Permissions**: `DESCRIBE` + `SELECT` for the principal (the execution
//!    role must be a data-lake administrator), on the asset and, when the
//!    asset is a view, on every table and view it reads from
//! 4. **Policy**: cross-account read policy attached to role principals
//! 5. **Record**: ledger finalized as granted
//!
//! Progress is checkpointed to the ledger after every step; the checkpoint
//! also refreshes the claim. A failed step aborts the sequence, records the
//! step and reason, and leaves earlier side effects in place. A later
//! delivery re-runs the whole sequence, and the existence checks make the
//! completed steps no-ops.
//!
//! A redelivery for a key that is already granted only re-verifies. If a
//! check fails there, the record stays granted, the failure is kept beside
//! it, and an alert is raised instead of failing the delivery.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use lakeshare_bus::{EventBusAddress, EventChannel};
use lakeshare_core::audit::{AuditAction, AuditEmitter, AuditEvent};
use lakeshare_core::observability::grant_span;
use lakeshare_core::storage::StorageBackend;
use lakeshare_core::{AccountId, Error, PrincipalArn, Region, SubscriptionEvent};
use lakeshare_ledger::{
    ClaimOutcome, FinalizeResult, GrantKey, GrantLedger, GrantRecord, GrantStatus, GrantStep,
    RecordVersion, VerificationFailure,
};

use crate::config::Config;
use crate::error::GrantError;
use crate::metrics::{StepTimer, record_grant, record_grant_alert};
use crate::ports::{
    DataCatalog, IdentityDirectory, LakePermissions, LakeResource, LakeSettings, LinkTarget,
    Permission, ResourceShares, TableInfo, share_name,
};
use crate::views::{TableName, ViewResolver};

/// Collaborators the grant handler acts on.
#[derive(Clone)]
pub struct GrantPorts {
    /// Catalog databases and tables.
    pub catalog: Arc<dyn DataCatalog>,
    /// Data-lake permissions.
    pub permissions: Arc<dyn LakePermissions>,
    /// Resource shares.
    pub shares: Arc<dyn ResourceShares>,
    /// Roles and managed policies.
    pub identity: Arc<dyn IdentityDirectory>,
    /// Data-lake administrator list.
    pub settings: Arc<dyn LakeSettings>,
}

impl GrantPorts {
    /// Uses one implementation for every port.
    pub fn single<T>(account: &Arc<T>) -> Self
    where
        T: DataCatalog + LakePermissions + ResourceShares + IdentityDirectory + LakeSettings + 'static,
    {
        Self {
            catalog: account.clone(),
            permissions: account.clone(),
            shares: account.clone(),
            identity: account.clone(),
            settings: account.clone(),
        }
    }
}

impl std::fmt::Debug for GrantPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantPorts").finish_non_exhaustive()
    }
}

/// What a step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// The step created or granted something.
    Performed,
    /// Everything the step ensures was already in place.
    AlreadySatisfied,
    /// The step does not apply to this grant.
    Skipped,
}

impl StepAction {
    /// Returns the action as a stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Performed => "performed",
            Self::AlreadySatisfied => "already_satisfied",
            Self::Skipped => "skipped",
        }
    }

    const fn audit_action(self) -> AuditAction {
        match self {
            Self::Performed => AuditAction::GrantStepCompleted,
            Self::AlreadySatisfied => AuditAction::GrantStepSatisfied,
            Self::Skipped => AuditAction::GrantStepSkipped,
        }
    }

    fn merge(self, other: Self) -> Self {
        if self == Self::Performed || other == Self::Performed {
            Self::Performed
        } else {
            self
        }
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// The step.
    pub step: GrantStep,
    /// What it did.
    pub action: StepAction,
}

/// Summary of a completed grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantReport {
    /// Ledger key.
    pub key: GrantKey,
    /// Ledger status before this delivery claimed the key.
    pub previous: GrantStatus,
    /// Approval generation.
    pub generation: u64,
    /// Resource share carrying the grant.
    pub share_id: Option<String>,
    /// Executed steps, in order.
    pub steps: Vec<StepReport>,
    /// True if this delivery took over a stale claim.
    pub took_over: bool,
    /// True if an `UnmanagedAssetGranted` announcement was published.
    pub announced: bool,
    /// Set when re-verifying an already granted key failed at a step.
    pub verification_failure: Option<VerificationFailure>,
}

impl GrantReport {
    /// Returns true if no step had to change anything.
    #[must_use]
    pub fn was_noop(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.action != StepAction::Performed || s.step == GrantStep::Record)
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The grant is in place.
    Granted(Box<GrantReport>),
    /// The event does not require a grant.
    Ignored {
        /// Why it was ignored.
        reason: String,
    },
    /// Another delivery holds a fresh claim on the key.
    InProgressElsewhere {
        /// When that claim was taken or refreshed.
        claimed_at: Option<DateTime<Utc>>,
    },
    /// The key is retired.
    Tombstoned,
}

impl GrantOutcome {
    /// Returns the metric label for this outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Granted(_) => "granted",
            Self::Ignored { .. } => "ignored",
            Self::InProgressElsewhere { .. } => "in_progress_elsewhere",
            Self::Tombstoned => "tombstoned",
        }
    }
}

struct Attempt<'a> {
    event: &'a SubscriptionEvent,
    principal: &'a PrincipalArn,
    catalog_id: AccountId,
    consumer_database: String,
    record: GrantRecord,
    version: RecordVersion,
    previous: GrantStatus,
    steps: Vec<StepReport>,
}

impl Attempt<'_> {
    fn database(&self) -> &str {
        &self.event.detail.target_asset_ref.database
    }

    fn table(&self) -> &str {
        &self.event.detail.target_asset_ref.table
    }

    fn table_resource(&self) -> LakeResource {
        LakeResource::Table {
            catalog_id: self.catalog_id.clone(),
            database: self.database().to_string(),
            name: self.table().to_string(),
        }
    }
}

/// Executes grants in the producer account.
pub struct GrantHandler<S> {
    ledger: GrantLedger<S>,
    ports: GrantPorts,
    account_id: AccountId,
    region: Region,
    execution_role: PrincipalArn,
    read_policy_arn: Option<String>,
    default_consumer_database: Option<String>,
    failure_alert_threshold: u32,
    announce_grants: bool,
    local_bus: EventBusAddress,
    source: String,
    channel: Option<Arc<dyn EventChannel>>,
    audit: AuditEmitter,
}

impl<S> std::fmt::Debug for GrantHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantHandler")
            .field("account_id", &self.account_id)
            .field("execution_role", &self.execution_role)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend> GrantHandler<S> {
    /// Creates a handler for the configured account.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if no execution role is configured.
    pub fn new(config: &Config, ledger: GrantLedger<S>, ports: GrantPorts) -> lakeshare_core::Result<Self> {
        Ok(Self {
            ledger,
            ports,
            account_id: config.account_id.clone(),
            region: config.region.clone(),
            execution_role: config.execution_role()?.clone(),
            read_policy_arn: config.read_policy_arn.clone(),
            default_consumer_database: config.default_consumer_database.clone(),
            failure_alert_threshold: config.failure_alert_threshold,
            announce_grants: config.announce_grants,
            local_bus: config.local_bus(),
            source: config.event_source(),
            channel: None,
            audit: AuditEmitter::default(),
        })
    }

    /// Sets the channel used for grant announcements.
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn EventChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Replaces the audit emitter.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &GrantLedger<S> {
        &self.ledger
    }

    /// Handles one delivery.
    ///
    /// # Errors
    ///
    /// - [`GrantError::InvalidEvent`] if the event is malformed or names no consumer database
    /// - [`GrantError::Ledger`] if the ledger cannot be read or written
    /// - [`GrantError::Step`] if a step failed (the ledger records the failure);
    ///   for an already granted key the failure is reported in
    ///   [`GrantReport::verification_failure`] instead
    /// - [`GrantError::ClaimLost`] if another delivery took over mid-sequence
    pub async fn grant(&self, event: &SubscriptionEvent) -> Result<GrantOutcome, GrantError> {
        let span = grant_span(
            event.id.as_str(),
            event.detail.target_principal_arn.as_str(),
            &event.detail.target_asset_ref.qualified_name(),
        );
        let result = self.grant_inner(event).instrument(span).await;
        match &result {
            Ok(outcome) => record_grant(outcome.as_str()),
            Err(GrantError::Step { .. }) => record_grant("failed"),
            Err(_) => record_grant("error"),
        }
        result
    }

    async fn grant_inner(&self, event: &SubscriptionEvent) -> Result<GrantOutcome, GrantError> {
        if !event.detail_type.is_acceptance() {
            return Ok(GrantOutcome::Ignored {
                reason: format!("detail type '{}' is not an acceptance", event.detail_type),
            });
        }
        if event.detail.is_managed_asset {
            return Ok(GrantOutcome::Ignored {
                reason: "managed assets are granted by the catalog".to_string(),
            });
        }
        event.validate().map_err(|e| GrantError::InvalidEvent {
            message: e.to_string(),
        })?;
        let consumer_database = self.consumer_database(event)?;

        let detail = &event.detail;
        let key = GrantKey::new(detail.target_principal_arn.clone(), &detail.target_asset_ref);
        let claim = self
            .ledger
            .claim(
                &key,
                detail.subscription_request_id.as_deref(),
                event.id.as_str(),
            )
            .await?;

        let (record, version, previous, took_over) = match claim {
            ClaimOutcome::Claimed {
                record,
                version,
                previous,
                took_over,
            } => (*record, version, previous, took_over),
            ClaimOutcome::InProgressElsewhere { claimed_at } => {
                tracing::info!(claimed_at = ?claimed_at, "grant in progress elsewhere");
                return Ok(GrantOutcome::InProgressElsewhere { claimed_at });
            }
            ClaimOutcome::Tombstoned => {
                tracing::info!("grant key is tombstoned");
                return Ok(GrantOutcome::Tombstoned);
            }
        };
        tracing::info!(
            previous = %previous,
            generation = record.generation,
            took_over,
            "claimed grant key"
        );
        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::GrantClaimed)
                .actor(self.execution_role.as_str())
                .resource(key.to_string())
                .correlation_id(event.id.as_str())
                .reason(format!("previous status {previous}")),
        );

        let mut attempt = Attempt {
            event,
            principal: &detail.target_principal_arn,
            catalog_id: detail.target_asset_ref.catalog_or(&self.account_id).clone(),
            consumer_database,
            record,
            version,
            previous,
            steps: Vec::with_capacity(GrantStep::ALL.len()),
        };
        self.run(&mut attempt).await?;

        let announced = previous != GrantStatus::Granted && self.announce(event).await;
        Ok(GrantOutcome::Granted(Box::new(GrantReport {
            key,
            previous,
            generation: attempt.record.generation,
            share_id: attempt.record.share_id.clone(),
            steps: attempt.steps,
            took_over,
            announced,
            verification_failure: attempt.record.verification_failure.clone(),
        })))
    }

    fn consumer_database(&self, event: &SubscriptionEvent) -> Result<String, GrantError> {
        event
            .detail
            .environment
            .as_ref()
            .and_then(|env| env.consumer_database.clone())
            .or_else(|| self.default_consumer_database.clone())
            .ok_or_else(|| GrantError::InvalidEvent {
                message: "event carries no consumer database and no default is configured"
                    .to_string(),
            })
    }

    async fn run(&self, attempt: &mut Attempt<'_>) -> Result<(), GrantError> {
        for step in [
            GrantStep::Materialize,
            GrantStep::Share,
            GrantStep::Permissions,
            GrantStep::Policy,
        ] {
            let timer = StepTimer::start(step.as_str());
            let result = match step {
                GrantStep::Materialize => self.materialize(attempt).await,
                GrantStep::Share => match self.share(attempt).await {
                    Ok((action, share_id)) => {
                        attempt.record.share_id = Some(share_id);
                        Ok(action)
                    }
                    Err(e) => Err(e),
                },
                GrantStep::Permissions => self.permissions(attempt).await,
                GrantStep::Policy => self.policy(attempt).await,
                GrantStep::Record => Ok(StepAction::Skipped),
            };
            drop(timer);

            match result {
                Ok(action) => {
                    tracing::debug!(step = %step, action = ?action, "grant step done");
                    self.audit_step(attempt, step, action);
                    attempt.steps.push(StepReport { step, action });
                    attempt.record.mark_step_completed(step, Utc::now());
                    self.checkpoint(attempt).await?;
                }
                Err(source) if attempt.previous == GrantStatus::Granted => {
                    return self.verification_failed(attempt, step, source).await;
                }
                Err(source) => return Err(self.fail(attempt, step, source).await),
            }
        }

        let _timer = StepTimer::start(GrantStep::Record.as_str());
        attempt.record.mark_granted(Utc::now());
        match self
            .ledger
            .finalize(&attempt.record, &attempt.version)
            .await?
        {
            FinalizeResult::Success { version } => attempt.version = version,
            FinalizeResult::Conflict { .. } => {
                return Err(GrantError::ClaimLost {
                    key: attempt.record.key.to_string(),
                });
            }
        }
        attempt.steps.push(StepReport {
            step: GrantStep::Record,
            action: StepAction::Performed,
        });
        tracing::info!(share_id = ?attempt.record.share_id, "grant complete");
        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::GrantCompleted)
                .actor(self.execution_role.as_str())
                .resource(attempt.record.key.to_string())
                .correlation_id(attempt.event.id.as_str())
                .step(GrantStep::Record.as_str()),
        );
        Ok(())
    }

    async fn checkpoint(&self, attempt: &mut Attempt<'_>) -> Result<(), GrantError> {
        match self
            .ledger
            .checkpoint(&attempt.record, &attempt.version)
            .await?
        {
            FinalizeResult::Success { version } => {
                attempt.version = version;
                Ok(())
            }
            FinalizeResult::Conflict { .. } => {
                tracing::warn!("grant claim lost during checkpoint");
                Err(GrantError::ClaimLost {
                    key: attempt.record.key.to_string(),
                })
            }
        }
    }

    async fn fail(&self, attempt: &mut Attempt<'_>, step: GrantStep, source: Error) -> GrantError {
        attempt.record.mark_failed(step, source.to_string());
        match self.ledger.finalize(&attempt.record, &attempt.version).await {
            Ok(FinalizeResult::Success { .. }) => {}
            Ok(FinalizeResult::Conflict { .. }) => {
                tracing::warn!(step = %step, "grant claim lost before failure was recorded");
            }
            Err(e) => tracing::error!(step = %step, error = %e, "failed to record grant failure"),
        }

        let class = source.class();
        let failures = attempt.record.consecutive_failures;
        if class.requires_alert() || failures >= self.failure_alert_threshold {
            tracing::error!(
                alert = true,
                step = %step,
                class = %class,
                consecutive_failures = failures,
                error = %source,
                "grant needs operator attention"
            );
            record_grant_alert();
        } else {
            tracing::warn!(
                step = %step,
                class = %class,
                consecutive_failures = failures,
                error = %source,
                "grant step failed"
            );
        }
        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::GrantFailed)
                .actor(self.execution_role.as_str())
                .resource(attempt.record.key.to_string())
                .correlation_id(attempt.event.id.as_str())
                .step(step.as_str())
                .reason(source.to_string()),
        );
        GrantError::Step { step, source }
    }

    async fn verification_failed(
        &self,
        attempt: &mut Attempt<'_>,
        step: GrantStep,
        source: Error,
    ) -> Result<(), GrantError> {
        attempt
            .record
            .mark_verification_failed(step, source.to_string(), Utc::now());
        match self
            .ledger
            .finalize(&attempt.record, &attempt.version)
            .await?
        {
            FinalizeResult::Success { version } => attempt.version = version,
            FinalizeResult::Conflict { .. } => {
                return Err(GrantError::ClaimLost {
                    key: attempt.record.key.to_string(),
                });
            }
        }

        tracing::error!(
            alert = true,
            step = %step,
            class = %source.class(),
            error = %source,
            "re-verification of granted key failed; grant left in place"
        );
        record_grant_alert();
        self.audit.record(
            AuditEvent::builder()
                .action(AuditAction::GrantVerificationFailed)
                .actor(self.execution_role.as_str())
                .resource(attempt.record.key.to_string())
                .correlation_id(attempt.event.id.as_str())
                .step(step.as_str())
                .reason(source.to_string()),
        );
        Ok(())
    }

    fn audit_step(&self, attempt: &Attempt<'_>, step: GrantStep, action: StepAction) {
        self.audit.record(
            AuditEvent::builder()
                .action(action.audit_action())
                .actor(self.execution_role.as_str())
                .resource(attempt.record.key.to_string())
                .correlation_id(attempt.event.id.as_str())
                .step(step.as_str()),
        );
    }

    async fn materialize(&self, attempt: &Attempt<'_>) -> lakeshare_core::Result<StepAction> {
        let catalog = &self.ports.catalog;
        let local = &self.account_id;
        let consumer_db = attempt.consumer_database.as_str();
        let mut action = StepAction::AlreadySatisfied;

        if !catalog.get_database(local, consumer_db).await? {
            match catalog.create_database(local, consumer_db).await {
                Ok(()) => {
                    tracing::info!(database = consumer_db, "created consumer database");
                    action = StepAction::Performed;
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        let database = LakeResource::Database {
            catalog_id: local.clone(),
            name: consumer_db.to_string(),
        };
        let held = self
            .ports
            .permissions
            .list_permissions(&self.execution_role, &database)
            .await?;
        if !held.contains(&Permission::All) {
            self.ports
                .permissions
                .grant_permissions(&self.execution_role, &database, &BTreeSet::from([Permission::All]))
                .await?;
            action = StepAction::Performed;
        }

        let expected = LinkTarget {
            catalog_id: attempt.catalog_id.clone(),
            database: attempt.database().to_string(),
            table: attempt.table().to_string(),
            region: self.region.clone(),
        };
        let link_action = self
            .ensure_link(local, consumer_db, attempt.table(), &expected)
            .await?;
        Ok(action.merge(link_action))
    }

    async fn ensure_link(
        &self,
        local: &AccountId,
        consumer_db: &str,
        table: &str,
        expected: &LinkTarget,
    ) -> lakeshare_core::Result<StepAction> {
        let catalog = &self.ports.catalog;
        let verify = |existing: TableInfo| {
            if existing.target.as_ref() == Some(expected) {
                Ok(StepAction::AlreadySatisfied)
            } else {
                Err(Error::conflict(format!(
                    "{consumer_db}.{table} exists and is not a link to {}.{}.{}",
                    expected.catalog_id, expected.database, expected.table
                )))
            }
        };

        if let Some(existing) = catalog.get_table(local, consumer_db, table).await? {
            return verify(existing);
        }
        let link = TableInfo::link(table, expected.clone());
        match catalog.create_table(local, consumer_db, &link).await {
            Ok(()) => {
                tracing::info!(database = consumer_db, table, "created resource link");
                Ok(StepAction::Performed)
            }
            Err(e) if e.is_already_exists() => {
                let existing = catalog
                    .get_table(local, consumer_db, table)
                    .await?
                    .ok_or_else(|| Error::conflict(format!("{consumer_db}.{table} vanished after create")))?;
                verify(existing)
            }
            Err(e) => Err(e),
        }
    }

    async fn share(&self, attempt: &Attempt<'_>) -> lakeshare_core::Result<(StepAction, String)> {
        let shares = &self.ports.shares;
        let resource = attempt.table_resource();
        let name = share_name(&attempt.catalog_id, attempt.database(), attempt.table());
        let mut action = StepAction::AlreadySatisfied;

        let known = match &attempt.record.share_id {
            Some(id) => shares.get_share(id).await?,
            None => None,
        };
        let share = match known {
            Some(share) => share,
            None => match shares.find_share_by_name(&name).await? {
                Some(share) => share,
                None => match shares.create_share(&name, &resource).await {
                    Ok(share) => {
                        tracing::info!(share_id = %share.share_id, name = %name, "created resource share");
                        action = StepAction::Performed;
                        share
                    }
                    Err(e) if e.is_already_exists() => shares
                        .find_share_by_name(&name)
                        .await?
                        .ok_or_else(|| Error::conflict(format!("share {name} exists but cannot be found")))?,
                    Err(e) => return Err(e),
                },
            },
        };

        if !share.principals.contains(attempt.principal.as_str()) {
            shares.associate(&share.share_id, attempt.principal).await?;
            action = StepAction::Performed;
        }
        Ok((action, share.share_id))
    }

    async fn permissions(&self, attempt: &Attempt<'_>) -> lakeshare_core::Result<StepAction> {
        let admins = self.ports.settings.get_admins(&self.account_id).await?;
        if !admins.contains(&self.execution_role) {
            return Err(Error::permission_denied(format!(
                "execution role {} is not a data lake administrator",
                self.execution_role
            )));
        }

        let mut action = self
            .ensure_read(attempt.principal, &attempt.table_resource())
            .await?;

        let root = TableName::new(attempt.database(), attempt.table());
        let mut resolver = ViewResolver::new(self.ports.catalog.as_ref(), &attempt.catalog_id);
        for dependency in resolver.dependencies(&root).await? {
            let resource = LakeResource::Table {
                catalog_id: attempt.catalog_id.clone(),
                database: dependency.database.clone(),
                name: dependency.table.clone(),
            };
            let granted = self.ensure_read(attempt.principal, &resource).await?;
            if granted == StepAction::Performed {
                tracing::info!(view = %root, dependency = %dependency, "granted view dependency");
            }
            action = action.merge(granted);
        }
        Ok(action)
    }

    async fn ensure_read(
        &self,
        principal: &PrincipalArn,
        resource: &LakeResource,
    ) -> lakeshare_core::Result<StepAction> {
        let held = self
            .ports
            .permissions
            .list_permissions(principal, resource)
            .await?;
        if held.contains(&Permission::All) {
            return Ok(StepAction::AlreadySatisfied);
        }
        let missing: BTreeSet<Permission> = Permission::READ
            .into_iter()
            .filter(|p| !held.contains(p))
            .collect();
        if missing.is_empty() {
            return Ok(StepAction::AlreadySatisfied);
        }
        self.ports
            .permissions
            .grant_permissions(principal, resource, &missing)
            .await?;
        tracing::info!(resource = %resource, missing = ?missing, "granted table permissions");
        Ok(StepAction::Performed)
    }

    async fn policy(&self, attempt: &Attempt<'_>) -> lakeshare_core::Result<StepAction> {
        let Some(policy_arn) = &self.read_policy_arn else {
            return Ok(StepAction::Skipped);
        };
        let Some(role_name) = attempt.principal.role_name() else {
            tracing::debug!("principal is not a role; skipping policy");
            return Ok(StepAction::Skipped);
        };
        if attempt.principal.account_id().as_ref() != Some(&self.account_id) {
            tracing::debug!("role lives in another account; skipping policy");
            return Ok(StepAction::Skipped);
        }

        let identity = &self.ports.identity;
        if !identity.role_exists(role_name).await? {
            return Err(Error::not_found("role", role_name));
        }
        let attached = identity.list_attached_policies(role_name).await?;
        if attached.iter().any(|p| p == policy_arn) {
            return Ok(StepAction::AlreadySatisfied);
        }
        identity.attach_policy(role_name, policy_arn).await?;
        tracing::info!(role = role_name, policy = %policy_arn, "attached read policy");
        Ok(StepAction::Performed)
    }

    async fn announce(&self, event: &SubscriptionEvent) -> bool {
        if !self.announce_grants {
            return false;
        }
        let Some(channel) = &self.channel else {
            return false;
        };
        let announcement = event.granted_announcement(&self.source);
        match channel
            .publish(&self.local_bus, &self.account_id, &announcement)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(bus = %self.local_bus, error = %e, "grant announcement failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{Call, InMemoryAccount};
    use crate::views::encode_view_text;
    use lakeshare_bus::memory::InMemoryEventBus;
    use lakeshare_bus::{EventPattern, PublishPolicy, RoutingRule, RuleTarget};
    use lakeshare_core::audit::MemoryAuditSink;
    use lakeshare_core::{
        AssetRef, DetailType, EnvironmentContext, ErrorClass, MemoryBackend, SubscriptionDetail,
    };

    const ACCOUNT: &str = "222222222222";
    const EXEC_ROLE: &str = "arn:aws:iam::222222222222:role/lakeshare-grant";
    const CONSUMER: &str = "arn:aws:iam::222222222222:role/consumer";
    const READ_POLICY: &str = "arn:aws:iam::222222222222:policy/lakeshare-read";

    struct Fixture {
        account: Arc<InMemoryAccount>,
        sink: Arc<MemoryAuditSink>,
        handler: GrantHandler<MemoryBackend>,
    }

    fn config() -> Config {
        let mut config = Config::new(ACCOUNT.parse().unwrap(), "us-east-1".parse().unwrap());
        config.execution_role_arn = Some(EXEC_ROLE.parse().unwrap());
        config.read_policy_arn = Some(READ_POLICY.into());
        config
    }

    fn fixture_with(config: &Config) -> Fixture {
        let account = Arc::new(InMemoryAccount::new(ACCOUNT.parse().unwrap()));
        account.add_role("lakeshare-grant").unwrap();
        account.add_role("consumer").unwrap();
        account.set_admins(vec![EXEC_ROLE.parse().unwrap()]).unwrap();
        account.add_database("sales").unwrap();
        account
            .add_table("sales", TableInfo::physical("orders"))
            .unwrap();

        let sink = Arc::new(MemoryAuditSink::new());
        let ledger = GrantLedger::new(Arc::new(MemoryBackend::new()));
        let handler = GrantHandler::new(config, ledger, GrantPorts::single(&account))
            .unwrap()
            .with_audit(AuditEmitter::new(sink.clone()));
        Fixture {
            account,
            sink,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&config())
    }

    fn event(principal: &str) -> SubscriptionEvent {
        SubscriptionEvent::new(
            DetailType::UnmanagedAssetSubscriptionRequestAccepted,
            "custom.lakeshare",
            SubscriptionDetail {
                listing_id: "L1".into(),
                target_principal_arn: principal.parse().unwrap(),
                target_asset_ref: AssetRef::new("sales", "orders"),
                origin_account_id: None,
                origin_region: None,
                domain_id: Some("dzd-1".into()),
                subscription_request_id: Some("req-1".into()),
                is_managed_asset: false,
                environment: Some(EnvironmentContext {
                    environment_id: "env-pub".into(),
                    consumer_database: Some("consumer_db".into()),
                    user_role_arn: None,
                }),
            },
        )
    }

    fn report(outcome: GrantOutcome) -> GrantReport {
        match outcome {
            GrantOutcome::Granted(report) => *report,
            other => panic!("expected granted, got {other:?}"),
        }
    }

    fn table_resource() -> LakeResource {
        LakeResource::Table {
            catalog_id: ACCOUNT.parse().unwrap(),
            database: "sales".into(),
            name: "orders".into(),
        }
    }

    #[tokio::test]
    async fn test_first_delivery_runs_every_step() {
        let f = fixture();
        let report = report(f.handler.grant(&event(CONSUMER)).await.expect("grant"));

        assert_eq!(report.previous, GrantStatus::Pending);
        assert_eq!(report.key.asset, "sales.orders");
        assert_eq!(
            report.steps.iter().map(|s| s.step).collect::<Vec<_>>(),
            GrantStep::ALL.to_vec()
        );
        assert!(report.steps.iter().all(|s| s.action == StepAction::Performed));
        assert!(!report.was_noop());

        assert_eq!(f.account.calls(Call::CreateDatabase), 1);
        assert_eq!(f.account.calls(Call::CreateTable), 1);
        assert_eq!(f.account.calls(Call::CreateShare), 1);
        assert_eq!(f.account.calls(Call::Associate), 1);
        assert_eq!(f.account.calls(Call::AttachPolicy), 1);

        let link = f.account.table("consumer_db", "orders").expect("link");
        assert_eq!(link.target.expect("target").database, "sales");
        assert_eq!(
            f.account.permissions(&CONSUMER.parse().unwrap(), &table_resource()),
            BTreeSet::from(Permission::READ)
        );
        assert_eq!(f.account.attached_policies("consumer"), vec![READ_POLICY.to_string()]);

        let (record, _) = f.handler.ledger().get(&report.key).await.unwrap().expect("record");
        assert_eq!(record.status, GrantStatus::Granted);
        assert_eq!(record.share_id, report.share_id);
        assert_eq!(f.sink.find_by_action(AuditAction::GrantCompleted).len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_verifies_without_recreating() {
        let f = fixture();
        let e = event(CONSUMER);
        f.handler.grant(&e).await.expect("first");
        let second = report(f.handler.grant(&e).await.expect("second"));

        assert_eq!(second.previous, GrantStatus::Granted);
        assert!(second.was_noop());
        assert_eq!(f.account.calls(Call::CreateDatabase), 1);
        assert_eq!(f.account.calls(Call::CreateTable), 1);
        assert_eq!(f.account.calls(Call::CreateShare), 1);
        assert_eq!(f.account.calls(Call::Associate), 1);
        assert_eq!(f.account.calls(Call::AttachPolicy), 1);
        assert_eq!(f.account.shares().len(), 1);
    }

    #[tokio::test]
    async fn test_granted_redelivery_survives_failed_verification() {
        let f = fixture();
        let e = event(CONSUMER);
        f.handler.grant(&e).await.expect("first");
        f.account.fail(Call::ListPermissions, ErrorClass::Transient, 5).unwrap();

        let second = report(f.handler.grant(&e).await.expect("redelivery"));
        assert_eq!(second.previous, GrantStatus::Granted);
        let failure = second.verification_failure.as_ref().expect("failure reported");
        assert_eq!(failure.step, GrantStep::Materialize);
        assert!(second.was_noop());

        let (record, _) = f.handler.ledger().get(&second.key).await.unwrap().expect("record");
        assert_eq!(record.status, GrantStatus::Granted);
        assert_eq!(record.completed_steps, GrantStep::ALL.to_vec());
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.failed_step.is_none());
        assert!(record.verification_failure.is_some());
        assert_eq!(f.sink.find_by_action(AuditAction::GrantVerificationFailed).len(), 1);
        assert!(f.sink.find_by_action(AuditAction::GrantFailed).is_empty());

        f.account.clear_failures().unwrap();
        let third = report(f.handler.grant(&e).await.expect("clean redelivery"));
        assert!(third.verification_failure.is_none());
        let (record, _) = f.handler.ledger().get(&third.key).await.unwrap().expect("record");
        assert!(record.verification_failure.is_none());
        assert_eq!(f.account.calls(Call::CreateShare), 1);
    }

    fn table(database: &str, name: &str) -> LakeResource {
        LakeResource::Table {
            catalog_id: ACCOUNT.parse().unwrap(),
            database: database.into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_view_grant_covers_nested_dependencies() {
        let f = fixture();
        f.account.add_database("crm").unwrap();
        f.account.add_table("crm", TableInfo::physical("customers")).unwrap();
        f.account
            .add_table(
                "sales",
                TableInfo::view(
                    "orders_enriched",
                    encode_view_text(
                        "SELECT o.id, c.name FROM orders o \
                         JOIN crm.customers c ON o.customer_id = c.id \
                         WHERE o.id IN (SELECT id FROM orders_summary)",
                    ),
                ),
            )
            .unwrap();
        f.account
            .add_table(
                "sales",
                TableInfo::view(
                    "orders_summary",
                    encode_view_text("SELECT * FROM orders_enriched JOIN orders USING (id)"),
                ),
            )
            .unwrap();

        let mut e = event(CONSUMER);
        e.detail.target_asset_ref = AssetRef::new("sales", "orders_summary");
        let principal: PrincipalArn = CONSUMER.parse().unwrap();

        let first = report(f.handler.grant(&e).await.expect("grant"));
        assert_eq!(first.steps[2].action, StepAction::Performed);
        for (database, name) in [
            ("sales", "orders_summary"),
            ("sales", "orders_enriched"),
            ("sales", "orders"),
            ("crm", "customers"),
        ] {
            assert_eq!(
                f.account.permissions(&principal, &table(database, name)),
                BTreeSet::from(Permission::READ),
                "{database}.{name}"
            );
        }
        // One link lookup, then one lookup per relation despite the shared
        // `orders` reference and the cycle back to the root.
        assert_eq!(f.account.calls(Call::GetTable), 5);
        assert_eq!(f.account.calls(Call::GrantPermissions), 5);

        let second = report(f.handler.grant(&e).await.expect("redelivery"));
        assert_eq!(second.steps[2].action, StepAction::AlreadySatisfied);
        assert!(second.was_noop());
        assert_eq!(f.account.calls(Call::GrantPermissions), 5);
    }

    #[tokio::test]
    async fn test_undecodable_view_fails_permissions() {
        let f = fixture();
        f.account
            .add_table("sales", TableInfo::view("broken", "SELECT 1"))
            .unwrap();
        let mut e = event(CONSUMER);
        e.detail.target_asset_ref = AssetRef::new("sales", "broken");

        let err = f.handler.grant(&e).await.expect_err("invalid view");
        assert_eq!(err.step(), Some(GrantStep::Permissions));
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[tokio::test]
    async fn test_failed_step_resumes_without_duplicate_share() {
        let f = fixture();
        f.account.set_admins(Vec::new()).unwrap();

        let err = f.handler.grant(&event(CONSUMER)).await.expect_err("not admin");
        assert_eq!(err.step(), Some(GrantStep::Permissions));
        assert_eq!(err.class(), ErrorClass::PermissionDenied);

        let key = GrantKey::new(CONSUMER.parse().unwrap(), &AssetRef::new("sales", "orders"));
        let (record, _) = f.handler.ledger().get(&key).await.unwrap().expect("record");
        assert_eq!(record.status, GrantStatus::Failed);
        assert_eq!(record.failed_step, Some(GrantStep::Permissions));
        assert_eq!(record.consecutive_failures, 1);
        assert!(record.share_id.is_some());
        assert_eq!(f.sink.find_by_action(AuditAction::GrantFailed).len(), 1);

        f.account.set_admins(vec![EXEC_ROLE.parse().unwrap()]).unwrap();
        let report = report(f.handler.grant(&event(CONSUMER)).await.expect("retry"));
        assert_eq!(report.previous, GrantStatus::Failed);
        assert_eq!(f.account.calls(Call::CreateShare), 1);
        assert_eq!(f.account.calls(Call::CreateTable), 1);
        assert_eq!(report.steps[1].action, StepAction::AlreadySatisfied);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retryable_and_counted() {
        let f = fixture();
        f.account.fail(Call::AttachPolicy, ErrorClass::Transient, 2).unwrap();

        for expected in 1..=2 {
            let err = f.handler.grant(&event(CONSUMER)).await.expect_err("transient");
            assert!(err.class().is_retryable());
            let key = GrantKey::new(CONSUMER.parse().unwrap(), &AssetRef::new("sales", "orders"));
            let (record, _) = f.handler.ledger().get(&key).await.unwrap().expect("record");
            assert_eq!(record.consecutive_failures, expected);
            assert_eq!(record.failed_step, Some(GrantStep::Policy));
        }

        let report = report(f.handler.grant(&event(CONSUMER)).await.expect("recovered"));
        assert_eq!(report.steps[3].action, StepAction::Performed);
        let (record, _) = f.handler.ledger().get(&report.key).await.unwrap().expect("record");
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_non_role_principal_skips_policy() {
        let f = fixture();
        let report = report(
            f.handler
                .grant(&event("arn:aws:iam::222222222222:user/analyst"))
                .await
                .expect("grant"),
        );
        assert_eq!(report.steps[3].action, StepAction::Skipped);
        assert_eq!(f.account.calls(Call::ListAttachedPolicies), 0);
    }

    #[tokio::test]
    async fn test_foreign_role_skips_policy() {
        let f = fixture();
        let report = report(
            f.handler
                .grant(&event("arn:aws:iam::333333333333:role/consumer"))
                .await
                .expect("grant"),
        );
        assert_eq!(report.steps[3].action, StepAction::Skipped);
    }

    #[tokio::test]
    async fn test_conflicting_table_fails_materialize() {
        let f = fixture();
        f.account.add_database("consumer_db").unwrap();
        f.account
            .add_table("consumer_db", TableInfo::physical("orders"))
            .unwrap();

        let err = f.handler.grant(&event(CONSUMER)).await.expect_err("conflict");
        assert_eq!(err.step(), Some(GrantStep::Materialize));
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(f.account.calls(Call::CreateShare), 0);
    }

    #[tokio::test]
    async fn test_existing_share_by_name_is_reused() {
        let f = fixture();
        let name = share_name(&ACCOUNT.parse().unwrap(), "sales", "orders");
        let existing = f.account.create_share(&name, &table_resource()).await.unwrap();

        let report = report(f.handler.grant(&event(CONSUMER)).await.expect("grant"));
        assert_eq!(report.share_id.as_deref(), Some(existing.share_id.as_str()));
        assert_eq!(f.account.shares().len(), 1);
    }

    #[tokio::test]
    async fn test_in_progress_elsewhere_exits_cleanly() {
        let f = fixture();
        let key = GrantKey::new(CONSUMER.parse().unwrap(), &AssetRef::new("sales", "orders"));
        f.handler.ledger().claim(&key, None, "other-delivery").await.unwrap();

        let outcome = f.handler.grant(&event(CONSUMER)).await.expect("grant");
        assert!(matches!(outcome, GrantOutcome::InProgressElsewhere { .. }));
        assert_eq!(f.account.calls(Call::GetDatabase), 0);
    }

    #[tokio::test]
    async fn test_tombstoned_key_is_a_noop() {
        let f = fixture();
        let e = event(CONSUMER);
        let first = report(f.handler.grant(&e).await.expect("grant"));
        assert!(f.handler.ledger().tombstone(&first.key).await.unwrap());

        let outcome = f.handler.grant(&e).await.expect("grant");
        assert_eq!(outcome, GrantOutcome::Tombstoned);
        assert_eq!(f.account.calls(Call::CreateShare), 1);
    }

    #[tokio::test]
    async fn test_managed_and_foreign_events_are_ignored() {
        let f = fixture();
        let mut managed = event(CONSUMER);
        managed.detail.is_managed_asset = true;
        assert!(matches!(
            f.handler.grant(&managed).await.expect("grant"),
            GrantOutcome::Ignored { .. }
        ));

        let mut granted = event(CONSUMER);
        granted.detail_type = DetailType::UnmanagedAssetGranted;
        assert!(matches!(
            f.handler.grant(&granted).await.expect("grant"),
            GrantOutcome::Ignored { .. }
        ));
        assert!(f.handler.ledger().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_consumer_database_is_invalid() {
        let f = fixture();
        let mut e = event(CONSUMER);
        e.detail.environment = None;
        let err = f.handler.grant(&e).await.expect_err("invalid");
        assert_eq!(err.class(), ErrorClass::Invalid);
        assert!(f.handler.ledger().list().await.unwrap().is_empty());

        let mut config = config();
        config.default_consumer_database = Some("fallback_db".into());
        let f = fixture_with(&config);
        f.handler.grant(&e).await.expect("grant with default");
        assert!(f.account.has_database("fallback_db"));
    }

    #[tokio::test]
    async fn test_announces_first_grant_only() {
        let mut config = config();
        config.announce_grants = true;
        let bus = Arc::new(InMemoryEventBus::new());
        let local = config.local_bus();
        bus.create_bus(local.clone(), PublishPolicy::owner_only(local.account.clone()))
            .unwrap();
        bus.put_rule(
            &local,
            RoutingRule::new(
                "granted-announcements",
                EventPattern::any().with_detail_type(DetailType::UnmanagedAssetGranted),
            )
            .with_target(RuleTarget::Handler("announcements".into())),
        )
        .unwrap();

        let f = fixture_with(&config);
        let handler = f.handler.with_channel(bus.clone());
        let e = event(CONSUMER);

        assert!(report(handler.grant(&e).await.expect("first")).announced);
        assert!(!report(handler.grant(&e).await.expect("second")).announced);
        let announcements = bus.drain("announcements").unwrap();
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].event.source, "custom.lakeshare");
    }

    #[tokio::test]
    async fn test_announcement_failure_does_not_fail_grant() {
        let mut config = config();
        config.announce_grants = true;
        let bus = Arc::new(InMemoryEventBus::new());
        let f = fixture_with(&config);
        let handler = f.handler.with_channel(bus);

        let report = report(handler.grant(&event(CONSUMER)).await.expect("grant"));
        assert!(!report.announced);
    }

    #[test]
    fn handler_requires_execution_role() {
        let mut config = config();
        config.execution_role_arn = None;
        let account = Arc::new(InMemoryAccount::new(ACCOUNT.parse().unwrap()));
        let ledger = GrantLedger::new(Arc::new(MemoryBackend::new()));
        assert!(GrantHandler::new(&config, ledger, GrantPorts::single(&account)).is_err());
    }
}
