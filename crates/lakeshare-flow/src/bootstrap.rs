//! Admin bootstrap: merges declared administrators into the account's
//! data-lake administrator list.
//!
//! The list is a process-external singleton other writers also touch. Every
//! round reads it fresh, appends the declared identities that are missing,
//! and writes the union back. The next read doubles as verification; if an
//! out-of-band writer dropped a declared identity in between, the round
//! repeats, up to the configured bound. Nothing is ever removed.

use std::sync::Arc;

use tracing::Instrument;

use lakeshare_core::audit::{AuditAction, AuditEmitter, AuditEvent};
use lakeshare_core::observability::reconcile_span;
use lakeshare_core::{AccountId, PrincipalArn};

use crate::config::Config;
use crate::error::ReconcileError;
use crate::metrics::record_admin_reconcile;
use crate::ports::{IdentityDirectory, LakeSettings};

const ACTOR: &str = "admin-bootstrap";

/// Result of a reconcile run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Declared identities this run added.
    pub added: Vec<PrincipalArn>,
    /// Declared roles that do not exist and were not added.
    pub skipped: Vec<PrincipalArn>,
    /// Administrators observed by the final read.
    pub admins: Vec<PrincipalArn>,
    /// Number of writes performed.
    pub writes: u32,
    /// Number of read rounds performed.
    pub attempts: u32,
}

impl ReconcileReport {
    /// Returns true if this run wrote the setting.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.writes > 0
    }
}

/// Maintains the data-lake administrator list.
pub struct AdminBootstrap {
    settings: Arc<dyn LakeSettings>,
    identity: Arc<dyn IdentityDirectory>,
    account_id: AccountId,
    max_attempts: u32,
    audit: AuditEmitter,
}

impl std::fmt::Debug for AdminBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminBootstrap")
            .field("account_id", &self.account_id)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl AdminBootstrap {
    /// Creates a bootstrap for the configured account.
    #[must_use]
    pub fn new(
        config: &Config,
        settings: Arc<dyn LakeSettings>,
        identity: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            settings,
            identity,
            account_id: config.account_id.clone(),
            max_attempts: config.admin_reconcile_attempts.max(1),
            audit: AuditEmitter::default(),
        }
    }

    /// Replaces the audit emitter.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = audit;
        self
    }

    /// Merges `declared` into the administrator list.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Identity`] if a declared role cannot be checked
    /// - [`ReconcileError::Settings`] if the setting cannot be read or written
    /// - [`ReconcileError::Unconverged`] if declared identities keep disappearing
    pub async fn reconcile(
        &self,
        declared: &[PrincipalArn],
    ) -> Result<ReconcileReport, ReconcileError> {
        let span = reconcile_span(self.account_id.as_str(), declared.len());
        let result = self.reconcile_inner(declared).instrument(span).await;
        match &result {
            Ok(report) if report.changed() => record_admin_reconcile("merged"),
            Ok(_) => record_admin_reconcile("unchanged"),
            Err(ReconcileError::Unconverged { .. }) => record_admin_reconcile("unconverged"),
            Err(_) => record_admin_reconcile("error"),
        }
        result
    }

    async fn reconcile_inner(
        &self,
        declared: &[PrincipalArn],
    ) -> Result<ReconcileReport, ReconcileError> {
        let (wanted, skipped) = self.validate(declared).await?;
        let mut added: Vec<PrincipalArn> = Vec::new();
        let mut writes = 0;

        for attempt in 1..=self.max_attempts {
            let current = self.read().await?;
            let missing = missing_from(&current, &wanted);
            if missing.is_empty() {
                return Ok(self.converged(added, skipped, current, writes, attempt));
            }
            if attempt > 1 {
                tracing::warn!(attempt, missing = missing.len(), "declared admins were dropped by another writer; re-merging");
            }

            let mut merged = current;
            merged.extend(missing.iter().cloned());
            self.settings
                .put_admins(&self.account_id, &merged)
                .await
                .map_err(|source| ReconcileError::Settings { source })?;
            writes += 1;
            for admin in missing {
                if !added.contains(&admin) {
                    added.push(admin);
                }
            }
        }

        let current = self.read().await?;
        let missing = missing_from(&current, &wanted);
        if missing.is_empty() {
            return Ok(self.converged(added, skipped, current, writes, self.max_attempts));
        }
        tracing::error!(
            attempts = self.max_attempts,
            missing = ?missing,
            "administrator list did not converge"
        );
        Err(ReconcileError::Unconverged {
            attempts: self.max_attempts,
            missing: missing.iter().map(ToString::to_string).collect(),
        })
    }

    fn converged(
        &self,
        added: Vec<PrincipalArn>,
        skipped: Vec<PrincipalArn>,
        admins: Vec<PrincipalArn>,
        writes: u32,
        attempts: u32,
    ) -> ReconcileReport {
        let action = if writes > 0 {
            tracing::info!(added = added.len(), writes, "merged data lake administrators");
            AuditAction::AdminsMerged
        } else {
            tracing::info!(admins = admins.len(), "data lake administrators already up to date");
            AuditAction::AdminsUnchanged
        };
        self.audit.record(
            AuditEvent::builder()
                .action(action)
                .actor(ACTOR)
                .resource(format!("lake-settings/{}", self.account_id))
                .reason(
                    added
                        .iter()
                        .map(PrincipalArn::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                ),
        );
        ReconcileReport {
            added,
            skipped,
            admins,
            writes,
            attempts,
        }
    }

    async fn read(&self) -> Result<Vec<PrincipalArn>, ReconcileError> {
        self.settings
            .get_admins(&self.account_id)
            .await
            .map_err(|source| ReconcileError::Settings { source })
    }

    /// Splits declared identities into those to merge and roles that do not
    /// exist. Only local roles can be checked; anything else is merged as is.
    async fn validate(
        &self,
        declared: &[PrincipalArn],
    ) -> Result<(Vec<PrincipalArn>, Vec<PrincipalArn>), ReconcileError> {
        let mut wanted = Vec::with_capacity(declared.len());
        let mut skipped = Vec::new();
        for principal in declared {
            if wanted.contains(principal) || skipped.contains(principal) {
                continue;
            }
            let local_role = principal
                .role_name()
                .filter(|_| principal.account_id().as_ref() == Some(&self.account_id));
            if let Some(role) = local_role {
                let exists = self
                    .identity
                    .role_exists(role)
                    .await
                    .map_err(|source| ReconcileError::Identity { source })?;
                if !exists {
                    tracing::warn!(principal = %principal, "declared admin role does not exist; skipping");
                    skipped.push(principal.clone());
                    continue;
                }
            }
            wanted.push(principal.clone());
        }
        Ok((wanted, skipped))
    }
}

fn missing_from(current: &[PrincipalArn], wanted: &[PrincipalArn]) -> Vec<PrincipalArn> {
    wanted
        .iter()
        .filter(|p| !current.contains(p))
        .cloned()
        .collect()
}
