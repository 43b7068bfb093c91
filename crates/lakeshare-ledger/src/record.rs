//! Grant records and their storage keys.
//!
//! ## Storage Layout
//!
//! ```text
//! grants/{key_hash_prefix}/{key_hash}.json
//! ```
//!
//! Where:
//! - `key_hash`: `SHA256("{principal_arn}|{asset}")`, hex encoded
//! - `key_hash_prefix`: first 2 characters of `key_hash`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use lakeshare_core::{AssetRef, PrincipalArn};

/// Prefix under which grant records are stored.
pub const GRANTS_PREFIX: &str = "grants";

/// Identity of a grant: one record per `(principal, asset)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantKey {
    /// Principal receiving access.
    pub principal_arn: PrincipalArn,
    /// Qualified asset name (`database.table` or `catalog.database.table`).
    pub asset: String,
}

impl GrantKey {
    /// Builds the key for a principal and asset reference.
    #[must_use]
    pub fn new(principal_arn: PrincipalArn, asset: &AssetRef) -> Self {
        Self {
            principal_arn,
            asset: asset.qualified_name(),
        }
    }

    /// Returns the SHA256 hash of the key, hex encoded.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.principal_arn.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.asset.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the storage path of this key's record.
    #[must_use]
    pub fn storage_path(&self) -> String {
        let hash = self.hash();
        let prefix = &hash[..2.min(hash.len())];
        format!("{GRANTS_PREFIX}/{prefix}/{hash}.json")
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.principal_arn, self.asset)
    }
}

/// Lifecycle status of a grant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Created, no delivery has claimed it yet.
    Pending,
    /// A delivery is executing the grant sequence.
    InProgress,
    /// Every step completed.
    Granted,
    /// The last attempt aborted at a step.
    Failed,
    /// Retired; further deliveries are no-ops.
    Tombstoned,
}

impl GrantStatus {
    /// Returns the status as a stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Granted => "granted",
            Self::Failed => "failed",
            Self::Tombstoned => "tombstoned",
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of the grant sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStep {
    /// Consumer database and resource-link table.
    Materialize,
    /// Resource share and principal association.
    Share,
    /// Lake permissions on the target table.
    Permissions,
    /// Cross-account read policy on the principal.
    Policy,
    /// Final ledger write.
    Record,
}

impl GrantStep {
    /// All steps in execution order.
    pub const ALL: [Self; 5] = [
        Self::Materialize,
        Self::Share,
        Self::Permissions,
        Self::Policy,
        Self::Record,
    ];

    /// Returns the step as a stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Materialize => "materialize",
            Self::Share => "share",
            Self::Permissions => "permissions",
            Self::Policy => "policy",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for GrantStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed re-verification of a key that stayed granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    /// Step whose check failed.
    pub step: GrantStep,
    /// Why it failed.
    pub reason: String,
    /// When it failed.
    pub at: DateTime<Utc>,
}

/// Durable record of a grant.
///
/// Path: `grants/{key_hash_prefix}/{key_hash}.json`
///
/// Records are never deleted; retiring a grant sets [`GrantStatus::Tombstoned`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecord {
    /// Record identity.
    pub key: GrantKey,

    /// Current status.
    pub status: GrantStatus,

    /// Incremented each time an approval with a never-seen request id arrives.
    pub generation: u64,

    /// Approval that last drove this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Every approval request id observed for this key.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub seen_requests: BTreeSet<String>,

    /// Resource share carrying the grant, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,

    /// Steps finished by the current (or last) attempt.
    #[serde(default)]
    pub completed_steps: Vec<GrantStep>,

    /// Step at which the last attempt aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<GrantStep>,

    /// Why the last attempt aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Failed attempts since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Last failed re-verification of this granted key, if it has not since
    /// verified cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_failure: Option<VerificationFailure>,

    /// Delivery currently holding the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// When the current claim was taken or last refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When a delivery last attempted the sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the record last reached `Granted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,
}

impl GrantRecord {
    /// Creates a pending record for a first-seen key.
    #[must_use]
    pub fn new_pending(key: GrantKey, request_id: Option<String>) -> Self {
        Self {
            key,
            status: GrantStatus::Pending,
            generation: 1,
            seen_requests: request_id.iter().cloned().collect(),
            request_id,
            share_id: None,
            completed_steps: Vec::new(),
            failed_step: None,
            failure_reason: None,
            consecutive_failures: 0,
            verification_failure: None,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
            last_attempt_at: None,
            granted_at: None,
        }
    }

    /// Returns whether an in-progress claim has outlived `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.status == GrantStatus::InProgress
            && self
                .claimed_at
                .is_none_or(|claimed_at| claimed_at + timeout < now)
    }

    /// Records the approval identity. The generation is bumped only for a
    /// request id this key has never seen; redelivering an older approval,
    /// in any order, leaves it unchanged.
    ///
    /// Returns true if the generation was bumped.
    pub fn observe_request(&mut self, request_id: Option<&str>) -> bool {
        let Some(incoming) = request_id else {
            return false;
        };
        if let Some(current) = self.request_id.take() {
            self.seen_requests.insert(current);
        }
        self.request_id = Some(incoming.to_string());
        let had_seen_any = !self.seen_requests.is_empty();
        if !self.seen_requests.insert(incoming.to_string()) {
            return false;
        }
        if had_seen_any {
            self.generation += 1;
        }
        had_seen_any
    }

    /// Marks the record as claimed by a delivery.
    pub fn mark_in_progress(&mut self, claimant: &str, now: DateTime<Utc>) {
        self.status = GrantStatus::InProgress;
        self.claimed_by = Some(claimant.to_string());
        self.claimed_at = Some(now);
        self.last_attempt_at = Some(now);
        self.completed_steps.clear();
    }

    /// Records a finished step and refreshes the claim.
    pub fn mark_step_completed(&mut self, step: GrantStep, now: DateTime<Utc>) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        self.claimed_at = Some(now);
    }

    /// Finalizes the record as granted.
    pub fn mark_granted(&mut self, now: DateTime<Utc>) {
        self.mark_step_completed(GrantStep::Record, now);
        self.status = GrantStatus::Granted;
        self.granted_at = Some(now);
        self.failed_step = None;
        self.failure_reason = None;
        self.consecutive_failures = 0;
        self.verification_failure = None;
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Restores a granted record whose re-verification failed at `step`.
    ///
    /// The status stays [`GrantStatus::Granted`]; the failure is kept in
    /// [`Self::verification_failure`] and does not count toward
    /// `consecutive_failures`.
    pub fn mark_verification_failed(
        &mut self,
        step: GrantStep,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.status = GrantStatus::Granted;
        self.completed_steps = GrantStep::ALL.to_vec();
        self.verification_failure = Some(VerificationFailure {
            step,
            reason: reason.into(),
            at: now,
        });
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Finalizes the record as failed at `step`.
    pub fn mark_failed(&mut self, step: GrantStep, reason: impl Into<String>) {
        self.status = GrantStatus::Failed;
        self.failed_step = Some(step);
        self.failure_reason = Some(reason.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Retires the record.
    pub fn mark_tombstoned(&mut self) {
        self.status = GrantStatus::Tombstoned;
        self.claimed_by = None;
        self.claimed_at = None;
    }
}
