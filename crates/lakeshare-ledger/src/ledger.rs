//! Grant ledger: conditional-write protocol over [`StorageBackend`].
//!
//! ## Protocol
//!
//! 1. `get_or_create` writes a `Pending` record with a `DoesNotExist`
//!    precondition; on conflict the winner's record is loaded instead.
//! 2. `claim` moves the record to `InProgress` with a `MatchesVersion`
//!    precondition. Exactly one of several concurrent deliveries wins;
//!    the others observe `InProgress` and back off.
//! 3. An `InProgress` record whose claim is older than the stale timeout is
//!    taken over by the same version CAS.
//! 4. `checkpoint` and `finalize` write the whole record against the version
//!    the claimant holds. A mismatch means the claim was lost.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use lakeshare_core::storage::{StorageBackend, WritePrecondition, WriteResult};

use crate::error::{LedgerError, Result};
use crate::metrics::{record_cas_conflict, record_claim};
use crate::record::{GRANTS_PREFIX, GrantKey, GrantRecord, GrantStatus};

/// Default timeout after which an in-progress claim may be taken over (5 minutes).
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::minutes(5);

/// Bound on re-read/re-write cycles when conditional writes keep losing.
pub const MAX_CAS_ATTEMPTS: u32 = 5;

/// Opaque version of a stored record, used for CAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion(String);

impl RecordVersion {
    /// Creates a new record version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of attempting to claim a grant key.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This delivery holds the claim and must run the grant sequence.
    Claimed {
        /// The claimed record (status `InProgress`).
        record: Box<GrantRecord>,
        /// Version to use for checkpoints and finalization.
        version: RecordVersion,
        /// Status before the claim.
        previous: GrantStatus,
        /// True if a stale claim was taken over.
        took_over: bool,
    },
    /// Another delivery holds a fresh claim.
    InProgressElsewhere {
        /// When the other delivery claimed (or last refreshed) the record.
        claimed_at: Option<DateTime<Utc>>,
    },
    /// The record is retired.
    Tombstoned,
}

/// Result of a versioned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    /// The write succeeded.
    Success {
        /// New version after the write.
        version: RecordVersion,
    },
    /// Version mismatch (another delivery wrote first).
    Conflict {
        /// Current version that caused the conflict.
        current_version: RecordVersion,
    },
}

impl FinalizeResult {
    /// Returns true if the write succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Durable idempotency ledger keyed by `(principal, asset)`.
pub struct GrantLedger<S> {
    storage: Arc<S>,
    stale_timeout: Duration,
}

impl<S> Clone for GrantLedger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            stale_timeout: self.stale_timeout,
        }
    }
}

impl<S> std::fmt::Debug for GrantLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantLedger")
            .field("stale_timeout", &self.stale_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend> GrantLedger<S> {
    /// Creates a ledger with the default stale-claim timeout.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }

    /// Sets the stale-claim timeout.
    #[must_use]
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Returns the stale-claim timeout.
    #[must_use]
    pub const fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// Loads the record for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored record is unreadable.
    pub async fn get(&self, key: &GrantKey) -> Result<Option<(GrantRecord, RecordVersion)>> {
        self.load(&key.storage_path()).await
    }

    /// Loads the record for `key`, creating a `Pending` one if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored record is unreadable.
    pub async fn get_or_create(
        &self,
        key: &GrantKey,
        request_id: Option<&str>,
    ) -> Result<(GrantRecord, RecordVersion)> {
        let path = key.storage_path();
        if let Some(existing) = self.load(&path).await? {
            return Ok(existing);
        }

        let record = GrantRecord::new_pending(key.clone(), request_id.map(str::to_string));
        match self
            .write(&path, &record, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => {
                tracing::debug!(key = %key, "created grant record");
                Ok((record, RecordVersion::new(version)))
            }
            WriteResult::PreconditionFailed { .. } => {
                record_cas_conflict("create");
                self.load(&path)
                    .await?
                    .ok_or_else(|| LedgerError::InvariantViolation {
                        message: format!("grant record {key} disappeared during create"),
                    })
            }
        }
    }

    /// Moves the record from `expected` to `new` status if it is still in `expected`.
    ///
    /// Returns false if the record is absent, in another status, or was
    /// modified concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored record is unreadable.
    pub async fn compare_and_set(
        &self,
        key: &GrantKey,
        expected: GrantStatus,
        new: GrantStatus,
    ) -> Result<bool> {
        let path = key.storage_path();
        let Some((mut record, version)) = self.load(&path).await? else {
            return Ok(false);
        };
        if record.status != expected {
            return Ok(false);
        }

        record.status = new;
        match self
            .write(
                &path,
                &record,
                WritePrecondition::MatchesVersion(version.as_str().to_string()),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(true),
            WriteResult::PreconditionFailed { .. } => {
                record_cas_conflict("compare_and_set");
                Ok(false)
            }
        }
    }

    /// Claims `key` for the delivery `claimant`.
    ///
    /// Creates the record on first sight. `Pending`, `Failed` and `Granted`
    /// records are claimed directly; a stale `InProgress` record is taken
    /// over; a fresh one is reported as held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails, the stored record is unreadable,
    /// or conditional writes keep losing.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    pub async fn claim(
        &self,
        key: &GrantKey,
        request_id: Option<&str>,
        claimant: &str,
    ) -> Result<ClaimOutcome> {
        let path = key.storage_path();
        let (mut record, mut version) = self.get_or_create(key, request_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let previous = record.status;
            let took_over = match previous {
                GrantStatus::Tombstoned => {
                    record_claim("tombstoned");
                    return Ok(ClaimOutcome::Tombstoned);
                }
                GrantStatus::InProgress if !record.is_stale(self.stale_timeout, now) => {
                    record_claim("in_progress_elsewhere");
                    return Ok(ClaimOutcome::InProgressElsewhere {
                        claimed_at: record.claimed_at,
                    });
                }
                GrantStatus::InProgress => true,
                GrantStatus::Pending | GrantStatus::Granted | GrantStatus::Failed => false,
            };

            let mut claimed = record.clone();
            if claimed.observe_request(request_id) {
                tracing::info!(
                    generation = claimed.generation,
                    "new approval for existing grant key"
                );
            }
            claimed.mark_in_progress(claimant, now);

            match self
                .write(
                    &path,
                    &claimed,
                    WritePrecondition::MatchesVersion(version.as_str().to_string()),
                )
                .await?
            {
                WriteResult::Success { version: new_version } => {
                    if took_over {
                        tracing::warn!(
                            previous_claimant = ?record.claimed_by,
                            claimed_at = ?record.claimed_at,
                            "took over stale grant claim"
                        );
                        record_claim("takeover");
                    } else {
                        record_claim("claimed");
                    }
                    return Ok(ClaimOutcome::Claimed {
                        record: Box::new(claimed),
                        version: RecordVersion::new(new_version),
                        previous,
                        took_over,
                    });
                }
                WriteResult::PreconditionFailed { .. } => {
                    record_cas_conflict("claim");
                    let (current, current_version) =
                        self.load(&path)
                            .await?
                            .ok_or_else(|| LedgerError::InvariantViolation {
                                message: format!("grant record {key} disappeared during claim"),
                            })?;
                    record = current;
                    version = current_version;
                }
            }
        }

        Err(LedgerError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Writes intermediate progress for a claimed record.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record cannot be encoded.
    pub async fn checkpoint(
        &self,
        record: &GrantRecord,
        expected_version: &RecordVersion,
    ) -> Result<FinalizeResult> {
        self.write_versioned("checkpoint", record, expected_version)
            .await
    }

    /// Writes the final state of a claimed record (`Granted` or `Failed`).
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record cannot be encoded.
    pub async fn finalize(
        &self,
        record: &GrantRecord,
        expected_version: &RecordVersion,
    ) -> Result<FinalizeResult> {
        self.write_versioned("finalize", record, expected_version)
            .await
    }

    /// Lists all records, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a stored record is unreadable.
    pub async fn list(&self) -> Result<Vec<GrantRecord>> {
        let prefix = format!("{GRANTS_PREFIX}/");
        let metas = self
            .storage
            .list(&prefix)
            .await
            .map_err(|e| LedgerError::storage("failed to list grant records", e))?;

        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some((record, _)) = self.load(&meta.path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Retires the record for `key`. Returns false if no record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or conditional writes keep losing.
    pub async fn tombstone(&self, key: &GrantKey) -> Result<bool> {
        let path = key.storage_path();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut record, version)) = self.load(&path).await? else {
                return Ok(false);
            };
            if record.status == GrantStatus::Tombstoned {
                return Ok(true);
            }
            record.mark_tombstoned();
            match self
                .write(
                    &path,
                    &record,
                    WritePrecondition::MatchesVersion(version.as_str().to_string()),
                )
                .await?
            {
                WriteResult::Success { .. } => {
                    tracing::info!(key = %key, "tombstoned grant record");
                    return Ok(true);
                }
                WriteResult::PreconditionFailed { .. } => record_cas_conflict("tombstone"),
            }
        }
        Err(LedgerError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn write_versioned(
        &self,
        operation: &str,
        record: &GrantRecord,
        expected_version: &RecordVersion,
    ) -> Result<FinalizeResult> {
        let precondition = WritePrecondition::MatchesVersion(expected_version.as_str().to_string());
        match self
            .write(&record.key.storage_path(), record, precondition)
            .await?
        {
            WriteResult::Success { version } => Ok(FinalizeResult::Success {
                version: RecordVersion::new(version),
            }),
            WriteResult::PreconditionFailed { current_version } => {
                record_cas_conflict(operation);
                Ok(FinalizeResult::Conflict {
                    current_version: RecordVersion::new(current_version),
                })
            }
        }
    }

    async fn write(
        &self,
        path: &str,
        record: &GrantRecord,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let bytes = serde_json::to_vec(record).map_err(|e| LedgerError::Serialization {
            message: format!("failed to serialize grant record: {e}"),
        })?;
        self.storage
            .put(path, Bytes::from(bytes), precondition)
            .await
            .map_err(|e| LedgerError::storage("failed to write grant record", e))
    }

    async fn load(&self, path: &str) -> Result<Option<(GrantRecord, RecordVersion)>> {
        let meta = self
            .storage
            .head(path)
            .await
            .map_err(|e| LedgerError::storage("failed to check grant record", e))?;

        let Some(meta) = meta else {
            return Ok(None);
        };

        let bytes = self
            .storage
            .get(path)
            .await
            .map_err(|e| LedgerError::storage("failed to read grant record", e))?;

        let record: GrantRecord =
            serde_json::from_slice(&bytes).map_err(|e| LedgerError::Serialization {
                message: format!("failed to parse grant record at {path}: {e}"),
            })?;

        Ok(Some((record, RecordVersion::new(meta.version))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GrantStep;
    use lakeshare_core::{AssetRef, MemoryBackend};

    fn key() -> GrantKey {
        GrantKey::new(
            "arn:aws:iam::222222222222:role/consumer".parse().unwrap(),
            &AssetRef::new("sales", "orders"),
        )
    }

    fn ledger() -> GrantLedger<MemoryBackend> {
        GrantLedger::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let ledger = ledger();
        let (first, v1) = ledger.get_or_create(&key(), Some("req-1")).await.expect("create");
        let (second, v2) = ledger.get_or_create(&key(), Some("req-2")).await.expect("load");

        assert_eq!(first.status, GrantStatus::Pending);
        assert_eq!(first, second);
        assert_eq!(v1, v2);
        assert_eq!(ledger.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let ledger = ledger();
        ledger.get_or_create(&key(), None).await.expect("create");

        assert!(
            ledger
                .compare_and_set(&key(), GrantStatus::Pending, GrantStatus::InProgress)
                .await
                .expect("cas")
        );
        assert!(
            !ledger
                .compare_and_set(&key(), GrantStatus::Pending, GrantStatus::InProgress)
                .await
                .expect("cas")
        );
        let (record, _) = ledger.get(&key()).await.expect("get").expect("exists");
        assert_eq!(record.status, GrantStatus::InProgress);
    }

    #[tokio::test]
    async fn test_compare_and_set_on_missing_key() {
        let ledger = ledger();
        assert!(
            !ledger
                .compare_and_set(&key(), GrantStatus::Pending, GrantStatus::Granted)
                .await
                .expect("cas")
        );
        assert!(ledger.get(&key()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_claim_then_finalize() {
        let ledger = ledger();
        let ClaimOutcome::Claimed {
            mut record,
            version,
            previous,
            took_over,
        } = ledger.claim(&key(), Some("req-1"), "evt-1").await.expect("claim")
        else {
            panic!("expected claim");
        };
        assert_eq!(previous, GrantStatus::Pending);
        assert!(!took_over);
        assert_eq!(record.claimed_by.as_deref(), Some("evt-1"));

        record.mark_granted(Utc::now());
        let result = ledger.finalize(&record, &version).await.expect("finalize");
        assert!(result.is_success());

        let (stored, _) = ledger.get(&key()).await.expect("get").expect("exists");
        assert_eq!(stored.status, GrantStatus::Granted);
    }

    #[tokio::test]
    async fn test_second_claim_sees_in_progress() {
        let ledger = ledger();
        let first = ledger.claim(&key(), None, "evt-1").await.expect("claim");
        assert!(matches!(first, ClaimOutcome::Claimed { .. }));

        let second = ledger.claim(&key(), None, "evt-2").await.expect("claim");
        assert!(matches!(second, ClaimOutcome::InProgressElsewhere { .. }));
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let ledger = ledger();
        let ClaimOutcome::Claimed {
            mut record,
            version,
            ..
        } = ledger.claim(&key(), None, "evt-1").await.expect("claim")
        else {
            panic!("expected claim");
        };

        record.claimed_at = Some(Utc::now() - Duration::minutes(10));
        ledger.checkpoint(&record, &version).await.expect("age claim");

        let ClaimOutcome::Claimed {
            record, took_over, ..
        } = ledger.claim(&key(), None, "evt-2").await.expect("claim")
        else {
            panic!("stale claim should be taken over");
        };
        assert!(took_over);
        assert_eq!(record.claimed_by.as_deref(), Some("evt-2"));
    }

    #[tokio::test]
    async fn test_finalize_with_lost_claim_conflicts() {
        let ledger = ledger().with_stale_timeout(Duration::seconds(0));
        let ClaimOutcome::Claimed {
            mut record,
            version,
            ..
        } = ledger.claim(&key(), None, "evt-1").await.expect("claim")
        else {
            panic!("expected claim");
        };

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let taken = ledger.claim(&key(), None, "evt-2").await.expect("claim");
        assert!(matches!(taken, ClaimOutcome::Claimed { took_over: true, .. }));

        record.mark_failed(GrantStep::Share, "transient: throttled");
        let result = ledger.finalize(&record, &version).await.expect("finalize");
        assert!(matches!(result, FinalizeResult::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_failed_record_is_reclaimed_with_new_generation() {
        let ledger = ledger();
        let ClaimOutcome::Claimed {
            mut record,
            version,
            ..
        } = ledger.claim(&key(), Some("req-1"), "evt-1").await.expect("claim")
        else {
            panic!("expected claim");
        };
        record.mark_failed(GrantStep::Permissions, "permission_denied: not an admin");
        ledger.finalize(&record, &version).await.expect("finalize");

        let ClaimOutcome::Claimed {
            record, previous, ..
        } = ledger.claim(&key(), Some("req-2"), "evt-2").await.expect("claim")
        else {
            panic!("failed record should be reclaimable");
        };
        assert_eq!(previous, GrantStatus::Failed);
        assert_eq!(record.generation, 2);
        assert_eq!(record.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_reordered_redelivery_keeps_generation() {
        let ledger = ledger();
        for (request_id, claimant) in [("req-1", "evt-1"), ("req-2", "evt-2"), ("req-1", "evt-3")] {
            let ClaimOutcome::Claimed {
                mut record,
                version,
                ..
            } = ledger
                .claim(&key(), Some(request_id), claimant)
                .await
                .expect("claim")
            else {
                panic!("expected claim for {request_id}");
            };
            record.mark_granted(Utc::now());
            let result = ledger.finalize(&record, &version).await.expect("finalize");
            assert!(result.is_success());
        }

        let (stored, _) = ledger.get(&key()).await.expect("get").expect("exists");
        assert_eq!(stored.generation, 2);
        assert_eq!(stored.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_tombstone_blocks_claims() {
        let ledger = ledger();
        assert!(!ledger.tombstone(&key()).await.expect("tombstone"));

        ledger.get_or_create(&key(), None).await.expect("create");
        assert!(ledger.tombstone(&key()).await.expect("tombstone"));
        assert!(ledger.tombstone(&key()).await.expect("tombstone again"));

        let outcome = ledger.claim(&key(), None, "evt-1").await.expect("claim");
        assert!(matches!(outcome, ClaimOutcome::Tombstoned));
        assert_eq!(ledger.list().await.expect("list").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.claim(&key(), Some("req-1"), &format!("evt-{i}")).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.expect("join").expect("claim") {
                ClaimOutcome::Claimed { .. } => winners += 1,
                ClaimOutcome::InProgressElsewhere { .. } => {}
                ClaimOutcome::Tombstoned => panic!("unexpected tombstone"),
            }
        }
        assert_eq!(winners, 1);
    }
}
