//! Test storage implementations with operation tracing.
//!
//! Provides in-memory ledger storage that records every operation and can
//! inject failures or CAS races for test assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use lakeshare_core::error::{Error, Result};
use lakeshare_core::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the precondition held.
        applied: bool,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Returns the operation name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Head { .. } => "head",
            Self::Put { .. } => "put",
            Self::List { .. } => "list",
        }
    }

    /// Returns the path or prefix the operation touched.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path } | Self::Head { path } | Self::Put { path, .. } => path,
            Self::List { prefix } => prefix,
        }
    }

    /// Returns true for a conditional write that lost its race.
    pub const fn is_rejected_write(&self) -> bool {
        matches!(self, Self::Put { applied: false, .. })
    }
}

/// In-memory storage backend with operation tracing.
///
/// Records all operations for later assertion in tests.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    data: Arc<Mutex<HashMap<String, StoredObject>>>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with simulated latency, widening race windows.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the number of conditional writes that lost their race.
    #[must_use]
    pub fn rejected_writes(&self) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|op| op.is_rejected_write())
            .count()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Injects a failure for the given path prefix.
    pub fn inject_failure(&self, path: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(path.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    /// Returns the current version for a path (for CAS testing).
    #[must_use]
    pub fn version(&self, path: &str) -> Option<String> {
        self.data
            .lock()
            .expect("lock")
            .get(path)
            .map(|o| o.version.to_string())
    }

    /// Returns the raw document stored at a path.
    #[must_use]
    pub fn document(&self, path: &str) -> Option<Bytes> {
        self.data
            .lock()
            .expect("lock")
            .get(path)
            .map(|o| o.data.clone())
    }

    /// Overwrites a document without a precondition, bumping its version.
    ///
    /// Simulates a concurrent writer sneaking in between a read and a CAS.
    pub fn overwrite(&self, path: &str, data: impl Into<Bytes>) {
        let mut store = self.data.lock().expect("lock");
        let version = store.get(path).map_or(1, |o| o.version + 1);
        store.insert(
            path.to_string(),
            StoredObject {
                data: data.into(),
                version,
                last_modified: Utc::now(),
            },
        );
    }

    /// Returns all stored paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.data.lock().expect("lock").keys().cloned().collect();
        paths.sort();
        paths
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.starts_with(p)) {
            return Err(Error::transient(format!("injected failure for path: {path}")));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });

        let data = self.data.lock().expect("lock");
        data.get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found("object", path))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_failure(path)?;

        let size = data.len();
        let mut store = self.data.lock().expect("lock");
        let existing = store.get(path);

        let rejected = match (&precondition, existing) {
            (WritePrecondition::None, _) | (WritePrecondition::DoesNotExist, None) => None,
            (WritePrecondition::DoesNotExist, Some(obj)) => Some(obj.version.to_string()),
            (WritePrecondition::MatchesVersion(expected), Some(obj)) => {
                (obj.version.to_string() != *expected).then(|| obj.version.to_string())
            }
            (WritePrecondition::MatchesVersion(_), None) => Some("0".to_string()),
        };

        self.record(StorageOp::Put {
            path: path.to_string(),
            size,
            precondition,
            applied: rejected.is_none(),
        });

        if let Some(current_version) = rejected {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let new_version = existing.map_or(1, |o| o.version + 1);
        store.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });

        let data = self.data.lock().expect("lock");
        Ok(data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| v.meta(k))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });

        let data = self.data.lock().expect("lock");
        Ok(data.get(path).map(|o| o.meta(path)))
    }
}
