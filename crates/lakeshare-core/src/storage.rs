//! Durable key-value storage with conditional writes.
//!
//! This is the persistence contract the grant ledger is built on:
//! - Conditional writes with preconditions (create-only or version match)
//! - Object metadata including a version token and `last_modified`
//! - No delete operation: ledger documents are tombstoned, never removed
//!
//! The version token is an opaque `String` so that backends with different
//! native concurrency tokens (numeric generations, `ETag`s, item versions)
//! can implement the same contract.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for keyed documents.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not met.
    /// Never returns an error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: arbitrary. Callers requiring deterministic order should sort.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`. Uses numeric versions internally (exposed as strings).
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
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

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found("object", path))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}
