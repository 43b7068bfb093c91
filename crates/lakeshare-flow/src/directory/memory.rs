//! In-memory directory for testing and simulation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use lakeshare_core::{Error, Result};

use super::{DirectoryClient, EnvironmentInfo, ListingInfo};

#[derive(Debug, Default)]
struct DirectoryState {
    listings: BTreeMap<String, ListingInfo>,
    environments: BTreeMap<String, EnvironmentInfo>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("directory lock poisoned")
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
    fail_next: AtomicU32,
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_listing(&self, listing: ListingInfo) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.listings.insert(listing.listing_id.clone(), listing);
        drop(state);
        Ok(())
    }

    /// Adds or replaces an environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_environment(&self, environment: EnvironmentInfo) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .environments
            .insert(environment.environment_id.clone(), environment);
        drop(state);
        Ok(())
    }

    /// Removes a listing (simulates deletion after approval).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn remove_listing(&self, listing_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.listings.remove(listing_id);
        drop(state);
        Ok(())
    }

    /// Makes the next `count` lookups fail with a transient error.
    pub fn fail_next_lookups(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn check_injected(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transient("injected directory failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn resolve_listing(&self, domain_id: &str, listing_id: &str) -> Result<ListingInfo> {
        self.check_injected()?;
        let state = self.state.read().map_err(poison_err)?;
        state
            .listings
            .get(listing_id)
            .filter(|l| l.domain_id == domain_id)
            .cloned()
            .ok_or_else(|| Error::not_found("listing", listing_id))
    }

    async fn get_environment(
        &self,
        domain_id: &str,
        environment_id: &str,
    ) -> Result<EnvironmentInfo> {
        self.check_injected()?;
        let state = self.state.read().map_err(poison_err)?;
        state
            .environments
            .get(environment_id)
            .filter(|e| e.domain_id == domain_id)
            .cloned()
            .ok_or_else(|| Error::not_found("environment", environment_id))
    }

    async fn list_environments(&self, domain_id: &str) -> Result<Vec<EnvironmentInfo>> {
        self.check_injected()?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .environments
            .values()
            .filter(|e| e.domain_id == domain_id)
            .cloned()
            .collect())
    }
}
