//! Resource-level publish allow-list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use lakeshare_core::AccountId;

/// Accounts allowed to publish onto a bus.
///
/// The owning account is always allowed; other accounts must be listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPolicy {
    owner: AccountId,
    allowed: BTreeSet<AccountId>,
}

impl PublishPolicy {
    /// Creates a policy that only allows the owner.
    #[must_use]
    pub fn owner_only(owner: AccountId) -> Self {
        Self {
            owner,
            allowed: BTreeSet::new(),
        }
    }

    /// Allows an additional account.
    #[must_use]
    pub fn allow(mut self, account: AccountId) -> Self {
        self.insert(account);
        self
    }

    /// Allows an additional account in place.
    pub fn insert(&mut self, account: AccountId) {
        if account != self.owner {
            self.allowed.insert(account);
        }
    }

    /// Returns true if `publisher` may publish.
    #[must_use]
    pub fn permits(&self, publisher: &AccountId) -> bool {
        *publisher == self.owner || self.allowed.contains(publisher)
    }

    /// Returns the owning account.
    #[must_use]
    pub fn owner(&self) -> &AccountId {
        &self.owner
    }

    /// Returns every allowed account, owner first.
    #[must_use]
    pub fn principals(&self) -> Vec<&AccountId> {
        std::iter::once(&self.owner)
            .chain(self.allowed.iter())
            .collect()
    }
}
