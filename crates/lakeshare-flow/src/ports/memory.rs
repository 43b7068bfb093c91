//! In-memory account implementing every collaborator port.
//!
//! [`InMemoryAccount`] models the services of a single cloud account: catalog,
//! lake permissions, resource shares, identity directory and lake settings.
//! Every call is counted, and failures can be injected per call so that tests
//! can stop a grant sequence at any step.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence
//! - **Single account**: Catalog ids are recorded but not enforced

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use lakeshare_core::{AccountId, Error, ErrorClass, PrincipalArn, Result};

use super::{
    DataCatalog, IdentityDirectory, LakePermissions, LakeResource, LakeSettings, Permission,
    ResourceShares, SHARE_NAME_PREFIX, ShareInfo, TableInfo,
};

/// A port call, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Call {
    GetDatabase,
    CreateDatabase,
    GetTable,
    CreateTable,
    ListPermissions,
    GrantPermissions,
    GetShare,
    FindShareByName,
    CreateShare,
    Associate,
    RoleExists,
    ListAttachedPolicies,
    AttachPolicy,
    GetAdmins,
    PutAdmins,
}

impl Call {
    /// Returns the call name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetDatabase => "get_database",
            Self::CreateDatabase => "create_database",
            Self::GetTable => "get_table",
            Self::CreateTable => "create_table",
            Self::ListPermissions => "list_permissions",
            Self::GrantPermissions => "grant_permissions",
            Self::GetShare => "get_share",
            Self::FindShareByName => "find_share_by_name",
            Self::CreateShare => "create_share",
            Self::Associate => "associate",
            Self::RoleExists => "role_exists",
            Self::ListAttachedPolicies => "list_attached_policies",
            Self::AttachPolicy => "attach_policy",
            Self::GetAdmins => "get_admins",
            Self::PutAdmins => "put_admins",
        }
    }
}

type TableKey = (AccountId, String, String);

#[derive(Debug, Default)]
struct AccountState {
    databases: BTreeSet<(AccountId, String)>,
    tables: HashMap<TableKey, TableInfo>,
    permissions: HashMap<(PrincipalArn, LakeResource), BTreeSet<Permission>>,
    shares: BTreeMap<String, ShareInfo>,
    next_share: u64,
    roles: BTreeMap<String, Vec<String>>,
    admins: Vec<PrincipalArn>,
    calls: HashMap<Call, usize>,
    failures: HashMap<Call, (ErrorClass, u32)>,
    clobber_admins: Option<Vec<PrincipalArn>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("in-memory account lock poisoned")
}

fn injected(call: Call, class: ErrorClass) -> Error {
    let message = format!("injected {class} failure in {}", call.as_str());
    match class {
        ErrorClass::Transient => Error::transient(message),
        ErrorClass::NotFound => Error::not_found("injected", call.as_str()),
        ErrorClass::Conflict => Error::conflict(message),
        ErrorClass::PermissionDenied => Error::permission_denied(message),
        ErrorClass::Invalid => Error::InvalidInput(message),
    }
}

/// In-memory account.
///
/// ## Example
///
/// ```rust
/// use lakeshare_flow::ports::memory::{Call, InMemoryAccount};
///
/// let account = InMemoryAccount::new("222222222222".parse().unwrap());
/// account.add_role("consumer").unwrap();
/// assert_eq!(account.calls(Call::CreateShare), 0);
/// ```
#[derive(Debug)]
pub struct InMemoryAccount {
    account_id: AccountId,
    state: RwLock<AccountState>,
}

impl InMemoryAccount {
    /// Creates an empty account.
    #[must_use]
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            state: RwLock::new(AccountState::default()),
        }
    }

    /// Returns the account id.
    #[must_use]
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn begin(&self, call: Call) -> Result<RwLockWriteGuard<'_, AccountState>> {
        let mut state = self.state.write().map_err(poison_err)?;
        *state.calls.entry(call).or_default() += 1;
        if let Some((class, remaining)) = state.failures.get_mut(&call) {
            if *remaining > 0 {
                *remaining -= 1;
                let class = *class;
                return Err(injected(call, class));
            }
        }
        Ok(state)
    }

    /// Makes the next `times` invocations of `call` fail with an error of `class`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail(&self, call: Call, class: ErrorClass, times: u32) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.failures.insert(call, (class, times));
        drop(state);
        Ok(())
    }

    /// Clears every injected failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear_failures(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.failures.clear();
        drop(state);
        Ok(())
    }

    /// Returns how many times `call` was invoked (including injected failures).
    #[must_use]
    pub fn calls(&self, call: Call) -> usize {
        self.state
            .read()
            .map(|s| s.calls.get(&call).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Creates a role with no attached policies.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_role(&self, role_name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.roles.entry(role_name.to_string()).or_default();
        drop(state);
        Ok(())
    }

    /// Creates a database directly (setup helper, not counted).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_database(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.databases.insert((self.account_id.clone(), name.to_string()));
        drop(state);
        Ok(())
    }

    /// Creates a table directly (setup helper, not counted).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_table(&self, database: &str, table: TableInfo) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.tables.insert(
            (self.account_id.clone(), database.to_string(), table.name.clone()),
            table,
        );
        drop(state);
        Ok(())
    }

    /// Replaces the administrator list directly (setup helper, not counted).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_admins(&self, admins: Vec<PrincipalArn>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.admins = admins;
        drop(state);
        Ok(())
    }

    /// Simulates an out-of-band writer: right after the next successful
    /// `put_admins`, the list is overwritten with `admins`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clobber_admins_after_next_put(&self, admins: Vec<PrincipalArn>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.clobber_admins = Some(admins);
        drop(state);
        Ok(())
    }

    /// Returns the current administrators.
    #[must_use]
    pub fn admins(&self) -> Vec<PrincipalArn> {
        self.state
            .read()
            .map(|s| s.admins.clone())
            .unwrap_or_default()
    }

    /// Returns true if the database exists.
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool {
        self.state
            .read()
            .is_ok_and(|s| s.databases.contains(&(self.account_id.clone(), name.to_string())))
    }

    /// Returns a table, if it exists.
    #[must_use]
    pub fn table(&self, database: &str, name: &str) -> Option<TableInfo> {
        self.state.read().ok().and_then(|s| {
            s.tables
                .get(&(self.account_id.clone(), database.to_string(), name.to_string()))
                .cloned()
        })
    }

    /// Returns the permissions `principal` holds on `resource`.
    #[must_use]
    pub fn permissions(&self, principal: &PrincipalArn, resource: &LakeResource) -> BTreeSet<Permission> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.permissions.get(&(principal.clone(), resource.clone())).cloned())
            .unwrap_or_default()
    }

    /// Returns every share.
    #[must_use]
    pub fn shares(&self) -> Vec<ShareInfo> {
        self.state
            .read()
            .map(|s| s.shares.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the policies attached to a role.
    #[must_use]
    pub fn attached_policies(&self, role_name: &str) -> Vec<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.roles.get(role_name).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataCatalog for InMemoryAccount {
    async fn get_database(&self, catalog_id: &AccountId, name: &str) -> Result<bool> {
        let state = self.begin(Call::GetDatabase)?;
        Ok(state
            .databases
            .contains(&(catalog_id.clone(), name.to_string())))
    }

    async fn create_database(&self, catalog_id: &AccountId, name: &str) -> Result<()> {
        let mut state = self.begin(Call::CreateDatabase)?;
        if !state.databases.insert((catalog_id.clone(), name.to_string())) {
            return Err(Error::already_exists("database", name));
        }
        Ok(())
    }

    async fn get_table(
        &self,
        catalog_id: &AccountId,
        database: &str,
        name: &str,
    ) -> Result<Option<TableInfo>> {
        let state = self.begin(Call::GetTable)?;
        Ok(state
            .tables
            .get(&(catalog_id.clone(), database.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_table(
        &self,
        catalog_id: &AccountId,
        database: &str,
        table: &TableInfo,
    ) -> Result<()> {
        let mut state = self.begin(Call::CreateTable)?;
        if !state
            .databases
            .contains(&(catalog_id.clone(), database.to_string()))
        {
            return Err(Error::not_found("database", database));
        }
        let key = (catalog_id.clone(), database.to_string(), table.name.clone());
        if state.tables.contains_key(&key) {
            return Err(Error::already_exists(
                "table",
                format!("{database}.{}", table.name),
            ));
        }
        state.tables.insert(key, table.clone());
        Ok(())
    }
}

#[async_trait]
impl LakePermissions for InMemoryAccount {
    async fn list_permissions(
        &self,
        principal: &PrincipalArn,
        resource: &LakeResource,
    ) -> Result<BTreeSet<Permission>> {
        let state = self.begin(Call::ListPermissions)?;
        Ok(state
            .permissions
            .get(&(principal.clone(), resource.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn grant_permissions(
        &self,
        principal: &PrincipalArn,
        resource: &LakeResource,
        permissions: &BTreeSet<Permission>,
    ) -> Result<()> {
        let mut state = self.begin(Call::GrantPermissions)?;
        state
            .permissions
            .entry((principal.clone(), resource.clone()))
            .or_default()
            .extend(permissions.iter().copied());
        Ok(())
    }
}

#[async_trait]
impl ResourceShares for InMemoryAccount {
    async fn get_share(&self, share_id: &str) -> Result<Option<ShareInfo>> {
        let state = self.begin(Call::GetShare)?;
        Ok(state.shares.get(share_id).cloned())
    }

    async fn find_share_by_name(&self, name: &str) -> Result<Option<ShareInfo>> {
        let state = self.begin(Call::FindShareByName)?;
        Ok(state.shares.values().find(|s| s.name == name).cloned())
    }

    async fn create_share(&self, name: &str, resource: &LakeResource) -> Result<ShareInfo> {
        let mut state = self.begin(Call::CreateShare)?;
        if !name.starts_with(SHARE_NAME_PREFIX) {
            return Err(Error::permission_denied(format!(
                "share names must start with {SHARE_NAME_PREFIX}, got {name}"
            )));
        }
        if state.shares.values().any(|s| s.name == name) {
            return Err(Error::already_exists("resource share", name));
        }
        state.next_share += 1;
        let share = ShareInfo {
            share_id: format!("share-{:04}", state.next_share),
            name: name.to_string(),
            resource: resource.clone(),
            principals: BTreeSet::new(),
        };
        state.shares.insert(share.share_id.clone(), share.clone());
        Ok(share)
    }

    async fn associate(&self, share_id: &str, principal: &PrincipalArn) -> Result<()> {
        let mut state = self.begin(Call::Associate)?;
        let share = state
            .shares
            .get_mut(share_id)
            .ok_or_else(|| Error::not_found("resource share", share_id))?;
        share.principals.insert(principal.to_string());
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryAccount {
    async fn role_exists(&self, role_name: &str) -> Result<bool> {
        let state = self.begin(Call::RoleExists)?;
        Ok(state.roles.contains_key(role_name))
    }

    async fn list_attached_policies(&self, role_name: &str) -> Result<Vec<String>> {
        let state = self.begin(Call::ListAttachedPolicies)?;
        state
            .roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| Error::not_found("role", role_name))
    }

    async fn attach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        let mut state = self.begin(Call::AttachPolicy)?;
        let policies = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::not_found("role", role_name))?;
        if !policies.iter().any(|p| p == policy_arn) {
            policies.push(policy_arn.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl LakeSettings for InMemoryAccount {
    async fn get_admins(&self, _catalog_id: &AccountId) -> Result<Vec<PrincipalArn>> {
        let state = self.begin(Call::GetAdmins)?;
        Ok(state.admins.clone())
    }

    async fn put_admins(&self, _catalog_id: &AccountId, admins: &[PrincipalArn]) -> Result<()> {
        let mut state = self.begin(Call::PutAdmins)?;
        state.admins = admins.to_vec();
        if let Some(clobbered) = state.clobber_admins.take() {
            state.admins = clobbered;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> InMemoryAccount {
        InMemoryAccount::new("222222222222".parse().unwrap())
    }

    fn principal() -> PrincipalArn {
        "arn:aws:iam::222222222222:role/consumer".parse().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_creates_report_already_exists() {
        let account = account();
        let catalog = account.account_id().clone();
        account.create_database(&catalog, "consumer_db").await.expect("create");
        let err = account
            .create_database(&catalog, "consumer_db")
            .await
            .expect_err("duplicate");
        assert!(err.is_already_exists());
        assert_eq!(account.calls(Call::CreateDatabase), 2);
    }

    #[tokio::test]
    async fn test_share_names_are_restricted() {
        let account = account();
        let resource = LakeResource::Database {
            catalog_id: account.account_id().clone(),
            name: "sales".into(),
        };
        let err = account
            .create_share("other-share", &resource)
            .await
            .expect_err("restricted");
        assert_eq!(err.class(), ErrorClass::PermissionDenied);

        let share = account
            .create_share("LakeFormation-x", &resource)
            .await
            .expect("create");
        account.associate(&share.share_id, &principal()).await.expect("associate");
        account.associate(&share.share_id, &principal()).await.expect("associate again");
        assert_eq!(account.shares()[0].principals.len(), 1);
    }

    #[tokio::test]
    async fn test_grants_are_additive() {
        let account = account();
        let resource = LakeResource::Table {
            catalog_id: account.account_id().clone(),
            database: "sales".into(),
            name: "orders".into(),
        };
        account
            .grant_permissions(&principal(), &resource, &BTreeSet::from([Permission::Describe]))
            .await
            .expect("grant");
        account
            .grant_permissions(&principal(), &resource, &BTreeSet::from([Permission::Select]))
            .await
            .expect("grant");
        assert_eq!(
            account.permissions(&principal(), &resource),
            BTreeSet::from([Permission::Describe, Permission::Select])
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted_and_expire() {
        let account = account();
        account.fail(Call::GetAdmins, ErrorClass::Transient, 1).expect("inject");
        let catalog = account.account_id().clone();

        let err = account.get_admins(&catalog).await.expect_err("injected");
        assert!(err.class().is_retryable());
        assert!(account.get_admins(&catalog).await.is_ok());
        assert_eq!(account.calls(Call::GetAdmins), 2);
    }

    #[tokio::test]
    async fn test_clobber_after_put() {
        let account = account();
        let catalog = account.account_id().clone();
        account.clobber_admins_after_next_put(Vec::new()).expect("clobber");
        account.put_admins(&catalog, &[principal()]).await.expect("put");
        assert!(account.admins().is_empty());
        account.put_admins(&catalog, &[principal()]).await.expect("put");
        assert_eq!(account.admins(), vec![principal()]);
    }
}
