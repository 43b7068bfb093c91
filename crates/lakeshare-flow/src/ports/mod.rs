//! Collaborator ports used by the grant handler and admin bootstrap.
//!
//! This module provides:
//!
//! - [`DataCatalog`]: databases and resource-link tables
//! - [`LakePermissions`]: data-lake permission grants
//! - [`ResourceShares`]: cross-account resource shares
//! - [`IdentityDirectory`]: role existence and managed policy attachment
//! - [`LakeSettings`]: the account's data-lake administrator list
//! - [`memory::InMemoryAccount`]: one in-memory account implementing all of them
//!
//! Every port is `Send + Sync` and returns [`lakeshare_core::Result`]. Creation
//! calls report a duplicate with `Error::AlreadyExists`; callers treat that as
//! already satisfied.

pub mod memory;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lakeshare_core::{AccountId, PrincipalArn, Region, Result};

/// Prefix every resource share name must carry.
pub const SHARE_NAME_PREFIX: &str = "LakeFormation";

/// Data-lake permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Every permission on the resource.
    All,
    /// Read metadata.
    Describe,
    /// Read data.
    Select,
}

impl Permission {
    /// Read access on a table.
    pub const READ: [Self; 2] = [Self::Describe, Self::Select];
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "ALL",
            Self::Describe => "DESCRIBE",
            Self::Select => "SELECT",
        })
    }
}

/// A catalog resource permissions attach to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LakeResource {
    /// A database.
    Database {
        /// Owning catalog.
        catalog_id: AccountId,
        /// Database name.
        name: String,
    },
    /// A table.
    Table {
        /// Owning catalog.
        catalog_id: AccountId,
        /// Database name.
        database: String,
        /// Table name.
        name: String,
    },
}

impl fmt::Display for LakeResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { catalog_id, name } => write!(f, "{catalog_id}:{name}"),
            Self::Table {
                catalog_id,
                database,
                name,
            } => write!(f, "{catalog_id}:{database}.{name}"),
        }
    }
}

/// Target of a resource-link table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkTarget {
    /// Catalog owning the target table.
    pub catalog_id: AccountId,
    /// Target database.
    pub database: String,
    /// Target table.
    pub table: String,
    /// Region of the target catalog.
    pub region: Region,
}

/// A catalog table. Resource links carry a target, virtual views carry their
/// original text; physical tables carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Link target, for resource-link tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<LinkTarget>,
    /// Original view text (`/* Presto View: <base64> */`), for virtual views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_text: Option<String>,
}

impl TableInfo {
    /// A physical table.
    #[must_use]
    pub fn physical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            view_text: None,
        }
    }

    /// A resource link to `target`.
    #[must_use]
    pub fn link(name: impl Into<String>, target: LinkTarget) -> Self {
        Self {
            name: name.into(),
            target: Some(target),
            view_text: None,
        }
    }

    /// A virtual view with its original text.
    #[must_use]
    pub fn view(name: impl Into<String>, view_text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            view_text: Some(view_text.into()),
        }
    }

    /// Returns true for virtual views.
    #[must_use]
    pub fn is_view(&self) -> bool {
        self.view_text.is_some()
    }
}

/// A resource share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    /// Share identifier.
    pub share_id: String,
    /// Share name.
    pub name: String,
    /// Shared resource.
    pub resource: LakeResource,
    /// Associated principals.
    #[serde(default)]
    pub principals: BTreeSet<String>,
}

/// Catalog databases and tables.
#[async_trait]
pub trait DataCatalog: Send + Sync {
    /// Returns true if the database exists.
    async fn get_database(&self, catalog_id: &AccountId, name: &str) -> Result<bool>;

    /// Creates a database.
    async fn create_database(&self, catalog_id: &AccountId, name: &str) -> Result<()>;

    /// Returns the table, if it exists.
    async fn get_table(
        &self,
        catalog_id: &AccountId,
        database: &str,
        name: &str,
    ) -> Result<Option<TableInfo>>;

    /// Creates a table.
    async fn create_table(
        &self,
        catalog_id: &AccountId,
        database: &str,
        table: &TableInfo,
    ) -> Result<()>;
}

/// Data-lake permissions.
#[async_trait]
pub trait LakePermissions: Send + Sync {
    /// Lists the permissions `principal` holds on `resource`.
    async fn list_permissions(
        &self,
        principal: &PrincipalArn,
        resource: &LakeResource,
    ) -> Result<BTreeSet<Permission>>;

    /// Grants `permissions` on `resource` to `principal`. Additive.
    async fn grant_permissions(
        &self,
        principal: &PrincipalArn,
        resource: &LakeResource,
        permissions: &BTreeSet<Permission>,
    ) -> Result<()>;
}

/// Cross-account resource shares.
#[async_trait]
pub trait ResourceShares: Send + Sync {
    /// Returns the share with this id, if it still exists.
    async fn get_share(&self, share_id: &str) -> Result<Option<ShareInfo>>;

    /// Returns the share with this name, if any.
    async fn find_share_by_name(&self, name: &str) -> Result<Option<ShareInfo>>;

    /// Creates a share for `resource`.
    async fn create_share(&self, name: &str, resource: &LakeResource) -> Result<ShareInfo>;

    /// Associates `principal` with the share. Additive.
    async fn associate(&self, share_id: &str, principal: &PrincipalArn) -> Result<()>;
}

/// Identity directory (roles and managed policies).
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Returns true if a role with this name exists.
    async fn role_exists(&self, role_name: &str) -> Result<bool>;

    /// Lists the managed policies attached to a role.
    async fn list_attached_policies(&self, role_name: &str) -> Result<Vec<String>>;

    /// Attaches a managed policy to a role.
    async fn attach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;
}

/// The account's data-lake administrator list.
#[async_trait]
pub trait LakeSettings: Send + Sync {
    /// Reads the current administrators.
    async fn get_admins(&self, catalog_id: &AccountId) -> Result<Vec<PrincipalArn>>;

    /// Replaces the administrators.
    async fn put_admins(&self, catalog_id: &AccountId, admins: &[PrincipalArn]) -> Result<()>;
}

/// Returns the share name used for a table resource:
/// `LakeFormation-<catalog>-<database>-<table>`.
#[must_use]
pub fn share_name(catalog_id: &AccountId, database: &str, table: &str) -> String {
    format!("{SHARE_NAME_PREFIX}-{catalog_id}-{database}-{table}")
}
