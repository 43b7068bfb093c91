//! References to catalog table assets.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::id::AccountId;

/// A `(catalog, database, table)` triple naming a table asset.
///
/// The catalog is optional on the wire; when absent the asset lives in the
/// catalog of the account handling the grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    /// Owning catalog (account id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<AccountId>,
    /// Database name.
    #[serde(alias = "db")]
    pub database: String,
    /// Table name.
    pub table: String,
}

impl AssetRef {
    /// Creates a reference without an explicit catalog.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            catalog_id: None,
            database: database.into(),
            table: table.into(),
        }
    }

    /// Sets the owning catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog_id: AccountId) -> Self {
        self.catalog_id = Some(catalog_id);
        self
    }

    /// Returns the stable name used as the ledger's asset key.
    ///
    /// `database.table`, prefixed with `catalog.` when the catalog is explicit.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.catalog_id {
            Some(catalog) => format!("{catalog}.{}.{}", self.database, self.table),
            None => format!("{}.{}", self.database, self.table),
        }
    }

    /// Returns the catalog, falling back to the given local account.
    #[must_use]
    pub fn catalog_or<'a>(&'a self, local: &'a AccountId) -> &'a AccountId {
        self.catalog_id.as_ref().unwrap_or(local)
    }

    /// Validates database and table names.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a name is empty or contains characters
    /// that would make the qualified name ambiguous.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("database", &self.database), ("table", &self.table)] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("asset {field} must be non-empty")));
            }
            if value.contains('.') || value.chars().any(char::is_whitespace) {
                return Err(Error::InvalidInput(format!(
                    "asset {field} '{value}' must not contain dots or whitespace"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_without_catalog() {
        assert_eq!(AssetRef::new("sales", "orders").qualified_name(), "sales.orders");
    }

    #[test]
    fn qualified_name_with_catalog() {
        let asset =
            AssetRef::new("sales", "orders").with_catalog("111111111111".parse().unwrap());
        assert_eq!(asset.qualified_name(), "111111111111.sales.orders");
    }

    #[test]
    fn accepts_db_alias() {
        let asset: AssetRef = serde_json::from_str(r#"{"db":"sales","table":"orders"}"#).unwrap();
        assert_eq!(asset, AssetRef::new("sales", "orders"));
    }

    #[test]
    fn validate_rejects_dotted_names() {
        assert!(AssetRef::new("sales", "orders").validate().is_ok());
        assert!(AssetRef::new("sa.les", "orders").validate().is_err());
        assert!(AssetRef::new("sales", "").validate().is_err());
        assert!(AssetRef::new("sales", "or ders").validate().is_err());
    }
}
