//! View dependency analysis.
//!
//! Granting read on a virtual view is not enough to query it: the principal
//! also needs read on every table the view selects from, transitively through
//! nested views. [`ViewResolver`] walks those references through the
//! [`DataCatalog`] port.
//!
//! ## View Text
//!
//! Views store their definition as
//!
//! ```text
//! /* Presto View: <base64 of {"originalSql": "...", ...}> */
//! ```
//!
//! Relations in the decoded SQL resolve against the view's own database
//! when unqualified. A three-part name drops its catalog segment.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::ControlFlow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use sqlparser::ast::{ObjectName, Statement, visit_relations};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use lakeshare_core::{AccountId, Error, Result};

use crate::ports::{DataCatalog, TableInfo};

const VIEW_TEXT_PREFIX: &str = "/* Presto View: ";
const VIEW_TEXT_SUFFIX: &str = " */";

/// A `database.table` pair in the resolver's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    /// Database name.
    pub database: String,
    /// Table or view name.
    pub table: String,
}

impl TableName {
    /// Creates a name.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrestoView {
    original_sql: String,
}

/// Encodes `sql` as stored view text.
#[must_use]
pub fn encode_view_text(sql: &str) -> String {
    let payload = serde_json::json!({ "originalSql": sql }).to_string();
    format!("{VIEW_TEXT_PREFIX}{}{VIEW_TEXT_SUFFIX}", STANDARD.encode(payload))
}

/// Decodes stored view text into the view's SQL.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the text is not an encoded view.
pub fn decode_view_sql(view_text: &str) -> Result<String> {
    let encoded = view_text
        .trim()
        .strip_prefix(VIEW_TEXT_PREFIX)
        .and_then(|rest| rest.strip_suffix(VIEW_TEXT_SUFFIX))
        .ok_or_else(|| Error::InvalidInput("view text is not an encoded view".to_string()))?;
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidInput(format!("view text is not valid base64: {e}")))?;
    let view: PrestoView = serde_json::from_slice(&raw)
        .map_err(|e| Error::InvalidInput(format!("view payload is malformed: {e}")))?;
    Ok(view.original_sql)
}

/// Returns the relations `sql` reads, in first-seen order.
///
/// Common table expression names are not relations.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the SQL does not parse or names a
/// relation with more than three parts.
pub fn referenced_tables(sql: &str, default_database: &str) -> Result<Vec<TableName>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::InvalidInput(format!("failed to parse view SQL: {e}")))?;

    let mut referenced = Vec::new();
    let mut seen = BTreeSet::new();
    let mut err: Option<Error> = None;
    for statement in &statements {
        let mut cte_names = BTreeSet::new();
        if let Statement::Query(query) = statement {
            if let Some(with) = &query.with {
                cte_names.extend(
                    with.cte_tables
                        .iter()
                        .map(|cte| cte.alias.name.value.to_ascii_lowercase()),
                );
            }
        }

        let _ = visit_relations(statement, |relation: &ObjectName| {
            let parts: Vec<String> = relation
                .0
                .iter()
                .map(|ident| ident.value.to_ascii_lowercase())
                .collect();
            let name = match parts.as_slice() {
                [cte] if cte_names.contains(cte) => return ControlFlow::Continue(()),
                [table] => TableName::new(default_database, table.clone()),
                [database, table] | [_, database, table] => {
                    TableName::new(database.clone(), table.clone())
                }
                _ => {
                    err = Some(Error::InvalidInput(format!(
                        "unsupported relation name in view SQL: {relation}"
                    )));
                    return ControlFlow::Break(());
                }
            };
            if seen.insert(name.clone()) {
                referenced.push(name);
            }
            ControlFlow::Continue(())
        });

        if let Some(err) = err.take() {
            return Err(err);
        }
    }
    Ok(referenced)
}

/// Resolves the tables and views a view depends on.
///
/// Lookups are cached for the lifetime of the resolver, so one resolver
/// should serve one grant attempt.
pub struct ViewResolver<'a> {
    catalog: &'a dyn DataCatalog,
    catalog_id: &'a AccountId,
    cache: HashMap<TableName, Option<TableInfo>>,
}

impl fmt::Debug for ViewResolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewResolver")
            .field("catalog_id", &self.catalog_id)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<'a> ViewResolver<'a> {
    /// Creates a resolver over one catalog.
    #[must_use]
    pub fn new(catalog: &'a dyn DataCatalog, catalog_id: &'a AccountId) -> Self {
        Self {
            catalog,
            catalog_id,
            cache: HashMap::new(),
        }
    }

    /// Returns every existing table or view `root` reads from, directly or
    /// through nested views. `root` itself is never included, and a physical
    /// table has no dependencies.
    ///
    /// References that do not exist in the catalog are skipped with a
    /// warning. Reference cycles terminate.
    ///
    /// # Errors
    ///
    /// Returns an error if a catalog lookup fails or a view's text cannot
    /// be decoded and parsed.
    pub async fn dependencies(&mut self, root: &TableName) -> Result<BTreeSet<TableName>> {
        let mut found = BTreeSet::new();
        let mut visited = BTreeSet::from([root.clone()]);
        let mut pending = vec![root.clone()];

        while let Some(current) = pending.pop() {
            let Some(view_text) = self
                .lookup(&current)
                .await?
                .and_then(|table| table.view_text)
            else {
                continue;
            };
            let sql = decode_view_sql(&view_text)?;
            for dependency in referenced_tables(&sql, &current.database)? {
                if !visited.insert(dependency.clone()) {
                    continue;
                }
                if self.lookup(&dependency).await?.is_none() {
                    tracing::warn!(
                        view = %current,
                        dependency = %dependency,
                        "view references a relation missing from the catalog"
                    );
                    continue;
                }
                found.insert(dependency.clone());
                pending.push(dependency);
            }
        }
        Ok(found)
    }

    async fn lookup(&mut self, name: &TableName) -> Result<Option<TableInfo>> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached.clone());
        }
        let table = match self
            .catalog
            .get_table(self.catalog_id, &name.database, &name.table)
            .await
        {
            Ok(table) => table,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        self.cache.insert(name.clone(), table.clone());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{Call, InMemoryAccount};
    use lakeshare_core::ErrorClass;

    fn account() -> InMemoryAccount {
        let account = InMemoryAccount::new("222222222222".parse().unwrap());
        account.add_database("sales").unwrap();
        account.add_database("crm").unwrap();
        account.add_table("sales", TableInfo::physical("orders")).unwrap();
        account.add_table("crm", TableInfo::physical("customers")).unwrap();
        account
    }

    fn names(items: &[(&str, &str)]) -> BTreeSet<TableName> {
        items.iter().map(|(d, t)| TableName::new(*d, *t)).collect()
    }

    #[test]
    fn view_text_decodes_to_sql() {
        let text = encode_view_text("SELECT * FROM orders");
        assert!(text.starts_with("/* Presto View: "));
        assert_eq!(decode_view_sql(&text).unwrap(), "SELECT * FROM orders");
    }

    #[test]
    fn malformed_view_text_is_invalid() {
        let missing_sql = format!("/* Presto View: {} */", STANDARD.encode("{}"));
        for text in ["SELECT 1", "/* Presto View: not-base64! */", missing_sql.as_str()] {
            let err = decode_view_sql(text).expect_err("malformed");
            assert_eq!(err.class(), ErrorClass::Invalid, "{text}");
        }
    }

    #[test]
    fn relations_resolve_against_the_view_database() {
        let sql = "WITH recent AS (SELECT * FROM orders WHERE amount > 1) \
                   SELECT r.id, c.name FROM recent r \
                   JOIN crm.customers c ON r.customer_id = c.id \
                   JOIN awsdatacatalog.sales.Returns x ON x.id = r.id \
                   WHERE r.id IN (SELECT id FROM orders)";
        let tables = referenced_tables(sql, "sales").unwrap();
        assert_eq!(
            tables.into_iter().collect::<BTreeSet<_>>(),
            names(&[("sales", "orders"), ("crm", "customers"), ("sales", "returns")])
        );
    }

    #[test]
    fn unparseable_sql_is_invalid() {
        let err = referenced_tables("SELEKT nothing", "sales").expect_err("parse");
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[tokio::test]
    async fn physical_table_has_no_dependencies() {
        let account = account();
        let mut resolver = ViewResolver::new(&account, account.account_id());
        let deps = resolver
            .dependencies(&TableName::new("sales", "orders"))
            .await
            .unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn nested_views_resolve_to_every_relation() {
        let account = account();
        account
            .add_table(
                "sales",
                TableInfo::view(
                    "enriched",
                    encode_view_text(
                        "SELECT o.id, c.name FROM orders o JOIN crm.customers c ON o.customer_id = c.id",
                    ),
                ),
            )
            .unwrap();
        account
            .add_table(
                "sales",
                TableInfo::view(
                    "summary",
                    encode_view_text("SELECT * FROM enriched JOIN orders USING (id)"),
                ),
            )
            .unwrap();

        let mut resolver = ViewResolver::new(&account, account.account_id());
        let deps = resolver
            .dependencies(&TableName::new("sales", "summary"))
            .await
            .unwrap();
        assert_eq!(
            deps,
            names(&[("sales", "enriched"), ("sales", "orders"), ("crm", "customers")])
        );
        assert_eq!(account.calls(Call::GetTable), 4);
    }

    #[tokio::test]
    async fn cycles_and_missing_relations_terminate() {
        let account = account();
        account
            .add_table("sales", TableInfo::view("a", encode_view_text("SELECT * FROM b")))
            .unwrap();
        account
            .add_table(
                "sales",
                TableInfo::view("b", encode_view_text("SELECT * FROM a JOIN ghost USING (id)")),
            )
            .unwrap();

        let mut resolver = ViewResolver::new(&account, account.account_id());
        let deps = resolver.dependencies(&TableName::new("sales", "a")).await.unwrap();
        assert_eq!(deps, names(&[("sales", "b")]));
    }

    #[tokio::test]
    async fn catalog_failures_propagate() {
        let account = account();
        account.fail(Call::GetTable, ErrorClass::Transient, 1).unwrap();
        let mut resolver = ViewResolver::new(&account, account.account_id());
        let err = resolver
            .dependencies(&TableName::new("sales", "orders"))
            .await
            .expect_err("transient");
        assert!(err.class().is_retryable());
    }
}
