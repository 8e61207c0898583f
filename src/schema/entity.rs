//! Entity selectors of the form `database.table.column`, where any part may be `*`.
//!
//! Selectors are parsed and validated once, then expanded against a
//! [`DatasetSchema`] snapshot into a set of concrete [`EntityId`]s.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Nl2SqlError, Result};

/// database -> table -> column -> column type
pub type DatasetSchema = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub database: String,
    pub table: String,
    pub column: String,
}

impl EntityId {
    pub fn new(database: &str, table: &str, column: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Part {
    Any,
    Name(String),
}

impl Part {
    fn from_known(name: &str) -> Self {
        if name == WILDCARD {
            Part::Any
        } else {
            Part::Name(name.to_string())
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Part::Any => f.write_str(WILDCARD),
            Part::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntitySelector {
    pub database: Part,
    pub table: Part,
    pub column: Part,
}

impl EntitySelector {
    /// Every column of one table.
    pub fn table(database: &str, table: &str) -> Self {
        Self {
            database: Part::Name(database.to_string()),
            table: Part::Name(table.to_string()),
            column: Part::Any,
        }
    }

    /// A single concrete column.
    pub fn column(database: &str, table: &str, column: &str) -> Self {
        Self {
            database: Part::Name(database.to_string()),
            table: Part::Name(table.to_string()),
            column: Part::Name(column.to_string()),
        }
    }

    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<EntitySelector>> {
        raw.iter().map(|s| s.as_ref().parse()).collect()
    }
}

impl FromStr for EntitySelector {
    type Err = Nl2SqlError;

    fn from_str(raw: &str) -> Result<Self> {
        if raw == "*.*.*" {
            return Err(Nl2SqlError::Validation(
                "\"*.*.*\" is not allowed".to_string(),
            ));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(Nl2SqlError::Validation(format!(
                "Malformed entity id {}",
                raw
            )));
        }

        for (part, kind) in parts.iter().zip(["database", "table", "column"]) {
            if *part != WILDCARD && !IDENTIFIER_REGEX.is_match(part) {
                return Err(Nl2SqlError::Validation(format!(
                    "Malformed {} '{}' in {}",
                    kind, part, raw
                )));
            }
        }

        Ok(Self {
            database: Part::from_known(parts[0]),
            table: Part::from_known(parts[1]),
            column: Part::from_known(parts[2]),
        })
    }
}

impl fmt::Display for EntitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.table, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Only,
    Exclude,
}

/// A set of concrete entity ids resolved against a schema snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntitySet {
    ids: BTreeSet<EntityId>,
}

impl EntitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves wildcards with a worklist: database wildcards expand first, then
    /// tables, then columns. Parts naming entities absent from `schema` are dropped.
    pub fn expand(selectors: &[EntitySelector], schema: &DatasetSchema) -> Self {
        let mut stack: Vec<EntitySelector> = selectors.to_vec();
        let mut ids = BTreeSet::new();

        while let Some(selector) = stack.pop() {
            let EntitySelector {
                database,
                table,
                column,
            } = selector;

            match (&database, &table, &column) {
                (Part::Any, _, _) => {
                    stack.extend(schema.keys().map(|db| EntitySelector {
                        database: Part::Name(db.clone()),
                        table: table.clone(),
                        column: column.clone(),
                    }));
                }
                (Part::Name(db), Part::Any, _) => {
                    let tables = schema.get(db).into_iter().flat_map(|t| t.keys());
                    stack.extend(tables.map(|tab| EntitySelector {
                        database: database.clone(),
                        table: Part::Name(tab.clone()),
                        column: column.clone(),
                    }));
                }
                (Part::Name(db), Part::Name(tab), Part::Any) => {
                    let columns = schema
                        .get(db)
                        .and_then(|t| t.get(tab))
                        .into_iter()
                        .flat_map(|c| c.keys());
                    stack.extend(columns.map(|col| EntitySelector {
                        database: database.clone(),
                        table: table.clone(),
                        column: Part::Name(col.clone()),
                    }));
                }
                (Part::Name(db), Part::Name(tab), Part::Name(col)) => {
                    let known = schema
                        .get(db)
                        .and_then(|t| t.get(tab))
                        .is_some_and(|c| c.contains_key(col));
                    if known {
                        ids.insert(EntityId::new(db, tab, col));
                    } else {
                        debug!("Invalid filter expression found: {}.{}.{}. Skipping.", db, tab, col);
                    }
                }
            }
        }

        Self { ids }
    }

    /// Parses raw selector strings and expands them.
    pub fn from_strings<S: AsRef<str>>(raw: &[S], schema: &DatasetSchema) -> Result<Self> {
        let selectors = EntitySelector::parse_all(raw)?;
        Ok(Self::expand(&selectors, schema))
    }

    /// Retained identifiers for a filter: `Only` keeps the expansion, `Exclude` its complement.
    pub fn filter(selectors: &[EntitySelector], mode: FilterMode, schema: &DatasetSchema) -> Self {
        let expanded = Self::expand(selectors, schema);
        match mode {
            FilterMode::Only => expanded,
            FilterMode::Exclude => expanded.invert(schema),
        }
    }

    /// Complement against every column in `schema`.
    pub fn invert(&self, schema: &DatasetSchema) -> Self {
        let ids = universe(schema)
            .into_iter()
            .filter(|id| !self.ids.contains(id))
            .collect();
        Self { ids }
    }

    /// Only the ids that belong to one database.
    pub fn for_database(&self, database: &str) -> Self {
        let ids = self
            .ids
            .iter()
            .filter(|id| id.database == database)
            .cloned()
            .collect();
        Self { ids }
    }

    pub fn contains_column(&self, database: &str, table: &str, column: &str) -> bool {
        self.ids.contains(&EntityId::new(database, table, column))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<EntityId> for EntitySet {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

fn universe(schema: &DatasetSchema) -> BTreeSet<EntityId> {
    schema
        .iter()
        .flat_map(|(db, tables)| {
            tables.iter().flat_map(move |(tab, columns)| {
                columns.keys().map(move |col| EntityId::new(db, tab, col))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DatasetSchema {
        let mut orders = BTreeMap::new();
        orders.insert("id".to_string(), "INTEGER".to_string());
        orders.insert("total".to_string(), "DOUBLE".to_string());

        let mut users = BTreeMap::new();
        users.insert("id".to_string(), "INTEGER".to_string());
        users.insert("name".to_string(), "VARCHAR".to_string());

        let mut db = BTreeMap::new();
        db.insert("orders".to_string(), orders);
        db.insert("users".to_string(), users.clone());

        let mut other = BTreeMap::new();
        other.insert("users".to_string(), users);

        let mut schema = BTreeMap::new();
        schema.insert("db".to_string(), db);
        schema.insert("other".to_string(), other);
        schema
    }

    fn ids(set: &EntitySet) -> Vec<String> {
        set.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_full_wildcard_rejected() {
        assert!(matches!("*.*.*".parse::<EntitySelector>(), Err(Nl2SqlError::Validation(_))));
        // trailing whitespace is not a valid column part either
        assert!(matches!("*.*.* ".parse::<EntitySelector>(), Err(Nl2SqlError::Validation(_))));
    }

    #[test]
    fn test_malformed_selectors_rejected() {
        for raw in ["db.orders", "db.orders.id.extra", "db.ord ers.id", "db.orders.i$d", ""] {
            assert!(
                matches!(raw.parse::<EntitySelector>(), Err(Nl2SqlError::Validation(_))),
                "{} should be rejected",
                raw
            );
        }
        assert!("db-1.order_items.*".parse::<EntitySelector>().is_ok());
    }

    #[test]
    fn test_table_wildcard_expands_columns() {
        let set = EntitySet::from_strings(&["db.orders.*"], &schema()).unwrap();
        assert_eq!(ids(&set), vec!["db.orders.id", "db.orders.total"]);
    }

    #[test]
    fn test_database_wildcard_expands_across_databases() {
        let set = EntitySet::from_strings(&["*.users.id"], &schema()).unwrap();
        assert_eq!(ids(&set), vec!["db.users.id", "other.users.id"]);

        let set = EntitySet::from_strings(&["*.*.name"], &schema()).unwrap();
        assert_eq!(ids(&set), vec!["db.users.name", "other.users.name"]);
    }

    #[test]
    fn test_concrete_selector_is_idempotent() {
        let set = EntitySet::from_strings(&["db.orders.total"], &schema()).unwrap();
        assert_eq!(ids(&set), vec!["db.orders.total"]);

        let again = EntitySet::from_strings(ids(&set).as_slice(), &schema()).unwrap();
        assert_eq!(set, again);

        let missing = EntitySet::from_strings(&["db.orders.discount"], &schema()).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_unknown_parts_are_dropped() {
        let set = EntitySet::from_strings(&["nope.*.*", "db.nope.*", "db.orders.id"], &schema()).unwrap();
        assert_eq!(ids(&set), vec!["db.orders.id"]);
    }

    #[test]
    fn test_filter_modes() {
        let selectors = EntitySelector::parse_all(&["db.users.*"]).unwrap();
        let only = EntitySet::filter(&selectors, FilterMode::Only, &schema());
        assert_eq!(ids(&only), vec!["db.users.id", "db.users.name"]);

        let exclude = EntitySet::filter(&selectors, FilterMode::Exclude, &schema());
        assert_eq!(
            ids(&exclude),
            vec!["db.orders.id", "db.orders.total", "other.users.id", "other.users.name"]
        );
        assert_eq!(only.len() + exclude.len(), 6);
    }

    #[test]
    fn test_for_database() {
        let set = EntitySet::from_strings(&["*.users.*"], &schema()).unwrap();
        assert_eq!(ids(&set.for_database("other")), vec!["other.users.id", "other.users.name"]);
    }

    #[test]
    fn test_internal_selectors_skip_validation() {
        let mut tables = BTreeMap::new();
        let mut columns = BTreeMap::new();
        columns.insert("order date".to_string(), "DATE".to_string());
        tables.insert("Sales Data".to_string(), columns);
        let mut schema = BTreeMap::new();
        schema.insert("db".to_string(), tables);

        let set = EntitySet::expand(&[EntitySelector::table("db", "Sales Data")], &schema);
        assert!(set.contains_column("db", "Sales Data", "order date"));
    }
}
