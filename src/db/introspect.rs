//! Catalog introspection: what tables, columns and constraints a database has.

use duckdb::{Connection, params};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::db::db_pool::DuckDbPool;
use crate::db::executor::{ExecutionError, query_rows};
use crate::error::{Nl2SqlError, Result};

const SAMPLE_ROWS: usize = 3;

static REFERENCES_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)REFERENCES\s+(?:"?[^\s"(]+"?\.)?"?([^\s"(]+)"?\s*\(([^)]*)\)"#).unwrap()
});

static STRING_TYPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:VARCHAR|TEXT|STRING|BPCHAR|CHAR|CHARACTER(?:\s+VARYING)?)(?:\s*\(\s*\d+\s*\))?$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    pub references: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTable {
    pub name: String,
    pub columns: Vec<CatalogColumn>,
    pub constraints: Vec<Constraint>,
    /// Rows rendered as strings, positionally aligned with `columns`
    pub sample_rows: Vec<Vec<String>>,
}

impl CatalogTable {
    pub fn is_constrained(&self, column: &str) -> bool {
        self.constraints
            .iter()
            .any(|c| c.columns.iter().any(|name| name == column))
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.constraints.iter().any(|c| {
            c.kind == ConstraintKind::PrimaryKey && c.columns.iter().any(|name| name == column)
        })
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Constraint, &ForeignKeyRef)> {
        self.constraints
            .iter()
            .filter_map(|c| c.references.as_ref().map(|r| (c, r)))
    }
}

/// Raw catalog of one database, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub database: String,
    pub tables: Vec<CatalogTable>,
}

impl Catalog {
    pub fn table(&self, name: &str) -> Option<&CatalogTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// table -> column -> type
    pub fn column_types(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.tables
            .iter()
            .map(|t| {
                let columns = t
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.data_type.clone()))
                    .collect();
                (t.name.clone(), columns)
            })
            .collect()
    }
}

pub trait Introspector: Send + Sync {
    fn catalog(&self) -> Result<Catalog>;

    /// Distinct non-empty values of each column in `columns` that has fewer than
    /// `limit` of them. Columns above the limit are absent from the result.
    fn enum_values(
        &self,
        table: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<String>>>;
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Scalar character types only. Lists, structs and maps of strings do not count.
pub fn is_string_type(data_type: &str) -> bool {
    STRING_TYPE_REGEX.is_match(data_type.trim())
}

/// Parses the referenced table and columns out of a foreign key definition.
pub fn parse_references(constraint_text: &str) -> Option<ForeignKeyRef> {
    let caps = REFERENCES_REGEX.captures(constraint_text)?;
    let table = caps.get(1)?.as_str().to_string();
    let columns = caps
        .get(2)?
        .as_str()
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect();
    Some(ForeignKeyRef { table, columns })
}

fn db_error(e: duckdb::Error) -> Nl2SqlError {
    Nl2SqlError::Execution(ExecutionError::new(e.to_string()))
}

pub struct DuckDbIntrospector {
    name: String,
    pool: DuckDbPool,
}

impl DuckDbIntrospector {
    pub fn new(name: &str, pool: DuckDbPool) -> Self {
        Self {
            name: name.to_string(),
            pool,
        }
    }

    fn connection(&self) -> Result<r2d2::PooledConnection<crate::db::db_pool::DuckDBConnectionManager>> {
        self.pool.get().map_err(|e| {
            Nl2SqlError::Execution(ExecutionError::new(format!("Failed to get connection: {}", e)))
        })
    }

    fn table_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT table_name FROM duckdb_tables() \
                 WHERE NOT internal AND database_name = current_database() AND schema_name = 'main' \
                 ORDER BY table_name",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_error)
    }

    fn columns(conn: &Connection, table: &str) -> Result<Vec<CatalogColumn>> {
        let mut stmt = conn
            .prepare(
                "SELECT column_name, data_type, is_nullable, column_default, comment \
                 FROM duckdb_columns() \
                 WHERE table_name = ? AND database_name = current_database() AND schema_name = 'main' \
                 ORDER BY column_index",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok(CatalogColumn {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    nullable: row.get(2)?,
                    default: row.get(3)?,
                    comment: row.get::<_, Option<String>>(4)?.filter(|c| !c.is_empty()),
                })
            })
            .map_err(db_error)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_error)
    }

    fn constraints(conn: &Connection, table: &str) -> Result<Vec<Constraint>> {
        let mut stmt = conn
            .prepare(
                "SELECT constraint_type, constraint_text, array_to_string(constraint_column_names, ',') \
                 FROM duckdb_constraints() \
                 WHERE table_name = ? AND database_name = current_database() AND schema_name = 'main' \
                 ORDER BY constraint_index",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                ))
            })
            .map_err(db_error)?;

        let mut constraints = Vec::new();
        for row in rows {
            let (kind, text, columns) = row.map_err(db_error)?;
            let kind = match kind.as_str() {
                "PRIMARY KEY" => ConstraintKind::PrimaryKey,
                "UNIQUE" => ConstraintKind::Unique,
                "FOREIGN KEY" => ConstraintKind::ForeignKey,
                _ => continue,
            };
            let columns = columns
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let references = match kind {
                ConstraintKind::ForeignKey => parse_references(&text),
                _ => None,
            };
            constraints.push(Constraint {
                kind,
                columns,
                references,
            });
        }
        Ok(constraints)
    }

    fn sample_rows(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
        let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), SAMPLE_ROWS);
        Ok(query_rows(conn, &sql, SAMPLE_ROWS)?.rows)
    }
}

impl Introspector for DuckDbIntrospector {
    fn catalog(&self) -> Result<Catalog> {
        let conn = self.connection()?;

        let mut tables = Vec::new();
        for name in Self::table_names(&conn)? {
            let columns = Self::columns(&conn, &name)?;
            let constraints = Self::constraints(&conn, &name)?;
            let sample_rows = Self::sample_rows(&conn, &name)?;
            debug!(
                "Introspected {}.{}: {} columns, {} constraints",
                self.name,
                name,
                columns.len(),
                constraints.len()
            );
            tables.push(CatalogTable {
                name,
                columns,
                constraints,
                sample_rows,
            });
        }

        Ok(Catalog {
            database: self.name.clone(),
            tables,
        })
    }

    fn enum_values(
        &self,
        table: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        if columns.is_empty() || limit == 0 {
            return Ok(BTreeMap::new());
        }
        let conn = self.connection()?;
        let table_ident = quote_ident(table);

        // one query counting distinct non-empty values of every candidate column
        let counts = columns
            .iter()
            .map(|c| format!("COUNT(DISTINCT NULLIF({}, ''))", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let distinct = query_rows(&conn, &format!("SELECT {} FROM {}", counts, table_ident), 1)?;
        let Some(count_row) = distinct.rows.first() else {
            return Ok(BTreeMap::new());
        };

        let qualifying: Vec<&String> = columns
            .iter()
            .zip(count_row)
            .filter(|(_, count)| {
                count
                    .parse::<usize>()
                    .is_ok_and(|count| count > 0 && count < limit)
            })
            .map(|(column, _)| column)
            .collect();
        if qualifying.is_empty() {
            return Ok(BTreeMap::new());
        }

        let selects = qualifying
            .iter()
            .map(|c| {
                let ident = quote_ident(c);
                format!(
                    "SELECT {} AS col, CAST({} AS VARCHAR) AS val FROM (SELECT DISTINCT {} FROM {} WHERE NULLIF({}, '') IS NOT NULL)",
                    quote_literal(c),
                    ident,
                    ident,
                    table_ident,
                    ident
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let values = query_rows(&conn, &selects, usize::MAX)?;

        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in values.rows {
            if let [column, value] = row.as_slice() {
                result.entry(column.clone()).or_default().push(value.clone());
            }
        }
        for vals in result.values_mut() {
            vals.sort();
        }
        Ok(result)
    }
}
