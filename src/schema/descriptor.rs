use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::db::introspect::{Catalog, CatalogTable, ConstraintKind, Introspector, is_string_type};
use crate::error::{Nl2SqlError, Result};
use crate::schema::entity::EntitySet;

static PLAIN_IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub col_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
    pub comment: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table_name: String,
    pub creation_statement: String,
    /// Header of `sample_rows`, the retained columns in table order
    pub sample_columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Prompt-ready text: DDL, sample rows and any column notes.
    pub fn describe(&self) -> String {
        let mut text = self.creation_statement.clone();

        if !self.sample_rows.is_empty() {
            text.push_str(&format!(
                "\n\n/*\n{} rows from {} table:\n{}\n",
                self.sample_rows.len(),
                self.table_name,
                self.sample_columns.join("\t")
            ));
            for row in &self.sample_rows {
                text.push_str(&row.join("\t"));
                text.push('\n');
            }
            text.push_str("*/");
        }

        let notes: Vec<String> = self
            .columns
            .iter()
            .filter_map(|c| {
                let mut parts = Vec::new();
                if let Some(description) = c.description.as_ref().or(c.comment.as_ref()) {
                    parts.push(description.clone());
                }
                if let Some(values) = &c.enum_values {
                    parts.push(format!("one of [{}]", values.iter().map(|v| format!("'{}'", v)).collect::<Vec<_>>().join(", ")));
                }
                (!parts.is_empty()).then(|| format!("-- {}: {}", c.name, parts.join("; ")))
            })
            .collect();
        if !notes.is_empty() {
            text.push_str("\n\n");
            text.push_str(&notes.join("\n"));
        }

        text
    }
}

/// Immutable description of the visible part of one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    fn column(&self, table: &str, column: &str) -> Option<&ColumnDescriptor> {
        self.tables.get(table).and_then(|t| t.column(column))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnDictionary {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub col_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableDictionary {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: HashMap<String, ColumnDictionary>,
}

/// Human-written descriptions of a database, loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataDictionary {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tables: HashMap<String, TableDictionary>,
}

impl DataDictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn column_description(&self, table: &str, column: &str) -> Option<&str> {
        self.tables
            .get(table)?
            .columns
            .get(column)?
            .description
            .as_deref()
    }
}

fn display_ident(name: &str) -> String {
    if PLAIN_IDENTIFIER.is_match(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn creation_statement(table: &CatalogTable, retained: &[usize]) -> String {
    let mut definitions: Vec<String> = retained
        .iter()
        .map(|&i| {
            let col = &table.columns[i];
            let mut definition = format!("{} {}", display_ident(&col.name), col.data_type);
            if !col.nullable {
                definition.push_str(" NOT NULL");
            }
            if let Some(default) = &col.default {
                definition.push_str(&format!(" DEFAULT {}", default));
            }
            definition
        })
        .collect();

    for constraint in &table.constraints {
        let columns = constraint
            .columns
            .iter()
            .map(|c| display_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let definition = match (constraint.kind, &constraint.references) {
            (ConstraintKind::PrimaryKey, _) => format!("PRIMARY KEY ({})", columns),
            (ConstraintKind::Unique, _) => format!("UNIQUE ({})", columns),
            (ConstraintKind::ForeignKey, Some(reference)) => format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                columns,
                display_ident(&reference.table),
                reference
                    .columns
                    .iter()
                    .map(|c| display_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            (ConstraintKind::ForeignKey, None) => continue,
        };
        definitions.push(definition);
    }

    format!(
        "CREATE TABLE {} (\n    {}\n);",
        display_ident(&table.name),
        definitions.join(",\n    ")
    )
}

/// Turns a catalog plus exclusions into a [`SchemaDescriptor`].
pub struct SchemaBuilder<'a> {
    database: &'a str,
    enum_limit: usize,
    dictionary: Option<&'a DataDictionary>,
    previous: Option<&'a SchemaDescriptor>,
    introspector: Option<&'a dyn Introspector>,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(database: &'a str) -> Self {
        Self {
            database,
            enum_limit: 0,
            dictionary: None,
            previous: None,
            introspector: None,
        }
    }

    /// Look up enumerations of string columns through `introspector`; 0 disables the lookup.
    pub fn with_enum_lookup(mut self, introspector: &'a dyn Introspector, enum_limit: usize) -> Self {
        self.introspector = Some(introspector);
        self.enum_limit = enum_limit;
        self
    }

    pub fn with_dictionary(mut self, dictionary: Option<&'a DataDictionary>) -> Self {
        self.dictionary = dictionary;
        self
    }

    /// Column descriptors already present in `previous` are reused verbatim.
    pub fn with_previous(mut self, previous: &'a SchemaDescriptor) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Builds the descriptor, failing when no table survives the exclusions.
    pub fn build(&self, catalog: &Catalog, exclusions: &EntitySet) -> Result<SchemaDescriptor> {
        let descriptor = self.build_tables(catalog, exclusions)?;
        if descriptor.tables.is_empty() {
            return Err(Nl2SqlError::Schema(format!(
                "Database {} has no usable tables",
                self.database
            )));
        }
        Ok(descriptor)
    }

    /// Like [`SchemaBuilder::build`], but an empty result is allowed.
    pub fn build_tables(&self, catalog: &Catalog, exclusions: &EntitySet) -> Result<SchemaDescriptor> {
        let mut tables = BTreeMap::new();

        for table in &catalog.tables {
            let excluded =
                |column: &str| exclusions.contains_column(self.database, &table.name, column);

            if !table.columns.is_empty() && table.columns.iter().all(|c| excluded(&c.name)) {
                info!("[{}] : Excluding table {}", self.database, table.name);
                continue;
            }

            let retained: Vec<usize> = table
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    let keep = table.is_constrained(&c.name) || !excluded(&c.name);
                    if !keep {
                        debug!("[{}.{}] : Removing column {}", self.database, table.name, c.name);
                    }
                    keep
                })
                .map(|(i, _)| i)
                .collect();

            if retained.is_empty() {
                return Err(Nl2SqlError::Schema(format!(
                    "Table {}.{} has no columns",
                    self.database, table.name
                )));
            }

            let mut columns = Vec::with_capacity(retained.len());
            let mut candidates = Vec::new();
            for &i in &retained {
                let col = &table.columns[i];
                if let Some(previous) = self.previous.and_then(|p| p.column(&table.name, &col.name)) {
                    columns.push(previous.clone());
                    continue;
                }
                if is_string_type(&col.data_type) && !table.is_constrained(&col.name) {
                    candidates.push(col.name.clone());
                }
                columns.push(ColumnDescriptor {
                    name: col.name.clone(),
                    col_type: col.data_type.clone(),
                    nullable: col.nullable,
                    primary_key: table.is_primary_key(&col.name),
                    default: col.default.clone(),
                    comment: col.comment.clone(),
                    enum_values: None,
                    description: self
                        .dictionary
                        .and_then(|d| d.column_description(&table.name, &col.name))
                        .map(str::to_string),
                });
            }

            if let Some(introspector) = self.introspector {
                if self.enum_limit > 0 && !candidates.is_empty() {
                    match introspector.enum_values(&table.name, &candidates, self.enum_limit) {
                        Ok(mut values) => {
                            for column in columns.iter_mut() {
                                if let Some(vals) = values.remove(&column.name) {
                                    column.enum_values = Some(vals);
                                }
                            }
                        }
                        Err(e) => warn!("[{}] skipping enum values for {}: {}", self.database, table.name, e),
                    }
                }
            }

            let sample_columns = retained.iter().map(|&i| table.columns[i].name.clone()).collect();
            let sample_rows = table
                .sample_rows
                .iter()
                .map(|row| {
                    retained
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or_default())
                        .collect()
                })
                .collect();

            tables.insert(
                table.name.clone(),
                TableDescriptor {
                    table_name: table.name.clone(),
                    creation_statement: creation_statement(table, &retained),
                    sample_columns,
                    sample_rows,
                    columns,
                },
            );
        }

        if tables.is_empty() {
            warn!("[{}] : No tables left after filtering", self.database);
        }

        Ok(SchemaDescriptor { tables })
    }
}
