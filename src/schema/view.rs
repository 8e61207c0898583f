use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::db::introspect::{Catalog, Introspector};
use crate::error::Result;
use crate::schema::descriptor::{DataDictionary, SchemaBuilder, SchemaDescriptor};
use crate::schema::entity::{DatasetSchema, EntitySelector, EntitySet, FilterMode};

/// A named, dialect-tagged slice of a database that prompts are allowed to see.
///
/// Views are immutable; [`SchemaView::filter`] derives a narrower view and
/// reuses the column descriptors of this one.
#[derive(Debug, Clone)]
pub struct SchemaView {
    pub name: String,
    pub dialect: String,
    catalog: Arc<Catalog>,
    descriptor: Arc<SchemaDescriptor>,
}

impl SchemaView {
    /// Builds the initial view of `catalog`, hiding `exclusions`.
    pub fn describe(
        catalog: Arc<Catalog>,
        dialect: &str,
        exclusions: &EntitySet,
        dictionary: Option<&DataDictionary>,
        introspector: &dyn Introspector,
        enum_limit: usize,
    ) -> Result<Self> {
        let name = catalog.database.clone();
        let descriptor = SchemaBuilder::new(&name)
            .with_enum_lookup(introspector, enum_limit)
            .with_dictionary(dictionary)
            .build(&catalog, &exclusions.for_database(&name))?;

        Ok(Self {
            name,
            dialect: dialect.to_string(),
            catalog,
            descriptor: Arc::new(descriptor),
        })
    }

    /// Derives a view restricted by `selectors`. Nothing is queried again.
    pub fn filter(&self, selectors: &[EntitySelector], mode: FilterMode) -> Result<Self> {
        let visible = self.schema_snapshot();
        let kept = EntitySet::filter(selectors, mode, &visible);

        let mut everything = BTreeMap::new();
        everything.insert(self.name.clone(), self.catalog.column_types());
        let excluded = kept.invert(&everything);

        let descriptor = SchemaBuilder::new(&self.name)
            .with_previous(&self.descriptor)
            .build_tables(&self.catalog, &excluded)?;
        debug!(
            "[{}] : Filtered view keeps {} of {} tables",
            self.name,
            descriptor.tables.len(),
            self.descriptor.tables.len()
        );

        Ok(Self {
            name: self.name.clone(),
            dialect: self.dialect.clone(),
            catalog: Arc::clone(&self.catalog),
            descriptor: Arc::new(descriptor),
        })
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    /// `{name: {table: {column: type}}}` of the visible columns.
    pub fn schema_snapshot(&self) -> DatasetSchema {
        let tables = self
            .descriptor
            .tables
            .iter()
            .map(|(name, table)| {
                let columns = table
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.col_type.clone()))
                    .collect();
                (name.clone(), columns)
            })
            .collect();
        let mut schema = BTreeMap::new();
        schema.insert(self.name.clone(), tables);
        schema
    }

    pub fn usable_tables(&self) -> Vec<String> {
        self.descriptor.tables.keys().cloned().collect()
    }

    pub fn table_columns(&self, table: &str) -> Vec<String> {
        self.descriptor
            .table(table)
            .map(|t| t.column_names())
            .unwrap_or_default()
    }

    /// Every visible column as `table.column`.
    pub fn available_columns(&self) -> Vec<String> {
        self.descriptor
            .tables
            .values()
            .flat_map(|t| t.columns.iter().map(move |c| format!("{}.{}", t.table_name, c.name)))
            .collect()
    }

    /// Join conditions `table.column=ref_table.ref_column` from foreign keys
    /// whose both ends are visible.
    pub fn allowed_joins(&self) -> Vec<String> {
        let mut joins = Vec::new();
        for (name, table) in &self.descriptor.tables {
            let Some(catalog_table) = self.catalog.table(name) else {
                continue;
            };
            for (constraint, reference) in catalog_table.foreign_keys() {
                let Some(referenced) = self.descriptor.table(&reference.table) else {
                    continue;
                };
                for (column, ref_column) in constraint.columns.iter().zip(&reference.columns) {
                    if table.column(column).is_some() && referenced.column(ref_column).is_some() {
                        joins.push(format!("{}.{}={}.{}", name, column, reference.table, ref_column));
                    }
                }
            }
        }
        joins
    }

    /// Prompt text for a single table, empty when it is not visible.
    pub fn table_description(&self, table: &str) -> String {
        self.descriptor
            .table(table)
            .map(|t| t.describe())
            .unwrap_or_default()
    }

    /// Prompt text for every visible table.
    pub fn table_info(&self) -> String {
        self.descriptor
            .tables
            .values()
            .map(|t| t.describe())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::descriptor::tests::{FakeIntrospector, shop_catalog};
    use std::sync::atomic::Ordering;

    fn view() -> (SchemaView, FakeIntrospector) {
        let introspector = FakeIntrospector::new();
        let exclusions = EntitySet::from_strings(
            &["shop.users.ssn", "other.users.name"],
            &{
                let mut schema = BTreeMap::new();
                schema.insert("shop".to_string(), shop_catalog().column_types());
                schema.insert("other".to_string(), shop_catalog().column_types());
                schema
            },
        )
        .unwrap();
        let view = SchemaView::describe(
            Arc::new(shop_catalog()),
            "duckdb",
            &exclusions,
            None,
            &introspector,
            10,
        )
        .unwrap();
        (view, introspector)
    }

    #[test]
    fn test_exclusions_are_distributed_per_database() {
        let (view, _) = view();
        assert_eq!(view.table_columns("users"), vec!["id", "name", "status"]);
        assert_eq!(view.usable_tables(), vec!["orders", "users"]);
        assert_eq!(view.allowed_joins(), vec!["orders.user_id=users.id"]);
    }

    #[test]
    fn test_filter_only_tables() {
        let (view, introspector) = view();
        let narrowed = view
            .filter(&[EntitySelector::table("shop", "users")], FilterMode::Only)
            .unwrap();

        assert_eq!(narrowed.usable_tables(), vec!["users"]);
        assert!(narrowed.allowed_joins().is_empty());
        assert_eq!(
            narrowed.descriptor().table("users"),
            view.descriptor().table("users")
        );
        // the parent view is untouched
        assert_eq!(view.usable_tables().len(), 2);
        assert_eq!(introspector.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_columns_keeps_constrained() {
        let (view, _) = view();
        let narrowed = view
            .filter(&[EntitySelector::column("shop", "orders", "total")], FilterMode::Only)
            .unwrap();
        assert_eq!(narrowed.usable_tables(), vec!["orders"]);
        assert_eq!(narrowed.table_columns("orders"), vec!["id", "user_id", "total"]);

        let narrowed = narrowed
            .filter(&[EntitySelector::column("shop", "orders", "id")], FilterMode::Exclude)
            .unwrap();
        assert_eq!(narrowed.table_columns("orders"), vec!["id", "user_id", "total"]);
    }

    #[test]
    fn test_filter_never_reveals_hidden_columns() {
        let (view, _) = view();
        let narrowed = view
            .filter(&[EntitySelector::table("shop", "users")], FilterMode::Only)
            .unwrap();
        assert!(!narrowed.available_columns().contains(&"users.ssn".to_string()));

        let empty = view.filter(&[], FilterMode::Only).unwrap();
        assert!(empty.usable_tables().is_empty());
        assert!(empty.table_info().is_empty());
    }
}
