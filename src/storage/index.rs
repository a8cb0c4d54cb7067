//! Secondary index definitions for the local store.

use crate::types::Table;

/// A single-field secondary index on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub table: Table,
    pub name: String,
    pub field: String,
}

impl IndexDefinition {
    pub fn new(table: Table, name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
            field: field.into(),
        }
    }

    /// JSON path of the indexed value inside a row's `data`.
    pub fn path(&self) -> String {
        self.table.field_path(&self.field)
    }

    /// Index and field names are spliced into SQL, so only identifier
    /// characters are accepted.
    pub fn is_valid(&self) -> bool {
        let ident = |s: &str| {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        ident(&self.name) && ident(&self.field)
    }
}

/// Indexes every store gets unless configured otherwise: base records by
/// precinct and dynamic overlays by status.
pub fn default_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new(Table::Base, "precinct", "precinct"),
        IndexDefinition::new(Table::Dynamic, "status", "status"),
    ]
}

/// Find an index by table and name.
pub fn find_index<'a>(
    indexes: &'a [IndexDefinition],
    table: Table,
    name: &str,
) -> Option<&'a IndexDefinition> {
    indexes.iter().find(|i| i.table == table && i.name == name)
}
