use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// 0-based position in the table definition.
    pub ordinal: usize,
    pub declared_type: String,
    pub not_null: bool,
    pub default_sql: Option<String>,
    /// 1-based position inside the primary key, `None` when not part of it.
    pub primary_key_position: Option<u32>,
}

/// An index created with `CREATE INDEX`. Constraint-backed indexes are not listed here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ForeignKeyInfo {
    pub columns: Vec<String>,
    pub parent_table: String,
    /// Empty when the constraint targets the parent's primary key implicitly.
    pub parent_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// Point-in-time description of one table. Captured fresh for every run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaSnapshot {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub unique_constraints: Vec<Vec<String>>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub triggers: Vec<String>,
    pub without_rowid: bool,
    /// Table features a rebuild cannot re-declare, such as CHECK or generated columns.
    #[serde(default)]
    pub rebuild_blockers: Vec<String>,
}

impl SchemaSnapshot {
    /// Column lookup. SQLite column names are case-insensitive.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    #[must_use]
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.column(name).map(|column| column.ordinal)
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        let mut columns = self.columns.iter().collect::<Vec<_>>();
        columns.sort_by_key(|column| column.ordinal);
        columns.into_iter().map(|column| column.name.as_str()).collect()
    }

    /// Primary-key columns in key order.
    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&str> {
        let mut keyed = self
            .columns
            .iter()
            .filter_map(|column| column.primary_key_position.map(|position| (position, column)))
            .collect::<Vec<_>>();
        keyed.sort_by_key(|(position, _)| *position);
        keyed.into_iter().map(|(_, column)| column.name.as_str()).collect()
    }

    #[must_use]
    pub fn is_sole_primary_key(&self, name: &str) -> bool {
        matches!(self.primary_key_columns().as_slice(), [only] if only.eq_ignore_ascii_case(name))
    }

    /// Whether an index, UNIQUE constraint or foreign key mentions `name`.
    #[must_use]
    pub fn is_referenced_by_constraint(&self, name: &str) -> bool {
        let mentions = |columns: &[String]| columns.iter().any(|c| c.eq_ignore_ascii_case(name));
        self.indexes.iter().any(|index| mentions(index.columns.as_slice()))
            || self.unique_constraints.iter().any(|columns| mentions(columns.as_slice()))
            || self.foreign_keys.iter().any(|key| mentions(key.columns.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ordinal: usize, primary_key_position: Option<u32>) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            ordinal,
            declared_type: "TEXT".to_string(),
            not_null: false,
            default_sql: None,
            primary_key_position,
        }
    }

    fn snapshot(columns: Vec<ColumnInfo>) -> SchemaSnapshot {
        SchemaSnapshot {
            table: "quotes".to_string(),
            columns,
            indexes: Vec::new(),
            unique_constraints: Vec::new(),
            foreign_keys: Vec::new(),
            triggers: Vec::new(),
            without_rowid: false,
            rebuild_blockers: Vec::new(),
        }
    }

    #[test]
    fn primary_key_columns_follow_key_order() {
        let snapshot = snapshot(vec![
            column("a", 0, Some(2)),
            column("b", 1, None),
            column("c", 2, Some(1)),
        ]);
        assert_eq!(snapshot.primary_key_columns(), vec!["c", "a"]);
        assert!(!snapshot.is_sole_primary_key("c"));
    }

    #[test]
    fn sole_primary_key_lookup_ignores_ascii_case() {
        let snapshot = snapshot(vec![column("Id", 0, Some(1)), column("name", 1, None)]);
        assert!(snapshot.is_sole_primary_key("id"));
        assert_eq!(snapshot.ordinal_of("ID"), Some(0));
        assert_eq!(snapshot.column_names(), vec!["Id", "name"]);
    }

    #[test]
    fn constraint_references_cover_unique_and_foreign_keys() {
        let mut snapshot = snapshot(vec![column("a", 0, None), column("b", 1, None)]);
        assert!(!snapshot.is_referenced_by_constraint("a"));
        snapshot.unique_constraints.push(vec!["A".to_string()]);
        assert!(snapshot.is_referenced_by_constraint("a"));
        snapshot.foreign_keys.push(ForeignKeyInfo {
            columns: vec!["b".to_string()],
            parent_table: "parents".to_string(),
            parent_columns: Vec::new(),
            on_update: "NO ACTION".to_string(),
            on_delete: "CASCADE".to_string(),
        });
        assert!(snapshot.is_referenced_by_constraint("b"));
    }
}
