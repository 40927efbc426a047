//! Merge schema: which result tables are metadata, which table anchors
//! the join, and how foreign keys are named.
//!
//! The schema is explicit configuration rather than something inferred
//! from whatever columns happen to appear, so a worker that emits an
//! unexpected table shape fails the merge instead of silently producing
//! a differently-shaped artifact.

use serde::{Deserialize, Serialize};

use crate::constants::merge;

/// Declares how per-batch feature tables combine into one wide table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSchema {
    /// Logical table names that carry run metadata, not features; they
    /// are discarded before merging.
    pub metadata_tables: Vec<String>,
    /// Columns present in every feature table that address the site an
    /// object came from; they stay unprefixed and drive the join.
    pub shared_metadata_columns: Vec<String>,
    /// The table whose objects anchor the merge; every merged row
    /// corresponds to one row of this table.
    pub root_table: String,
    /// Per-object key column within the root table.
    pub root_key: String,
}

impl Default for MergeSchema {
    fn default() -> Self {
        Self {
            metadata_tables: merge::METADATA_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            shared_metadata_columns: merge::SHARED_METADATA_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            root_table: merge::DEFAULT_ROOT_TABLE.to_string(),
            root_key: merge::DEFAULT_ROOT_KEY.to_string(),
        }
    }
}

impl MergeSchema {
    /// True for tables dropped before merging (case-insensitive).
    pub fn is_metadata_table(&self, logical_name: &str) -> bool {
        self.metadata_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(logical_name))
    }

    /// True for the join columns shared by every table.
    pub fn is_shared_column(&self, column: &str) -> bool {
        self.shared_metadata_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Column in non-root tables that references a root-table object.
    pub fn parent_key_column(&self) -> String {
        format!("Parent_{}", self.root_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_matches_worker_output() {
        let schema = MergeSchema::default();
        assert!(schema.is_metadata_table("Experiment"));
        assert!(schema.is_metadata_table("image"));
        assert!(!schema.is_metadata_table("nucleus"));
        assert!(schema.is_shared_column("well"));
        assert!(schema.is_shared_column("site"));
        assert_eq!(schema.root_table, "nucleus");
        assert_eq!(schema.parent_key_column(), "Parent_nucleus");
    }
}
