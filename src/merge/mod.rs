//! # Result Merging
//!
//! Combines per-batch worker output tables into one wide feature table
//! and renders the downloadable artifact. Merging is best-effort at its
//! outer boundary: a malformed table produces "no result" plus an error
//! log, never a crash of the serving path.
//!
//! The merge itself is schema-driven (see [`MergeSchema`]): metadata
//! tables are discarded, tables of the same logical name are concatenated
//! across batches, and non-root tables join onto the root table by site
//! address plus parent object key, with their columns prefixed by table
//! name.

pub mod schema;
pub mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::{PlateflowError, Result};
use crate::storage::ObjectStore;
use crate::store::BatchStore;

pub use schema::MergeSchema;
pub use table::{CellValue, FeatureTable};

/// Renders the merged table into one downloadable artifact.
pub trait Plotter: Send + Sync {
    /// Filename of the artifact, e.g. `merged_features.csv`.
    fn artifact_name(&self) -> &str;

    fn render(&self, merged: &FeatureTable) -> Result<Vec<u8>>;
}

/// Default artifact: the merged table itself as CSV.
#[derive(Debug, Default)]
pub struct CsvPlotter;

impl Plotter for CsvPlotter {
    fn artifact_name(&self) -> &str {
        "merged_features.csv"
    }

    fn render(&self, merged: &FeatureTable) -> Result<Vec<u8>> {
        Ok(merged.to_csv())
    }
}

/// A finished merge: where the artifact landed and what shape it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedArtifact {
    pub storage_path: String,
    pub rows: usize,
    pub columns: usize,
}

/// Merges result tables for one experiment out of object storage.
pub struct ResultMerger {
    batches: Arc<dyn BatchStore>,
    storage: Arc<dyn ObjectStore>,
    plotter: Arc<dyn Plotter>,
    schema: MergeSchema,
    result_bucket: String,
}

impl ResultMerger {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        storage: Arc<dyn ObjectStore>,
        plotter: Arc<dyn Plotter>,
        schema: MergeSchema,
        result_bucket: impl Into<String>,
    ) -> Self {
        Self {
            batches,
            storage,
            plotter,
            schema,
            result_bucket: result_bucket.into(),
        }
    }

    /// Merge every completed batch of the experiment and upload the
    /// rendered artifact under `artifact_prefix`. Returns `None` both
    /// when there is nothing to merge yet and when merging fails; the
    /// failure is logged, not propagated.
    pub async fn merge_experiment(
        &self,
        experiment_id: i64,
        artifact_prefix: &str,
    ) -> Result<Option<MergedArtifact>> {
        let tables = self.collect_tables(experiment_id).await?;
        if tables.is_empty() {
            return Ok(None);
        }

        let merged = match self.merge_tables(tables) {
            Ok(merged) => merged,
            Err(err) => {
                error!(experiment_id, %err, "merge failed; serving no result");
                return Ok(None);
            }
        };

        let bytes = match self.plotter.render(&merged) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(experiment_id, %err, "artifact rendering failed; serving no result");
                return Ok(None);
            }
        };

        let key = format!("{artifact_prefix}/{}", self.plotter.artifact_name());
        self.storage.put(&self.result_bucket, &key, bytes).await?;
        info!(
            experiment_id,
            rows = merged.rows.len(),
            columns = merged.columns.len(),
            key = %key,
            "merged artifact uploaded"
        );
        Ok(Some(MergedArtifact {
            storage_path: key,
            rows: merged.rows.len(),
            columns: merged.columns.len(),
        }))
    }

    /// Download and parse every recorded result file of the experiment,
    /// grouped and concatenated by logical table name. Metadata tables
    /// are dropped here.
    async fn collect_tables(
        &self,
        experiment_id: i64,
    ) -> Result<BTreeMap<String, FeatureTable>> {
        let mut tables: BTreeMap<String, FeatureTable> = BTreeMap::new();

        // Failed and terminated batches never recorded result files, so
        // iterating every batch only picks up successful uploads.
        for batch in self.batches.list_batches(experiment_id).await? {
            for file in self.batches.list_result_files(batch.id).await? {
                let logical = file.logical_name().to_string();
                if self.schema.is_metadata_table(&logical) {
                    continue;
                }
                let bytes = self
                    .storage
                    .get(&self.result_bucket, &file.storage_path)
                    .await?;
                let parsed = match FeatureTable::from_bytes(
                    &logical,
                    file.extension().as_deref(),
                    bytes,
                ) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        error!(experiment_id, file = %file.filename, %err, "skipping merge");
                        return Ok(BTreeMap::new());
                    }
                };
                match tables.get_mut(&logical) {
                    Some(existing) => existing.append(parsed),
                    None => {
                        tables.insert(logical, parsed);
                    }
                }
            }
        }
        Ok(tables)
    }

    /// Join non-root tables onto the root table. Row count equals the
    /// root table's row count; unmatched joins leave nulls.
    fn merge_tables(
        &self,
        mut tables: BTreeMap<String, FeatureTable>,
    ) -> Result<FeatureTable> {
        let root = tables.remove(&self.schema.root_table).ok_or_else(|| {
            PlateflowError::Merge(format!(
                "root table {:?} missing from results",
                self.schema.root_table
            ))
        })?;

        let root_site = self.site_address_indices(&root)?;
        let root_key = root.column_index(&self.schema.root_key).ok_or_else(|| {
            PlateflowError::Merge(format!(
                "root table {:?} lacks key column {:?}",
                root.name, self.schema.root_key
            ))
        })?;

        // Start from the root table; its key column and the shared site
        // address keep their names, other columns get the table prefix.
        let mut merged = FeatureTable::new(
            "merged",
            root.columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    if i == root_key {
                        c.clone()
                    } else {
                        self.output_column_name(&root.name, c)
                    }
                })
                .collect(),
        );
        merged.rows = root.rows.clone();

        for (name, child) in tables {
            let child_site = self.site_address_indices(&child)?;
            let parent_column = self.schema.parent_key_column();
            let child_parent = child.column_index(&parent_column).ok_or_else(|| {
                PlateflowError::Merge(format!(
                    "table {name:?} lacks foreign key column {parent_column:?}"
                ))
            })?;

            // Columns this child contributes: everything but the shared
            // site address and the foreign key itself.
            let contributed: Vec<usize> = (0..child.columns.len())
                .filter(|&i| {
                    i != child_parent && !self.schema.is_shared_column(&child.columns[i])
                })
                .collect();
            for &i in &contributed {
                merged
                    .columns
                    .push(self.output_column_name(&name, &child.columns[i]));
            }

            for (row_idx, merged_row) in merged.rows.iter_mut().enumerate() {
                let found = (0..child.rows.len()).find(|&child_idx| {
                    child_site
                        .iter()
                        .zip(&root_site)
                        .all(|(&ci, &ri)| child.value(child_idx, ci) == root.value(row_idx, ri))
                        && child.value(child_idx, child_parent) == root.value(row_idx, root_key)
                });
                match found {
                    Some(child_idx) => {
                        for &i in &contributed {
                            merged_row.push(child.value(child_idx, i).clone());
                        }
                    }
                    None => {
                        merged_row.extend(
                            std::iter::repeat(CellValue::Null).take(contributed.len()),
                        );
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Indices of the shared site-address columns, in schema order.
    fn site_address_indices(&self, table: &FeatureTable) -> Result<Vec<usize>> {
        self.schema
            .shared_metadata_columns
            .iter()
            .map(|column| {
                table.column_index(column).ok_or_else(|| {
                    PlateflowError::Merge(format!(
                        "table {:?} lacks shared column {column:?}",
                        table.name
                    ))
                })
            })
            .collect()
    }

    /// Shared columns keep their names; feature columns get the table
    /// prefix.
    fn output_column_name(&self, table: &str, column: &str) -> String {
        if self.schema.is_shared_column(column) {
            column.to_string()
        } else {
            format!("{table}_{column}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::batch::BatchTracker;
    use crate::catalog::test_support::experiment_spec;
    use crate::catalog::ExperimentCatalog;
    use crate::storage::MemoryObjectStore;
    use crate::store::{FileRef, MemoryStore, WellSiteRef};

    struct Fixture {
        merger: ResultMerger,
        tracker: BatchTracker,
        storage: Arc<MemoryObjectStore>,
        experiment_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let catalog = ExperimentCatalog::new(store.clone());
        catalog.seed_reference_data().await.unwrap();
        let experiment = catalog
            .create_experiment(&experiment_spec(&["B03", "C07"], (1, 1, 1, 1)))
            .await
            .unwrap();
        let storage = Arc::new(MemoryObjectStore::new());
        let merger = ResultMerger::new(
            store.clone(),
            storage.clone(),
            Arc::new(CsvPlotter),
            MergeSchema::default(),
            "experiment-results",
        );
        Fixture {
            merger,
            tracker: BatchTracker::new(store.clone(), store),
            storage,
            experiment_id: experiment.id,
        }
    }

    /// Upload tables for one batch and walk it to done.
    async fn finish_batch(f: &Fixture, batch_id: i64, well: &str, tables: &[(&str, &str)]) {
        f.tracker
            .register_batch(f.experiment_id, batch_id)
            .await
            .unwrap();
        f.tracker
            .mark_processing(f.experiment_id, batch_id)
            .await
            .unwrap();
        f.tracker
            .mark_uploading(f.experiment_id, batch_id)
            .await
            .unwrap();

        let mut files = Vec::new();
        for (filename, contents) in tables {
            let key = format!("batch_{batch_id}/{filename}");
            f.storage
                .put("experiment-results", &key, contents.as_bytes().to_vec())
                .await
                .unwrap();
            files.push(FileRef {
                filename: filename.to_string(),
                storage_path: key,
            });
        }
        f.tracker
            .record_result_files(
                f.experiment_id,
                batch_id,
                &files,
                &[WellSiteRef {
                    well: well.to_string(),
                    site: 1,
                }],
            )
            .await
            .unwrap();
        f.tracker
            .mark_done(f.experiment_id, batch_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn merges_two_batches_into_one_wide_table() {
        let f = fixture().await;
        finish_batch(
            &f,
            0,
            "B03",
            &[
                (
                    "nucleus.csv",
                    "well,site,ObjectNumber,Area\nB03,1,1,40\nB03,1,2,40\n",
                ),
                (
                    "cytoplasm.csv",
                    "well,site,ObjectNumber,Parent_nucleus,Intensity\nB03,1,1,1,0.5\nB03,1,2,2,0.7\n",
                ),
                ("Experiment.csv", "key,value\npipeline,v1\n"),
            ],
        )
        .await;
        finish_batch(
            &f,
            1,
            "C07",
            &[
                ("nucleus.csv", "well,site,ObjectNumber,Area\nC07,1,1,39\n"),
                (
                    "cytoplasm.csv",
                    "well,site,ObjectNumber,Parent_nucleus,Intensity\nC07,1,1,1,0.9\n",
                ),
            ],
        )
        .await;

        let artifact = f
            .merger
            .merge_experiment(f.experiment_id, "proj/exp")
            .await
            .unwrap()
            .expect("artifact");
        // One merged row per nucleus across both batches.
        assert_eq!(artifact.rows, 3);
        assert_eq!(
            artifact.storage_path,
            "proj/exp/merged_features.csv"
        );

        let csv = String::from_utf8(
            f.storage
                .get("experiment-results", &artifact.storage_path)
                .await
                .unwrap(),
        )
        .unwrap();
        let header = csv.lines().next().unwrap();
        assert!(header.contains("well"));
        assert!(header.contains("nucleus_Area"));
        assert!(header.contains("cytoplasm_Intensity"));
        // Metadata tables never reach the artifact.
        assert!(!csv.contains("pipeline"));
        // The joined cytoplasm value for C07 nucleus 1 is present.
        assert!(csv.lines().any(|l| l.starts_with("C07,1,1") && l.ends_with("0.9")));
    }

    #[tokio::test]
    async fn missing_foreign_key_serves_no_result() {
        let f = fixture().await;
        finish_batch(
            &f,
            0,
            "B03",
            &[
                ("nucleus.csv", "well,site,ObjectNumber,Area\nB03,1,1,40\n"),
                (
                    "cytoplasm.csv",
                    "well,site,ObjectNumber,Intensity\nB03,1,1,0.5\n",
                ),
            ],
        )
        .await;

        let artifact = f
            .merger
            .merge_experiment(f.experiment_id, "proj/exp")
            .await
            .unwrap();
        assert!(artifact.is_none());
    }

    #[tokio::test]
    async fn no_completed_batches_means_no_artifact() {
        let f = fixture().await;
        let artifact = f
            .merger
            .merge_experiment(f.experiment_id, "proj/exp")
            .await
            .unwrap();
        assert!(artifact.is_none());

        // A batch that failed contributes nothing either.
        f.tracker.register_batch(f.experiment_id, 0).await.unwrap();
        f.tracker.mark_processing(f.experiment_id, 0).await.unwrap();
        f.tracker.mark_failed(f.experiment_id, 0, 1).await.unwrap();
        let artifact = f
            .merger
            .merge_experiment(f.experiment_id, "proj/exp")
            .await
            .unwrap();
        assert!(artifact.is_none());
    }

    #[tokio::test]
    async fn unparseable_table_serves_no_result() {
        let f = fixture().await;
        finish_batch(
            &f,
            0,
            "B03",
            &[("nucleus.xlsx", "not a table")],
        )
        .await;

        let artifact = f
            .merger
            .merge_experiment(f.experiment_id, "proj/exp")
            .await
            .unwrap();
        assert!(artifact.is_none());
    }
}
