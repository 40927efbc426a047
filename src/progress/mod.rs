//! # Progress Aggregation
//!
//! Answers "how far along is this experiment" by overlaying recorded
//! batch coverage onto the full site grid. Every site starts at 0; a site
//! flips to 1 when some batch recorded it. Failed and terminated batches
//! contribute nothing by construction: result recording only happens
//! after a successful upload, so they never have site rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{PlateflowError, Result};
use crate::store::{BatchStore, CatalogStore};

/// Per-site completion for one experiment.
///
/// Wells and site indices are ordered maps so serialized status reads the
/// same way the plate does.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStatus {
    /// well name -> site index -> 0 (pending) or 1 (finished).
    pub wells: BTreeMap<String, BTreeMap<i64, u8>>,
    pub total_sites: i64,
    pub finished_sites: i64,
}

impl ExperimentStatus {
    pub fn percent_complete(&self) -> f64 {
        if self.total_sites == 0 {
            0.0
        } else {
            100.0 * self.finished_sites as f64 / self.total_sites as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished_sites == self.total_sites
    }
}

/// Computes experiment status from injected store handles.
pub struct ProgressAggregator {
    catalog: Arc<dyn CatalogStore>,
    batches: Arc<dyn BatchStore>,
}

impl ProgressAggregator {
    pub fn new(catalog: Arc<dyn CatalogStore>, batches: Arc<dyn BatchStore>) -> Self {
        Self { catalog, batches }
    }

    /// Build the completion map for one experiment. Fails with `NoSites`
    /// for an experiment whose grid was never ingested, which callers
    /// surface instead of reporting a hollow 100%.
    pub async fn compute_status(&self, experiment_id: i64) -> Result<ExperimentStatus> {
        let sites = self.catalog.list_sites(experiment_id).await?;
        if sites.is_empty() {
            return Err(PlateflowError::NoSites { experiment_id });
        }

        let mut wells: BTreeMap<String, BTreeMap<i64, u8>> = BTreeMap::new();
        let mut by_site_id: HashMap<i64, (String, i64)> = HashMap::with_capacity(sites.len());
        for (site, well_name) in &sites {
            wells
                .entry(well_name.clone())
                .or_default()
                .insert(site.site_index, 0);
            by_site_id.insert(site.id, (well_name.clone(), site.site_index));
        }

        for batch in self.batches.list_batches(experiment_id).await? {
            for batch_site in self.batches.list_batch_sites(batch.id).await? {
                if let Some((well_name, site_index)) = by_site_id.get(&batch_site.site_id) {
                    if let Some(slot) = wells
                        .get_mut(well_name)
                        .and_then(|sites| sites.get_mut(site_index))
                    {
                        *slot = 1;
                    }
                }
            }
        }

        // Count through the name-keyed map, not the raw site rows: a well
        // seeded twice (same name, different cell line) contributes one
        // set of site slots, and the denominator has to match them.
        let total_sites = wells.values().map(|sites| sites.len() as i64).sum();
        let finished_sites = wells
            .values()
            .flat_map(|sites| sites.values())
            .filter(|&&done| done == 1)
            .count() as i64;
        debug!(experiment_id, finished_sites, total_sites, "status computed");

        Ok(ExperimentStatus {
            wells,
            total_sites,
            finished_sites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::batch::BatchTracker;
    use crate::catalog::test_support::experiment_spec;
    use crate::catalog::ExperimentCatalog;
    use crate::store::{FileRef, MemoryStore, WellSiteRef};

    struct Fixture {
        aggregator: ProgressAggregator,
        tracker: BatchTracker,
        store: Arc<MemoryStore>,
        experiment_id: i64,
    }

    async fn fixture(wells: &[&str], counts: (i32, i32, i32, i32)) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let catalog = ExperimentCatalog::new(store.clone());
        catalog.seed_reference_data().await.unwrap();
        let experiment = catalog
            .create_experiment(&experiment_spec(wells, counts))
            .await
            .unwrap();
        Fixture {
            aggregator: ProgressAggregator::new(store.clone(), store.clone()),
            tracker: BatchTracker::new(store.clone(), store.clone()),
            store,
            experiment_id: experiment.id,
        }
    }

    async fn finish_batch(f: &Fixture, batch_id: i64, covered: &[(&str, i64)]) {
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
        let well_sites: Vec<WellSiteRef> = covered
            .iter()
            .map(|(well, site)| WellSiteRef {
                well: well.to_string(),
                site: *site,
            })
            .collect();
        let files = vec![FileRef {
            filename: format!("batch_{batch_id}.csv"),
            storage_path: format!("results/batch_{batch_id}.csv"),
        }];
        f.tracker
            .record_result_files(f.experiment_id, batch_id, &files, &well_sites)
            .await
            .unwrap();
        f.tracker
            .mark_done(f.experiment_id, batch_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn all_sites_finished_across_two_wells() {
        let f = fixture(&["B03", "C07"], (3, 1, 1, 1)).await;
        finish_batch(&f, 0, &[("B03", 1), ("B03", 2), ("B03", 3)]).await;
        finish_batch(&f, 1, &[("C07", 1), ("C07", 2), ("C07", 3)]).await;

        let status = f.aggregator.compute_status(f.experiment_id).await.unwrap();
        assert_eq!(status.total_sites, 6);
        assert_eq!(status.finished_sites, 6);
        assert!(status.is_complete());
        assert_eq!(status.wells["B03"][&2], 1);
        assert!((status.percent_complete() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_batches_contribute_nothing() {
        let f = fixture(&["B03"], (2, 1, 1, 1)).await;
        finish_batch(&f, 0, &[("B03", 1)]).await;

        // Second batch dies mid-processing.
        f.tracker.register_batch(f.experiment_id, 1).await.unwrap();
        f.tracker.mark_processing(f.experiment_id, 1).await.unwrap();
        f.tracker.mark_failed(f.experiment_id, 1, 1).await.unwrap();

        let status = f.aggregator.compute_status(f.experiment_id).await.unwrap();
        assert_eq!(status.total_sites, 2);
        assert_eq!(status.finished_sites, 1);
        assert_eq!(status.wells["B03"][&1], 1);
        assert_eq!(status.wells["B03"][&2], 0);
        assert!((status.percent_complete() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn grid_sites_map_onto_linear_indices() {
        let f = fixture(&["B03"], (2, 2, 1, 1)).await;
        finish_batch(&f, 0, &[("B03", 1), ("B03", 2), ("B03", 3), ("B03", 4)]).await;

        let status = f.aggregator.compute_status(f.experiment_id).await.unwrap();
        assert_eq!(status.total_sites, 4);
        assert_eq!(status.finished_sites, 4);
        let sites = &status.wells["B03"];
        assert_eq!(sites.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn well_seeded_twice_still_reaches_completion() {
        let f = fixture(&["B03"], (2, 1, 1, 1)).await;

        // Seed the same well a second time under a different cell line,
        // with its own site rows (discouraged, not forbidden).
        let (experiment_well, well) = f
            .store
            .list_experiment_wells(f.experiment_id)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(well.name, "B03");
        let duplicate = f
            .store
            .find_or_create_experiment_well(f.experiment_id, well.id, Some("other-line"))
            .await
            .unwrap();
        assert_ne!(duplicate.id, experiment_well.id);
        for site_index in 1..=2 {
            f.store
                .find_or_create_site(duplicate.id, site_index, site_index - 1, 0, 0, 0)
                .await
                .unwrap();
        }

        finish_batch(&f, 0, &[("B03", 1), ("B03", 2)]).await;

        let status = f.aggregator.compute_status(f.experiment_id).await.unwrap();
        assert_eq!(status.total_sites, 2);
        assert_eq!(status.finished_sites, 2);
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn experiment_without_sites_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = ProgressAggregator::new(store.clone(), store);
        let err = aggregator.compute_status(42).await.unwrap_err();
        assert!(matches!(err, PlateflowError::NoSites { experiment_id: 42 }));
    }
}
