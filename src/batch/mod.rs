//! # Batch Tracker
//!
//! Owns the batch aggregate: registers processing batches, drives their
//! state machine through the store, and records which sites and result
//! files each batch produced. Catalog entities are referenced by id only.
//!
//! Batch history is append-only: failed and terminated attempts stay
//! visible forever, which is what makes OOM retries auditable.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{PlateflowError, Result};
use crate::models::{NewProcessingBatch, ProcessingBatch};
use crate::state_machine::{transition, BatchEvent, BatchState};
use crate::store::{BatchStore, CatalogStore, FileRef, WellSiteRef};

/// Batch lifecycle service over injected store handles.
pub struct BatchTracker {
    batches: Arc<dyn BatchStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl BatchTracker {
    pub fn new(batches: Arc<dyn BatchStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self { batches, catalog }
    }

    /// Next unused batch id for an experiment: `max(existing) + 1`, or 0
    /// for the first batch. Retries after an OOM failure therefore always
    /// get a strictly larger id than every prior attempt.
    pub async fn next_batch_id(&self, experiment_id: i64) -> Result<i64> {
        Ok(match self.batches.max_batch_id(experiment_id).await? {
            Some(max) => max + 1,
            None => 0,
        })
    }

    /// Create the batch row in `registered`. Fails with `DuplicateBatch`
    /// when the (experiment, batch id) pair already exists.
    pub async fn register_batch(
        &self,
        experiment_id: i64,
        batch_id: i64,
    ) -> Result<ProcessingBatch> {
        let batch = self
            .batches
            .insert_batch(NewProcessingBatch {
                experiment_id,
                batch_id,
                status: BatchState::Registered.to_string(),
            })
            .await?;
        info!(experiment_id, batch_id, "batch registered");
        Ok(batch)
    }

    /// `registered -> processing`; stamps the start time.
    pub async fn mark_processing(&self, experiment_id: i64, batch_id: i64) -> Result<()> {
        self.apply(experiment_id, batch_id, BatchEvent::Start).await
    }

    /// `processing -> uploading results to storage`.
    pub async fn mark_uploading(&self, experiment_id: i64, batch_id: i64) -> Result<()> {
        self.apply(experiment_id, batch_id, BatchEvent::StartUpload)
            .await
    }

    /// `uploading -> done`; stamps the end time.
    pub async fn mark_done(&self, experiment_id: i64, batch_id: i64) -> Result<()> {
        self.apply(experiment_id, batch_id, BatchEvent::Complete)
            .await
    }

    /// `processing -> failed.<exit code>`; stamps the end time.
    pub async fn mark_failed(
        &self,
        experiment_id: i64,
        batch_id: i64,
        exit_code: i32,
    ) -> Result<()> {
        warn!(experiment_id, batch_id, exit_code, "batch failed");
        self.apply(experiment_id, batch_id, BatchEvent::Fail(exit_code))
            .await
    }

    /// `processing -> terminated`; invoked on operator cancellation so the
    /// batch is visibly abandoned rather than stuck in `processing`.
    pub async fn mark_terminated(&self, experiment_id: i64, batch_id: i64) -> Result<()> {
        warn!(experiment_id, batch_id, "batch terminated by cancellation");
        self.apply(experiment_id, batch_id, BatchEvent::Terminate)
            .await
    }

    /// Attach result files and the (well, site) pairs the batch covered.
    /// Only legal once the batch reached the uploading state; sites are
    /// resolved through the catalog by external (well name, site index)
    /// address.
    pub async fn record_result_files(
        &self,
        experiment_id: i64,
        batch_id: i64,
        files: &[FileRef],
        well_sites: &[WellSiteRef],
    ) -> Result<()> {
        let batch = self.load(experiment_id, batch_id).await?;
        let state = parse_state(&batch)?;
        if !state.allows_result_recording() {
            return Err(PlateflowError::InvalidTransition {
                batch_id,
                from: state.to_string(),
                to: "record result files".to_string(),
            });
        }

        let mut site_ids = Vec::with_capacity(well_sites.len());
        for ws in well_sites {
            let site = self
                .catalog
                .find_site(experiment_id, &ws.well, ws.site)
                .await?
                .ok_or_else(|| {
                    PlateflowError::Validation(format!(
                        "well {:?} site {} not found for experiment {experiment_id}",
                        ws.well, ws.site
                    ))
                })?;
            site_ids.push(site.id);
        }

        self.batches.insert_result_files(batch.id, files).await?;
        self.batches.insert_batch_sites(batch.id, &site_ids).await?;
        info!(
            experiment_id,
            batch_id,
            files = files.len(),
            sites = site_ids.len(),
            "batch results recorded"
        );
        Ok(())
    }

    /// Current state of a batch.
    pub async fn batch_state(&self, experiment_id: i64, batch_id: i64) -> Result<BatchState> {
        let batch = self.load(experiment_id, batch_id).await?;
        parse_state(&batch)
    }

    async fn apply(&self, experiment_id: i64, batch_id: i64, event: BatchEvent) -> Result<()> {
        let batch = self.load(experiment_id, batch_id).await?;
        let state = parse_state(&batch)?;
        let next = transition(batch_id, &state, &event)?;

        let now = Utc::now().naive_utc();
        let started_at = match event {
            BatchEvent::Start => Some(now),
            _ => batch.started_at,
        };
        let ended_at = match event {
            BatchEvent::Complete | BatchEvent::Fail(_) | BatchEvent::Terminate => Some(now),
            _ => batch.ended_at,
        };

        self.batches
            .set_batch_state(batch.id, &next.to_string(), started_at, ended_at)
            .await
    }

    async fn load(&self, experiment_id: i64, batch_id: i64) -> Result<ProcessingBatch> {
        self.batches
            .find_batch(experiment_id, batch_id)
            .await?
            .ok_or_else(|| {
                PlateflowError::Validation(format!(
                    "batch {batch_id} not found for experiment {experiment_id}"
                ))
            })
    }
}

fn parse_state(batch: &ProcessingBatch) -> Result<BatchState> {
    batch
        .state()
        .map_err(|msg| PlateflowError::store("parse_state", msg))
}
