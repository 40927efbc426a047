//! # Persistence Seams
//!
//! Async repository traits over the two aggregates. Components receive
//! explicit store handles (dependency injection) so tests substitute the
//! in-memory implementation and production wires the Postgres one.
//!
//! The store is the single source of truth for batch state; individual
//! state transitions rely on row-level atomicity of one update, never on
//! application-level locks.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;
use crate::models::{
    BatchSite, Channel, Experiment, ExperimentChannel, ExperimentWell, Image, Microscope,
    NewChannel, NewExperiment, NewExperimentChannel, NewImage, NewProcessingBatch, Objective,
    Plate, PlateType, ProcessingBatch, Project, ResultFile, Site, Well,
};

/// A result file reference as reported by the worker: logical filename
/// plus where the bytes landed in object storage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileRef {
    pub filename: String,
    pub storage_path: String,
}

/// A (well name, 1-indexed site) pair, the external addressing scheme the
/// worker reports completed sites in.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WellSiteRef {
    pub well: String,
    pub site: i64,
}

/// Catalog aggregate persistence. Lookup-or-create operations are keyed by
/// each entity's natural unique name; plate types and wells are pre-seeded
/// reference data and only support strict lookups plus explicit seeding.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_project(&self, name: &str) -> Result<Option<Project>>;
    async fn find_or_create_project(&self, name: &str) -> Result<Project>;
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn find_plate_type(&self, model_name: &str) -> Result<Option<PlateType>>;
    /// Seeds one plate type together with its full well list.
    async fn insert_plate_type(
        &self,
        model_name: &str,
        manufacturer: &str,
        brand: &str,
        num_wells: i32,
        well_names: &[String],
    ) -> Result<PlateType>;

    async fn find_well(&self, plate_type_id: i64, name: &str) -> Result<Option<Well>>;

    async fn find_or_create_plate(&self, plate_type_id: i64, barcode: &str) -> Result<Plate>;
    async fn find_or_create_microscope(&self, name: &str) -> Result<Microscope>;
    async fn find_or_create_objective(&self, name: &str) -> Result<Objective>;

    async fn find_channel(&self, name: &str) -> Result<Option<Channel>>;
    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel>;

    async fn find_experiment(&self, project_id: i64, name: &str) -> Result<Option<Experiment>>;
    async fn insert_experiment(&self, experiment: NewExperiment) -> Result<Experiment>;
    async fn list_experiments(&self, project_id: i64) -> Result<Vec<Experiment>>;

    /// Idempotent per (experiment, well): returns the existing join row if
    /// one exists with the same cell line.
    async fn find_or_create_experiment_well(
        &self,
        experiment_id: i64,
        well_id: i64,
        cell_line: Option<&str>,
    ) -> Result<ExperimentWell>;
    /// Experiment wells joined with their well rows (names included).
    async fn list_experiment_wells(&self, experiment_id: i64)
        -> Result<Vec<(ExperimentWell, Well)>>;

    /// Idempotent per (experiment well, site index): re-running experiment
    /// ingestion must not duplicate site rows.
    async fn find_or_create_site(
        &self,
        experiment_well_id: i64,
        site_index: i64,
        site_x: i64,
        site_y: i64,
        site_z: i64,
        site_t: i64,
    ) -> Result<Site>;
    /// All sites of an experiment, each paired with its well name.
    async fn list_sites(&self, experiment_id: i64) -> Result<Vec<(Site, String)>>;
    /// Resolve one site by external (well name, site index) address.
    async fn find_site(
        &self,
        experiment_id: i64,
        well_name: &str,
        site_index: i64,
    ) -> Result<Option<Site>>;

    async fn insert_experiment_channel(
        &self,
        channel: NewExperimentChannel,
    ) -> Result<ExperimentChannel>;
    async fn list_experiment_channels(&self, experiment_id: i64)
        -> Result<Vec<ExperimentChannel>>;

    async fn insert_images(&self, images: Vec<NewImage>) -> Result<Vec<Image>>;
}

/// Batch aggregate persistence. Batch rows are append-only history;
/// status updates mutate in place but rows are never deleted.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Fails with `DuplicateBatch` when (experiment, batch id) exists.
    async fn insert_batch(&self, batch: NewProcessingBatch) -> Result<ProcessingBatch>;
    async fn find_batch(&self, experiment_id: i64, batch_id: i64)
        -> Result<Option<ProcessingBatch>>;
    async fn list_batches(&self, experiment_id: i64) -> Result<Vec<ProcessingBatch>>;
    /// Highest batch id used so far for the experiment, if any.
    async fn max_batch_id(&self, experiment_id: i64) -> Result<Option<i64>>;

    /// Overwrites status and both timestamps of one batch row. The single
    /// UPDATE is the atomicity unit the state machine relies on.
    async fn set_batch_state(
        &self,
        row_id: i64,
        status: &str,
        started_at: Option<NaiveDateTime>,
        ended_at: Option<NaiveDateTime>,
    ) -> Result<()>;

    async fn insert_batch_sites(&self, processing_batch_id: i64, site_ids: &[i64]) -> Result<()>;
    async fn list_batch_sites(&self, processing_batch_id: i64) -> Result<Vec<BatchSite>>;

    async fn insert_result_files(
        &self,
        processing_batch_id: i64,
        files: &[FileRef],
    ) -> Result<()>;
    async fn list_result_files(&self, processing_batch_id: i64) -> Result<Vec<ResultFile>>;
}
