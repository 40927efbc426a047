//! # Service Facade
//!
//! Wires the components together over injected store, storage, queue and
//! worker handles, and exposes the operations the outer HTTP surface
//! calls: listing, ingestion, submission, status, and result retrieval.
//!
//! Construction is explicit dependency injection; nothing in this crate
//! reaches for a global.

use std::sync::Arc;

use crate::batch::BatchTracker;
use crate::catalog::{ExperimentCatalog, ExperimentSpec, UploadedImage};
use crate::config::PlateflowConfig;
use crate::dispatch::{AnalysisWorker, BatchMessage, Dispatcher, WorkerQueue};
use crate::error::Result;
use crate::merge::{CsvPlotter, MergeSchema, MergedArtifact, Plotter, ResultMerger};
use crate::models::Experiment;
use crate::progress::{ExperimentStatus, ProgressAggregator};
use crate::storage::ObjectStore;
use crate::store::{BatchStore, CatalogStore, FileRef};

/// All dependency handles needed to assemble [`PlateflowServices`].
pub struct ServiceDeps {
    pub catalog_store: Arc<dyn CatalogStore>,
    pub batch_store: Arc<dyn BatchStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn WorkerQueue>,
    pub worker: Arc<dyn AnalysisWorker>,
    pub config: PlateflowConfig,
}

/// The assembled coordination core.
pub struct PlateflowServices {
    pub catalog: Arc<ExperimentCatalog>,
    pub tracker: Arc<BatchTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub progress: Arc<ProgressAggregator>,
    pub merger: Arc<ResultMerger>,
}

impl PlateflowServices {
    pub fn new(deps: ServiceDeps) -> Self {
        Self::with_plotter(deps, Arc::new(CsvPlotter))
    }

    pub fn with_plotter(deps: ServiceDeps, plotter: Arc<dyn Plotter>) -> Self {
        let catalog = Arc::new(ExperimentCatalog::new(deps.catalog_store.clone()));
        let tracker = Arc::new(BatchTracker::new(
            deps.batch_store.clone(),
            deps.catalog_store.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            catalog.clone(),
            tracker.clone(),
            deps.object_store.clone(),
            deps.queue,
            deps.worker,
            deps.config.clone(),
        ));
        let progress = Arc::new(ProgressAggregator::new(
            deps.catalog_store,
            deps.batch_store.clone(),
        ));
        let merger = Arc::new(ResultMerger::new(
            deps.batch_store,
            deps.object_store,
            plotter,
            MergeSchema::default(),
            deps.config.result_bucket.clone(),
        ));
        Self {
            catalog,
            tracker,
            dispatcher,
            progress,
            merger,
        }
    }

    /// Seed reference data; call once at startup.
    pub async fn initialize(&self) -> Result<()> {
        self.catalog.seed_reference_data().await
    }

    pub async fn list_projects(&self) -> Result<Vec<String>> {
        self.catalog.list_projects().await
    }

    pub async fn list_experiments(&self, project: &str) -> Result<Vec<String>> {
        self.catalog.list_experiments(project).await
    }

    pub async fn create_experiment(&self, spec: &ExperimentSpec) -> Result<Experiment> {
        self.catalog.create_experiment(spec).await
    }

    pub async fn register_images(
        &self,
        project: &str,
        experiment: &str,
        images: &[UploadedImage],
    ) -> Result<usize> {
        let experiment = self.catalog.experiment_by_name(project, experiment).await?;
        self.catalog.register_images(&experiment, images).await
    }

    /// Enqueue one analysis batch; completion is observed via status.
    pub async fn submit_batch(
        &self,
        project: &str,
        experiment: &str,
        plate_name: &str,
        file_refs: Vec<FileRef>,
    ) -> Result<BatchMessage> {
        self.dispatcher
            .enqueue_batch(project, experiment, plate_name, file_refs)
            .await
    }

    /// Per-site completion of one experiment, addressed by name.
    pub async fn experiment_status(
        &self,
        project: &str,
        experiment: &str,
    ) -> Result<ExperimentStatus> {
        let experiment = self.catalog.experiment_by_name(project, experiment).await?;
        self.progress.compute_status(experiment.id).await
    }

    /// Merged result artifact for an experiment; `None` until at least
    /// one batch completed, and on merge failure.
    pub async fn experiment_result(
        &self,
        project: &str,
        experiment_name: &str,
    ) -> Result<Option<MergedArtifact>> {
        let experiment = self
            .catalog
            .experiment_by_name(project, experiment_name)
            .await?;
        self.merger
            .merge_experiment(experiment.id, &format!("{project}/{experiment_name}"))
            .await
    }
}
