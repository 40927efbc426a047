//! End-to-end coordination flows over the in-memory backends: experiment
//! ingestion, batch submission and processing, progress, and result
//! retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use plateflow_core::catalog::{AxisSpec, ChannelSettings, ExperimentSpec, GridSpec, UploadedImage};
use plateflow_core::config::PlateflowConfig;
use plateflow_core::dispatch::{MemoryWorkerQueue, WorkerOutcome, WorkerRequest};
use plateflow_core::error::Result;
use plateflow_core::services::{PlateflowServices, ServiceDeps};
use plateflow_core::state_machine::BatchState;
use plateflow_core::storage::MemoryObjectStore;
use plateflow_core::store::{FileRef, MemoryStore, WellSiteRef};
use plateflow_core::{AnalysisWorker, ObjectStore, PlateflowError};

fn experiment_spec(wells: &[&str], counts: (i32, i32, i32, i32)) -> ExperimentSpec {
    let spatial = |count, delta| AxisSpec {
        count,
        delta,
        unit: "mm".to_string(),
    };
    ExperimentSpec {
        project_name: "proj".to_string(),
        experiment_name: "exp".to_string(),
        description: Some("integration".to_string()),
        plate_type: "96-CO-3603".to_string(),
        plate_name: "plate-1".to_string(),
        microscope_name: "squid-1".to_string(),
        objective_name: "20x".to_string(),
        cell_line: Some("U2OS".to_string()),
        well_list: wells.iter().map(|w| w.to_string()).collect(),
        grid: GridSpec {
            x: spatial(counts.0, 0.9),
            y: spatial(counts.1, 0.9),
            z: spatial(counts.2, 0.0015),
            t: AxisSpec {
                count: counts.3,
                delta: 0.0,
                unit: "s".to_string(),
            },
        },
        channels: vec![ChannelSettings {
            name: "BF full".to_string(),
            exposure_time_ms: 20.0,
            analog_gain: 0.0,
            illumination_strength: 5.0,
        }],
    }
}

/// Worker double: pops a scripted exit code per run and, on success,
/// writes feature tables for the sites it reports.
struct ScriptedWorker {
    exit_codes: Mutex<Vec<i32>>,
    well_sites: Vec<WellSiteRef>,
}

impl ScriptedWorker {
    fn succeeding(well_sites: Vec<WellSiteRef>) -> Self {
        Self::scripted(vec![], well_sites)
    }

    fn scripted(exit_codes: Vec<i32>, well_sites: Vec<WellSiteRef>) -> Self {
        Self {
            exit_codes: Mutex::new(exit_codes),
            well_sites,
        }
    }
}

#[async_trait]
impl AnalysisWorker for ScriptedWorker {
    async fn run(
        &self,
        request: WorkerRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<WorkerOutcome> {
        let exit_code = {
            let mut codes = self.exit_codes.lock();
            if codes.is_empty() {
                0
            } else {
                codes.remove(0)
            }
        };
        if exit_code == 0 {
            let mut nucleus = String::from("well,site,ObjectNumber,Area\n");
            let mut cytoplasm =
                String::from("well,site,ObjectNumber,Parent_nucleus,Intensity\n");
            for ws in &self.well_sites {
                nucleus.push_str(&format!("{},{},1,40\n", ws.well, ws.site));
                cytoplasm.push_str(&format!("{},{},1,1,0.5\n", ws.well, ws.site));
            }
            std::fs::write(request.output_dir.join("nucleus.csv"), nucleus)
                .map_err(|e| PlateflowError::storage("worker", e))?;
            std::fs::write(request.output_dir.join("cytoplasm.csv"), cytoplasm)
                .map_err(|e| PlateflowError::storage("worker", e))?;
        }
        Ok(WorkerOutcome {
            exit_code,
            well_sites: self.well_sites.clone(),
        })
    }
}

struct Harness {
    services: PlateflowServices,
    queue: Arc<MemoryWorkerQueue>,
    storage: Arc<MemoryObjectStore>,
}

async fn harness(worker: ScriptedWorker) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MemoryObjectStore::new());
    let queue = Arc::new(MemoryWorkerQueue::new());
    let services = PlateflowServices::new(ServiceDeps {
        catalog_store: store.clone(),
        batch_store: store,
        object_store: storage.clone(),
        queue: queue.clone(),
        worker: Arc::new(worker),
        config: PlateflowConfig {
            retry_backoff_ms: 1,
            ..PlateflowConfig::default()
        },
    });
    services.initialize().await.unwrap();
    Harness {
        services,
        queue,
        storage,
    }
}

/// Upload one image per (well, site) and return the file references a
/// submission would carry.
async fn upload_images(h: &Harness, well_sites: &[WellSiteRef]) -> Vec<FileRef> {
    let mut refs = Vec::new();
    for ws in well_sites {
        let filename = format!("{}_s{}_x0_y0_BF_full.tif", ws.well, ws.site);
        let key = format!("proj/exp/{filename}");
        h.storage
            .put("experiment-images", &key, vec![0u8; 8])
            .await
            .unwrap();
        refs.push(FileRef {
            filename,
            storage_path: key,
        });
    }
    refs
}

fn sites(pairs: &[(&str, i64)]) -> Vec<WellSiteRef> {
    pairs
        .iter()
        .map(|(well, site)| WellSiteRef {
            well: well.to_string(),
            site: *site,
        })
        .collect()
}

#[tokio::test]
async fn full_lifecycle_from_ingestion_to_result() {
    let covered = sites(&[("B03", 1), ("B03", 2), ("C07", 1), ("C07", 2)]);
    let h = harness(ScriptedWorker::succeeding(covered.clone())).await;
    h.services
        .create_experiment(&experiment_spec(&["B03", "C07"], (2, 1, 1, 1)))
        .await
        .unwrap();

    let images: Vec<UploadedImage> = upload_images(&h, &covered)
        .await
        .into_iter()
        .map(|r| UploadedImage {
            filename: r.filename,
            storage_path: r.storage_path,
        })
        .collect();
    let registered = h
        .services
        .register_images("proj", "exp", &images)
        .await
        .unwrap();
    assert_eq!(registered, 4);

    // Nothing processed yet: zero progress and no downloadable result.
    let status = h.services.experiment_status("proj", "exp").await.unwrap();
    assert_eq!(status.total_sites, 4);
    assert_eq!(status.finished_sites, 0);
    assert!(h
        .services
        .experiment_result("proj", "exp")
        .await
        .unwrap()
        .is_none());

    // Submit and process the batch.
    let refs = upload_images(&h, &covered).await;
    let message = h
        .services
        .submit_batch("proj", "exp", "plate-1", refs)
        .await
        .unwrap();
    assert_eq!(message.batch_id, 0);
    let queued = h.queue.pop().expect("message on the map queue");
    assert_eq!(queued.batch_id, 0);

    let done_id = h
        .services
        .dispatcher
        .process(&queued, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(done_id, 0);

    let status = h.services.experiment_status("proj", "exp").await.unwrap();
    assert_eq!(status.finished_sites, 4);
    assert!(status.is_complete());
    assert_eq!(status.wells["B03"][&1], 1);
    assert_eq!(status.wells["C07"][&2], 1);

    let artifact = h
        .services
        .experiment_result("proj", "exp")
        .await
        .unwrap()
        .expect("merged artifact");
    assert_eq!(artifact.rows, 4);
    let csv = String::from_utf8(
        h.storage
            .get("experiment-results", &artifact.storage_path)
            .await
            .unwrap(),
    )
    .unwrap();
    assert!(csv.lines().next().unwrap().contains("cytoplasm_Intensity"));
}

#[tokio::test]
async fn experiment_ingestion_is_idempotent() {
    let h = harness(ScriptedWorker::succeeding(vec![])).await;
    let spec = experiment_spec(&["B03"], (2, 2, 1, 1));
    let first = h.services.create_experiment(&spec).await.unwrap();
    let second = h.services.create_experiment(&spec).await.unwrap();
    assert_eq!(first.id, second.id);

    // Site count did not double.
    let status = h.services.experiment_status("proj", "exp").await.unwrap();
    assert_eq!(status.total_sites, 4);
}

#[tokio::test]
async fn duplicate_batch_ids_are_rejected_distinct_ids_accepted() {
    let h = harness(ScriptedWorker::succeeding(vec![])).await;
    let experiment = h
        .services
        .create_experiment(&experiment_spec(&["B03"], (1, 1, 1, 1)))
        .await
        .unwrap();

    h.services
        .tracker
        .register_batch(experiment.id, 0)
        .await
        .unwrap();
    let err = h
        .services
        .tracker
        .register_batch(experiment.id, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, PlateflowError::DuplicateBatch { batch_id: 0, .. }));
    h.services
        .tracker
        .register_batch(experiment.id, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn oom_retry_runs_under_a_strictly_larger_batch_id() {
    let covered = sites(&[("B03", 1)]);
    let h = harness(ScriptedWorker::scripted(vec![137, 0], covered.clone())).await;
    let experiment = h
        .services
        .create_experiment(&experiment_spec(&["B03"], (1, 1, 1, 1)))
        .await
        .unwrap();

    let refs = upload_images(&h, &covered).await;
    let message = h
        .services
        .submit_batch("proj", "exp", "plate-1", refs)
        .await
        .unwrap();
    let done_id = h
        .services
        .dispatcher
        .process(&message, &CancellationToken::new())
        .await
        .unwrap();
    assert!(done_id > message.batch_id);

    // The failed attempt stays on record with its exit code.
    assert_eq!(
        h.services
            .tracker
            .batch_state(experiment.id, message.batch_id)
            .await
            .unwrap(),
        BatchState::Failed(137)
    );
    assert_eq!(
        h.services
            .tracker
            .batch_state(experiment.id, done_id)
            .await
            .unwrap(),
        BatchState::Done
    );

    // Progress counts only the successful attempt, once.
    let status = h.services.experiment_status("proj", "exp").await.unwrap();
    assert_eq!(status.finished_sites, 1);
}

#[tokio::test]
async fn cancellation_mid_submission_is_recorded_as_terminated() {
    let covered = sites(&[("B03", 1)]);
    let h = harness(ScriptedWorker::succeeding(covered.clone())).await;
    let experiment = h
        .services
        .create_experiment(&experiment_spec(&["B03"], (1, 1, 1, 1)))
        .await
        .unwrap();

    let refs = upload_images(&h, &covered).await;
    let message = h
        .services
        .submit_batch("proj", "exp", "plate-1", refs)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .services
        .dispatcher
        .process(&message, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PlateflowError::Cancelled { .. }));
    assert_eq!(
        h.services
            .tracker
            .batch_state(experiment.id, message.batch_id)
            .await
            .unwrap(),
        BatchState::Terminated
    );
    // Terminated work contributes no progress and no result.
    let status = h.services.experiment_status("proj", "exp").await.unwrap();
    assert_eq!(status.finished_sites, 0);
    assert!(h
        .services
        .experiment_result("proj", "exp")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rejects_grid_spacing_in_unexpected_units() {
    let h = harness(ScriptedWorker::succeeding(vec![])).await;
    let mut spec = experiment_spec(&["B03"], (1, 1, 1, 1));
    spec.grid.z.unit = "um".to_string();
    let err = h.services.create_experiment(&spec).await.unwrap_err();
    assert!(matches!(
        err,
        PlateflowError::UnsupportedUnit { axis: 'z', .. }
    ));
}
