//! # Dispatcher
//!
//! Hands analysis batches to the external worker and drives their
//! lifecycle: register, stage inputs, run, upload outputs, record
//! results. An out-of-memory worker exit (code 137) is the single
//! retryable failure; every retry runs under a fresh batch id so the
//! failed attempt stays on record, and the total number of submissions
//! per logical batch is bounded by configuration.
//!
//! Cancellation is cooperative: the dispatcher checks the token at stage
//! boundaries and records the batch as `terminated` before returning.

pub mod message;
pub mod queue;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::BatchTracker;
use crate::catalog::ExperimentCatalog;
use crate::config::PlateflowConfig;
use crate::constants::DISPATCH_FAILURE_EXIT_CODE;
use crate::error::{PlateflowError, Result};
use crate::storage::ObjectStore;
use crate::store::{FileRef, WellSiteRef};

pub use message::{BatchMessage, BatchMessageMetadata, BATCH_MESSAGE_VERSION};
pub use queue::{MemoryWorkerQueue, WorkerQueue};

/// Everything an [`AnalysisWorker`] gets for one attempt: the submission
/// it is running and scratch directories that live exactly as long as the
/// attempt.
pub struct WorkerRequest<'a> {
    pub message: &'a BatchMessage,
    /// Staged input images, one file per [`BatchMessage::file_refs`] entry.
    pub input_dir: &'a Path,
    /// Where the worker writes its feature tables.
    pub output_dir: &'a Path,
}

/// What one worker run produced.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Process exit code; 0 is success, 137 the out-of-memory sentinel.
    pub exit_code: i32,
    /// (well, site) pairs the run covered, reported on success.
    pub well_sites: Vec<WellSiteRef>,
}

/// The external analysis process behind a seam, so tests can script exit
/// codes and outputs without spawning anything.
#[async_trait]
pub trait AnalysisWorker: Send + Sync {
    async fn run(
        &self,
        request: WorkerRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutcome>;
}

/// Submits batches and supervises their attempts.
pub struct Dispatcher {
    catalog: Arc<ExperimentCatalog>,
    tracker: Arc<BatchTracker>,
    storage: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkerQueue>,
    worker: Arc<dyn AnalysisWorker>,
    config: PlateflowConfig,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<ExperimentCatalog>,
        tracker: Arc<BatchTracker>,
        storage: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkerQueue>,
        worker: Arc<dyn AnalysisWorker>,
        config: PlateflowConfig,
    ) -> Self {
        Self {
            catalog,
            tracker,
            storage,
            queue,
            worker,
            config,
        }
    }

    /// Allocate the next batch id for the experiment and enqueue a
    /// submission. Fire-and-forget: completion is observed through batch
    /// state, not a reply.
    pub async fn enqueue_batch(
        &self,
        project_name: &str,
        experiment_name: &str,
        plate_name: &str,
        file_refs: Vec<FileRef>,
    ) -> Result<BatchMessage> {
        let experiment = self
            .catalog
            .experiment_by_name(project_name, experiment_name)
            .await?;
        let batch_id = self.tracker.next_batch_id(experiment.id).await?;
        let message = BatchMessage::new(
            file_refs,
            project_name.to_string(),
            experiment_name.to_string(),
            plate_name.to_string(),
            batch_id,
        );
        self.queue.submit(&message).await?;
        info!(
            experiment_id = experiment.id,
            batch_id,
            files = message.file_refs.len(),
            "batch enqueued"
        );
        Ok(message)
    }

    /// Run a submission to completion, retrying out-of-memory exits under
    /// fresh batch ids until `worker_max_attempts` submissions have been
    /// made. Returns the batch id of the successful attempt.
    pub async fn process(
        &self,
        message: &BatchMessage,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        if message.version != BATCH_MESSAGE_VERSION {
            return Err(PlateflowError::Queue(format!(
                "unsupported message version {} (expected {BATCH_MESSAGE_VERSION})",
                message.version
            )));
        }

        let experiment = self
            .catalog
            .experiment_by_name(&message.project_name, &message.experiment_name)
            .await?;

        let mut current = message.clone();
        loop {
            match self.run_attempt(experiment.id, &current, cancel).await {
                Ok(()) => return Ok(current.batch_id),
                Err(err) if err.is_retryable() => {
                    let next_attempt = current.attempt + 1;
                    if next_attempt >= self.config.worker_max_attempts {
                        error!(
                            experiment_id = experiment.id,
                            batch_id = current.batch_id,
                            attempts = next_attempt,
                            "out-of-memory retries exhausted"
                        );
                        return Err(err);
                    }
                    warn!(
                        experiment_id = experiment.id,
                        batch_id = current.batch_id,
                        next_attempt,
                        "worker ran out of memory; resubmitting under a fresh batch id"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms))
                        .await;
                    let next_id = self.tracker.next_batch_id(experiment.id).await?;
                    current = current.retry_with(next_id);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One submission under one batch id. Temp directories are dropped on
    /// every exit path, success or not.
    async fn run_attempt(
        &self,
        experiment_id: i64,
        message: &BatchMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.tracker
            .register_batch(experiment_id, message.batch_id)
            .await?;
        self.tracker
            .mark_processing(experiment_id, message.batch_id)
            .await?;

        let result = self.drive_attempt(experiment_id, message, cancel).await;
        if let Err(err) = &result {
            // Worker exits and cancellation already recorded their
            // terminal state; anything else (staging, upload, recording)
            // would otherwise strand the batch mid-lifecycle.
            let already_terminal = matches!(
                err,
                PlateflowError::Cancelled { .. }
                    | PlateflowError::WorkerFailed { .. }
                    | PlateflowError::TransientWorker { .. }
            );
            if !already_terminal {
                if let Err(mark_err) = self
                    .tracker
                    .mark_failed(experiment_id, message.batch_id, DISPATCH_FAILURE_EXIT_CODE)
                    .await
                {
                    error!(
                        experiment_id,
                        batch_id = message.batch_id,
                        %mark_err,
                        "could not record batch failure"
                    );
                }
            }
        }
        result
    }

    async fn drive_attempt(
        &self,
        experiment_id: i64,
        message: &BatchMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let input_dir = scratch_dir("stage_inputs")?;
        let output_dir = scratch_dir("collect_outputs")?;

        self.stage_inputs(message, input_dir.path()).await?;

        if cancel.is_cancelled() {
            return self.terminate(experiment_id, message.batch_id).await;
        }

        let outcome = self
            .worker
            .run(
                WorkerRequest {
                    message,
                    input_dir: input_dir.path(),
                    output_dir: output_dir.path(),
                },
                cancel,
            )
            .await?;

        if cancel.is_cancelled() {
            return self.terminate(experiment_id, message.batch_id).await;
        }

        if outcome.exit_code != 0 {
            self.tracker
                .mark_failed(experiment_id, message.batch_id, outcome.exit_code)
                .await?;
            return Err(PlateflowError::from_worker_exit(
                message.batch_id,
                outcome.exit_code,
                message.attempt,
            ));
        }

        self.tracker
            .mark_uploading(experiment_id, message.batch_id)
            .await?;
        let uploaded = self.upload_outputs(message, output_dir.path()).await?;
        self.tracker
            .record_result_files(
                experiment_id,
                message.batch_id,
                &uploaded,
                &outcome.well_sites,
            )
            .await?;
        self.tracker
            .mark_done(experiment_id, message.batch_id)
            .await?;
        info!(
            experiment_id,
            batch_id = message.batch_id,
            result_files = uploaded.len(),
            "batch completed"
        );
        Ok(())
    }

    async fn terminate(&self, experiment_id: i64, batch_id: i64) -> Result<()> {
        self.tracker.mark_terminated(experiment_id, batch_id).await?;
        Err(PlateflowError::Cancelled { batch_id })
    }

    /// Download every referenced image into the scratch input directory,
    /// concurrently.
    async fn stage_inputs(&self, message: &BatchMessage, input_dir: &Path) -> Result<()> {
        try_join_all(message.file_refs.iter().map(|file_ref| async move {
            let bytes = self
                .storage
                .get(&self.config.image_bucket, &file_ref.storage_path)
                .await?;
            tokio::fs::write(input_dir.join(&file_ref.filename), bytes)
                .await
                .map_err(|e| PlateflowError::storage("stage_inputs", e))
        }))
        .await?;
        Ok(())
    }

    /// Upload everything the worker wrote into its output directory to the
    /// result bucket, keyed under the experiment and batch.
    async fn upload_outputs(
        &self,
        message: &BatchMessage,
        output_dir: &Path,
    ) -> Result<Vec<FileRef>> {
        let mut uploaded = Vec::new();
        let mut entries = tokio::fs::read_dir(output_dir)
            .await
            .map_err(|e| PlateflowError::storage("collect_outputs", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PlateflowError::storage("collect_outputs", e))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let key = format!(
                "{}/{}/batch_{}/{}",
                message.project_name, message.experiment_name, message.batch_id, filename
            );
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| PlateflowError::storage("collect_outputs", e))?;
            self.storage
                .put(&self.config.result_bucket, &key, bytes)
                .await?;
            uploaded.push(FileRef {
                filename,
                storage_path: key,
            });
        }
        uploaded.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(uploaded)
    }
}

fn scratch_dir(operation: &'static str) -> Result<TempDir> {
    TempDir::new().map_err(|e| PlateflowError::storage(operation, e))
}
