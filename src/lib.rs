#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Plateflow Core
//!
//! Coordination core for plate-based imaging experiments: it tracks what
//! an automated microscope acquired, hands image batches to an external
//! analysis worker, aggregates per-site progress, and merges the worker's
//! feature tables into one downloadable artifact.
//!
//! ## Architecture
//!
//! Two aggregates own all persistent state. The **catalog** holds the
//! experiment's physical description: projects, plates, wells, the site
//! grid, imaging channels, and uploaded images. The **batch tracker**
//! holds processing history: batches, their state machine, the sites they
//! covered, and the result files they produced. Everything else derives
//! from those two: the dispatcher drives batches through their lifecycle,
//! the progress aggregator overlays completed coverage onto the grid, and
//! the result merger joins feature tables out of object storage.
//!
//! All components receive their store, storage, queue and worker handles
//! through constructors; tests wire the in-memory implementations and
//! production wires PostgreSQL plus an S3-compatible client.
//!
//! ## Module Organization
//!
//! - [`catalog`] - Experiment ingestion, reference data, image metadata
//! - [`grid`] - Linear site index to (x, y, z, t) decomposition
//! - [`batch`] - Batch lifecycle tracking over the state machine
//! - [`state_machine`] - Batch states, events, and legal transitions
//! - [`dispatch`] - Worker submission, OOM retry, cancellation
//! - [`progress`] - Per-site completion aggregation
//! - [`merge`] - Result table merging and artifact rendering
//! - [`services`] - Facade wiring the components together
//! - [`store`] - Repository traits, in-memory and Postgres backends
//! - [`storage`] - Object storage seam
//! - [`models`] - Persisted row types
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use plateflow_core::config::PlateflowConfig;
//! use plateflow_core::store::MemoryStore;
//!
//! # async fn example() -> plateflow_core::Result<()> {
//! let _config = PlateflowConfig::from_env()?;
//! let _store = Arc::new(MemoryStore::new());
//! // Wire PlateflowServices with store handles, an object store, a
//! // worker queue and an analysis worker; see `services`.
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod logging;
pub mod merge;
pub mod models;
pub mod progress;
pub mod services;
pub mod state_machine;
pub mod storage;
pub mod store;

pub use batch::BatchTracker;
pub use catalog::{ExperimentCatalog, ExperimentSpec, UploadedImage};
pub use config::PlateflowConfig;
pub use constants::{DISPATCH_FAILURE_EXIT_CODE, OOM_EXIT_CODE};
pub use dispatch::{AnalysisWorker, BatchMessage, Dispatcher, WorkerQueue};
pub use error::{PlateflowError, Result};
pub use grid::{coords_to_site, site_to_coords, GridCounts, SiteCoords};
pub use merge::{MergeSchema, MergedArtifact, ResultMerger};
pub use progress::{ExperimentStatus, ProgressAggregator};
pub use services::{PlateflowServices, ServiceDeps};
pub use state_machine::{BatchEvent, BatchState};
pub use storage::{MemoryObjectStore, ObjectStore};
pub use store::{BatchStore, CatalogStore, FileRef, MemoryStore, PostgresStore, WellSiteRef};
