//! # Data Model
//!
//! Entity structs mapping the catalog and batch aggregates. The catalog
//! side (projects through sites and channels) is owned exclusively by
//! [`crate::catalog::ExperimentCatalog`]; the batch side (processing
//! batches, batch sites, result files) by [`crate::batch::BatchTracker`].
//! Batch entities reference catalog entities by id only.

pub mod batch;
pub mod catalog;

pub use batch::{BatchSite, NewProcessingBatch, ProcessingBatch, ResultFile};
pub use catalog::{
    Channel, Experiment, ExperimentChannel, ExperimentWell, Image, Microscope, NewChannel,
    NewExperiment, NewExperimentChannel, NewImage, Objective, Plate, PlateType, Project, Site,
    Well,
};
