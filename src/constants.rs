//! # System Constants
//!
//! Central constants that define the operational boundaries of the
//! coordination core: persisted batch status strings, the worker exit-code
//! sentinel for out-of-memory failures, plate layouts, and the reserved
//! names used by the result merger.

/// Worker exit code reserved for out-of-memory kills (SIGKILL after the
/// kernel OOM killer, observed as 128 + 9).
pub const OOM_EXIT_CODE: i32 = 137;

/// Synthetic exit code recorded when an attempt dies before the worker
/// reports one (staging, upload, or result-recording errors). Keeps the
/// batch out of a dangling `processing` state; never retried.
pub const DISPATCH_FAILURE_EXIT_CODE: i32 = -1;

/// Persisted batch status strings. These are the exact values written to
/// the store; [`crate::state_machine::BatchState`] round-trips them.
pub mod batch_status {
    pub const REGISTERED: &str = "registered";
    pub const PROCESSING: &str = "processing";
    pub const UPLOADING: &str = "uploading results to storage";
    pub const DONE: &str = "done";
    pub const TERMINATED: &str = "terminated";
    /// Failure states carry the worker exit code: `failed.<exitcode>`.
    pub const FAILED_PREFIX: &str = "failed.";
}

/// Queue names for worker dispatch.
pub mod queues {
    /// Queue the analysis worker consumes batch submissions from.
    pub const MAP_QUEUE: &str = "map_queue";
}

/// Well layouts fixed by plate type.
pub mod plate_layout {
    /// (rows, columns) for a 96-well plate.
    pub const WELLS_96: (u32, u32) = (8, 12);
    /// (rows, columns) for a 384-well plate.
    pub const WELLS_384: (u32, u32) = (16, 24);

    /// Row/column layout for a supported well count.
    pub fn for_well_count(num_wells: u32) -> Option<(u32, u32)> {
        match num_wells {
            96 => Some(WELLS_96),
            384 => Some(WELLS_384),
            _ => None,
        }
    }
}

/// Reserved names in worker output tables.
pub mod merge {
    /// Logical filenames holding worker run metadata rather than object
    /// data; the merger discards these.
    pub const METADATA_TABLES: &[&str] = &["Experiment", "Image"];

    /// Columns shared across all feature tables; never prefixed.
    pub const SHARED_METADATA_COLUMNS: &[&str] = &["well", "site"];

    /// Default root feature table (the per-object table others reference).
    pub const DEFAULT_ROOT_TABLE: &str = "nucleus";

    /// Primary-key column of the root table.
    pub const DEFAULT_ROOT_KEY: &str = "ObjectNumber";
}

/// Grid spacing units accepted by experiment ingestion. Spatial axes are
/// declared in millimeters, the time axis in seconds; the catalog converts
/// z to micrometers and t to hours before persisting.
pub mod units {
    pub const SPATIAL: &str = "mm";
    pub const TEMPORAL: &str = "s";
}
