//! Batch aggregate: processing batches, the sites they claim, and the
//! result files they produced. Rows are append-only history; failed and
//! terminated attempts are kept, never deleted.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::state_machine::BatchState;

/// One unit of work submitted to the analysis worker.
///
/// `batch_id` is the caller-visible integer id, unique within an
/// experiment and strictly increasing across OOM retries; `id` is the
/// surrogate row key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProcessingBatch {
    pub id: i64,
    pub experiment_id: i64,
    pub batch_id: i64,
    pub status: String,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl ProcessingBatch {
    /// Parse the persisted status string. Rows written by this crate
    /// always parse; a foreign writer's garbage surfaces as an error.
    pub fn state(&self) -> Result<BatchState, String> {
        self.status.parse()
    }
}

/// Batch row before insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProcessingBatch {
    pub experiment_id: i64,
    pub batch_id: i64,
    pub status: String,
}

/// Records that a batch processed one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BatchSite {
    pub id: i64,
    pub processing_batch_id: i64,
    pub site_id: i64,
}

/// One output table uploaded by the worker for a batch, e.g. logical
/// filename "nucleus.parquet" at some storage path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ResultFile {
    pub id: i64,
    pub processing_batch_id: i64,
    pub storage_path: String,
    pub filename: String,
}

impl ResultFile {
    /// Logical table name: the filename without its extension.
    pub fn logical_name(&self) -> &str {
        match self.filename.rsplit_once('.') {
            Some((stem, _ext)) => stem,
            None => &self.filename,
        }
    }

    /// File extension, lowercased, if any.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_name_strips_extension() {
        let f = ResultFile {
            id: 1,
            processing_batch_id: 1,
            storage_path: "results/nucleus.parquet".into(),
            filename: "nucleus.parquet".into(),
        };
        assert_eq!(f.logical_name(), "nucleus");
        assert_eq!(f.extension().as_deref(), Some("parquet"));
    }

    #[test]
    fn extensionless_filename_is_its_own_logical_name() {
        let f = ResultFile {
            id: 1,
            processing_batch_id: 1,
            storage_path: "results/raw".into(),
            filename: "raw".into(),
        };
        assert_eq!(f.logical_name(), "raw");
        assert_eq!(f.extension(), None);
    }
}
