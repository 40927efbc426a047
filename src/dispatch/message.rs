//! Batch submission message for the worker queue.
//!
//! A fixed, versioned schema instead of an open-ended mapping: every
//! field the worker needs is declared here, and `version` lets consumers
//! reject messages they do not understand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::queues;
use crate::store::FileRef;

/// Current message schema version.
pub const BATCH_MESSAGE_VERSION: u32 = 1;

/// One batch submission on the map queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    /// Schema version; consumers reject versions they do not know.
    pub version: u32,
    /// Images the worker should analyze.
    pub file_refs: Vec<FileRef>,
    pub project_name: String,
    pub experiment_name: String,
    pub plate_name: String,
    /// Batch id this submission runs under; fresh per OOM retry.
    pub batch_id: i64,
    /// 0 for the first submission, incremented per OOM retry.
    pub attempt: u32,
    pub metadata: BatchMessageMetadata,
}

/// Bookkeeping attached to every submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessageMetadata {
    pub created_at: DateTime<Utc>,
    /// Correlates retries of the same logical batch across ids.
    pub correlation_id: String,
}

impl Default for BatchMessageMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

impl BatchMessage {
    pub fn new(
        file_refs: Vec<FileRef>,
        project_name: String,
        experiment_name: String,
        plate_name: String,
        batch_id: i64,
    ) -> Self {
        Self {
            version: BATCH_MESSAGE_VERSION,
            file_refs,
            project_name,
            experiment_name,
            plate_name,
            batch_id,
            attempt: 0,
            metadata: BatchMessageMetadata::default(),
        }
    }

    /// The retry submission: same payload and correlation id, fresh batch
    /// id, incremented attempt counter.
    pub fn retry_with(&self, batch_id: i64) -> Self {
        let mut message = self.clone();
        message.batch_id = batch_id;
        message.attempt += 1;
        message
    }

    /// Queue this message belongs on.
    pub fn queue_name(&self) -> &'static str {
        queues::MAP_QUEUE
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> BatchMessage {
        BatchMessage::new(
            vec![FileRef {
                filename: "B03_s1_x0_y0_BF_full.tif".into(),
                storage_path: "proj/exp/B03_s1_x0_y0_BF_full.tif".into(),
            }],
            "proj".into(),
            "exp".into(),
            "plate-1".into(),
            0,
        )
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let m = message();
        let restored = BatchMessage::from_json(m.to_json().unwrap()).unwrap();
        assert_eq!(restored, m);
        assert_eq!(restored.version, BATCH_MESSAGE_VERSION);
    }

    #[test]
    fn retry_keeps_correlation_and_bumps_attempt() {
        let m = message();
        let retry = m.retry_with(5);
        assert_eq!(retry.batch_id, 5);
        assert_eq!(retry.attempt, 1);
        assert_eq!(
            retry.metadata.correlation_id,
            m.metadata.correlation_id
        );
        assert_eq!(retry.file_refs, m.file_refs);
    }
}
