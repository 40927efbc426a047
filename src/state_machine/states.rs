use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::batch_status;

/// Batch lifecycle states. The persisted representation is the plain
/// status string produced by `Display` and consumed by `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Row created, not yet handed to the worker.
    Registered,
    /// Worker is running the batch.
    Processing,
    /// Worker finished, result tables are being uploaded to storage.
    Uploading,
    /// All results recorded.
    Done,
    /// Operator-initiated cancellation observed mid-batch.
    Terminated,
    /// Worker exited nonzero; carries the exit code.
    Failed(i32),
}

impl BatchState {
    /// Terminal states allow no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Terminated | Self::Failed(_))
    }

    /// True while the worker holds the batch.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Uploading)
    }

    /// True once the batch's result files may be recorded.
    pub fn allows_result_recording(&self) -> bool {
        matches!(self, Self::Uploading | Self::Done)
    }

    /// Out-of-memory failure, the only retryable terminal state.
    pub fn is_oom(&self) -> bool {
        matches!(self, Self::Failed(code) if *code == crate::constants::OOM_EXIT_CODE)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "{}", batch_status::REGISTERED),
            Self::Processing => write!(f, "{}", batch_status::PROCESSING),
            Self::Uploading => write!(f, "{}", batch_status::UPLOADING),
            Self::Done => write!(f, "{}", batch_status::DONE),
            Self::Terminated => write!(f, "{}", batch_status::TERMINATED),
            Self::Failed(code) => write!(f, "{}{code}", batch_status::FAILED_PREFIX),
        }
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            batch_status::REGISTERED => Ok(Self::Registered),
            batch_status::PROCESSING => Ok(Self::Processing),
            batch_status::UPLOADING => Ok(Self::Uploading),
            batch_status::DONE => Ok(Self::Done),
            batch_status::TERMINATED => Ok(Self::Terminated),
            other => match other.strip_prefix(batch_status::FAILED_PREFIX) {
                Some(code) => code
                    .parse::<i32>()
                    .map(Self::Failed)
                    .map_err(|_| format!("Invalid batch status: {other}")),
                None => Err(format!("Invalid batch status: {other}")),
            },
        }
    }
}

/// Events that drive batch state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchEvent {
    /// Worker picked up the batch.
    Start,
    /// Worker finished computation, upload begins.
    StartUpload,
    /// Upload finished, batch complete.
    Complete,
    /// Worker exited nonzero with this exit code.
    Fail(i32),
    /// Cancellation signal observed mid-batch.
    Terminate,
}

impl BatchEvent {
    /// Event name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StartUpload => "start_upload",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Terminate => "terminate",
        }
    }

    /// Human-readable description of the state this event aims at; used in
    /// invalid-transition errors.
    pub fn target_description(&self) -> &'static str {
        match self {
            Self::Start => batch_status::PROCESSING,
            Self::StartUpload => batch_status::UPLOADING,
            Self::Complete => batch_status::DONE,
            Self::Fail(_) => "failed",
            Self::Terminate => batch_status::TERMINATED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for state in [
            BatchState::Registered,
            BatchState::Processing,
            BatchState::Uploading,
            BatchState::Done,
            BatchState::Terminated,
            BatchState::Failed(137),
            BatchState::Failed(1),
        ] {
            let s = state.to_string();
            assert_eq!(s.parse::<BatchState>().unwrap(), state);
        }
    }

    #[test]
    fn uploading_uses_legacy_status_string() {
        assert_eq!(
            BatchState::Uploading.to_string(),
            "uploading results to storage"
        );
    }

    #[test]
    fn failed_status_carries_exit_code() {
        assert_eq!(BatchState::Failed(137).to_string(), "failed.137");
        assert!(BatchState::Failed(137).is_oom());
        assert!(!BatchState::Failed(1).is_oom());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("pending".parse::<BatchState>().is_err());
        assert!("failed.abc".parse::<BatchState>().is_err());
    }
}
