//! # Batch State Machine
//!
//! Lifecycle states and transition rules for one processing batch:
//!
//! ```text
//! registered -> processing -> uploading -> done
//!                  |              |-> failed.<exit code>
//!                  |-> failed.<exit code>
//!                  |-> terminated
//! ```
//!
//! `done`, `terminated`, and every `failed.<code>` state are terminal.
//! Transition legality lives here; persistence of the resulting status
//! string is the batch tracker's job.

mod states;

pub use states::{BatchEvent, BatchState};

use crate::error::{PlateflowError, Result};

/// Apply `event` to `state`, returning the next state or an
/// `InvalidTransition` error naming both endpoints.
pub fn transition(batch_id: i64, state: &BatchState, event: &BatchEvent) -> Result<BatchState> {
    let next = match (state, event) {
        (BatchState::Registered, BatchEvent::Start) => Some(BatchState::Processing),
        (BatchState::Processing, BatchEvent::StartUpload) => Some(BatchState::Uploading),
        (BatchState::Uploading, BatchEvent::Complete) => Some(BatchState::Done),
        (BatchState::Processing, BatchEvent::Fail(exit_code))
        | (BatchState::Uploading, BatchEvent::Fail(exit_code)) => {
            Some(BatchState::Failed(*exit_code))
        }
        (BatchState::Processing, BatchEvent::Terminate) => Some(BatchState::Terminated),
        _ => None,
    };

    next.ok_or_else(|| PlateflowError::InvalidTransition {
        batch_id,
        from: state.to_string(),
        to: event.target_description().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let mut state = BatchState::Registered;
        for event in [
            BatchEvent::Start,
            BatchEvent::StartUpload,
            BatchEvent::Complete,
        ] {
            state = transition(1, &state, &event).unwrap();
        }
        assert_eq!(state, BatchState::Done);
        assert!(state.is_terminal());
    }

    #[test]
    fn failure_from_processing_or_uploading() {
        let state = transition(1, &BatchState::Registered, &BatchEvent::Start).unwrap();
        let failed = transition(1, &state, &BatchEvent::Fail(137)).unwrap();
        assert_eq!(failed, BatchState::Failed(137));
        assert!(failed.is_terminal());

        // An upload that dies is a failure too, not a stuck upload.
        let failed_upload =
            transition(1, &BatchState::Uploading, &BatchEvent::Fail(-1)).unwrap();
        assert_eq!(failed_upload, BatchState::Failed(-1));

        let err = transition(1, &BatchState::Registered, &BatchEvent::Fail(1)).unwrap_err();
        assert!(matches!(err, PlateflowError::InvalidTransition { .. }));
    }

    #[test]
    fn terminate_only_from_processing() {
        let terminated =
            transition(1, &BatchState::Processing, &BatchEvent::Terminate).unwrap();
        assert_eq!(terminated, BatchState::Terminated);

        assert!(transition(1, &BatchState::Uploading, &BatchEvent::Terminate).is_err());
        assert!(transition(1, &BatchState::Done, &BatchEvent::Terminate).is_err());
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        assert!(transition(1, &BatchState::Registered, &BatchEvent::StartUpload).is_err());
        assert!(transition(1, &BatchState::Registered, &BatchEvent::Complete).is_err());
        assert!(transition(1, &BatchState::Processing, &BatchEvent::Complete).is_err());
        assert!(transition(1, &BatchState::Done, &BatchEvent::Start).is_err());
        assert!(transition(1, &BatchState::Failed(1), &BatchEvent::Start).is_err());
    }
}
