//! Deciding how a streaming session ended

use std::fmt;
use streamer::Status;

/// What ended the streaming loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    DurationElapsed,
    EngineFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::DurationElapsed => write!(f, "duration elapsed"),
            StopReason::EngineFailed => write!(f, "engine failed"),
        }
    }
}

/// Whether the session failed
///
/// Only a failure seen while still streaming counts. A completion that lands
/// on the bus just before its cancellation marks the engine failed during
/// shutdown; that is reported but is not an error.
pub fn session_failed(reason: StopReason, before_stop: Status) -> bool {
    reason == StopReason::EngineFailed || before_stop == Status::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_stop_is_not_a_failure() {
        assert!(!session_failed(StopReason::Interrupted, Status::Streaming));
        assert!(!session_failed(StopReason::DurationElapsed, Status::Streaming));
    }

    #[test]
    fn test_failure_while_streaming() {
        assert!(session_failed(StopReason::EngineFailed, Status::Failed));
        // Failed between the last poll and the stop request
        assert!(session_failed(StopReason::Interrupted, Status::Failed));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(StopReason::DurationElapsed.to_string(), "duration elapsed");
    }
}
