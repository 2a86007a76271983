//! Engine state machine

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an [`AdcEngine`](super::AdcEngine)
///
/// ```text
/// OFF -> READY -> STREAMING -> CANCELLED -> READY
///          \          |           /
///           +----> FAILED <------+
/// ```
///
/// `Failed` is terminal; the engine has to be closed and reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Off = 0,
    Ready = 1,
    Streaming = 2,
    Cancelled = 3,
    Failed = 0xff,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Off,
            1 => Status::Ready,
            2 => Status::Streaming,
            3 => Status::Cancelled,
            _ => Status::Failed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Off => "off",
            Status::Ready => "ready",
            Status::Streaming => "streaming",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status shared between control calls and the completion path
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Move from `current` to `new`; on failure returns the observed status
    pub(crate) fn transition(&self, current: Status, new: Status) -> Result<(), Status> {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(Status::from_u8)
    }

    /// Enter `Cancelled` unless the engine has already failed
    ///
    /// Returns the previous status.
    pub(crate) fn cancel(&self) -> Status {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                (value != Status::Failed as u8).then_some(Status::Cancelled as u8)
            });
        match previous {
            Ok(value) | Err(value) => Status::from_u8(value),
        }
    }
}
