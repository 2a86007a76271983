//! Frame bridge between the USB event-loop thread and the Tokio runtime
//!
//! Sample frames are handed over from the completion callback, which runs on
//! the USB event thread and must never block. The sending half therefore only
//! ever uses `try_send`: when the consumer falls behind, frames are dropped
//! and counted instead of stalling the transfer ring.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Counters shared by both halves of the bridge
#[derive(Debug, Default)]
struct BridgeCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of the bridge counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames queued for the consumer
    pub delivered: u64,
    /// Frames dropped because the queue was full
    pub dropped: u64,
    /// Payload bytes queued for the consumer
    pub bytes: u64,
}

impl BridgeCounters {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Handle for the USB thread (never blocks)
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<Bytes>,
    counters: Arc<BridgeCounters>,
}

impl FrameSender {
    /// Copy `frame` into the queue
    ///
    /// Returns `false` once the receiving half is gone.
    pub fn push(&self, frame: &[u8]) -> bool {
        match self.tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Frame queue full, dropping {} bytes", frame.len());
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the channel; the receiver drains what is queued and then ends
    pub fn close(&self) {
        self.tx.close();
    }

    /// Current counters
    pub fn stats(&self) -> BridgeStats {
        self.counters.snapshot()
    }
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct FrameReceiver {
    rx: Receiver<Bytes>,
    counters: Arc<BridgeCounters>,
}

impl FrameReceiver {
    /// Receive the next frame, or `None` once the sender closed and the queue is empty
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv().await.ok()
    }

    /// Receive without waiting
    pub fn try_recv(&self) -> crate::Result<Option<Bytes>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(async_channel::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(crate::Error::Channel(e.to_string())),
        }
    }

    /// Frames currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Current counters
    pub fn stats(&self) -> BridgeStats {
        self.counters.snapshot()
    }
}

/// Create the frame bridge between the USB thread and Tokio
///
/// Returns (FrameSender for the USB thread, FrameReceiver for Tokio)
pub fn create_frame_bridge(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let counters = Arc::new(BridgeCounters::default());

    (
        FrameSender {
            tx,
            counters: counters.clone(),
        },
        FrameReceiver { rx, counters },
    )
}
