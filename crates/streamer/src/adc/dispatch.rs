//! Completion dispatcher
//!
//! Runs on whatever thread drives event processing. The only state it shares
//! with `start`/`stop` is the status byte and the active-transfer counter.

use super::pool::TransferRing;
use super::status::Status;
use super::Shared;
use crate::transport::{BulkTransport, Completion, CompletionHandler, TransferOutcome};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, trace, warn};

impl<T: BulkTransport> CompletionHandler for Shared<T> {
    fn on_completion(&self, completion: Completion) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        let slot = completion.slot;
        let Some(transfer) = ring.transfer(slot) else {
            warn!("Completion for unknown slot {}", slot);
            return;
        };

        match completion.outcome {
            TransferOutcome::Completed if self.status.load() == Status::Streaming => {
                self.deliver(ring, completion);

                match self.transport.submit(transfer) {
                    // stop() may have run its cancel pass while this slot was
                    // between completion and resubmission
                    Ok(()) if self.status.load() != Status::Streaming => {
                        self.cancel_slot(ring, slot);
                    }
                    Ok(()) => {}
                    Err(e) => {
                        error!("Resubmitting slot {} failed: {}", slot, e);
                        self.fail_and_drain(ring, slot);
                    }
                }
            }
            TransferOutcome::Completed => {
                warn!(
                    "Slot {} completed while engine is {}",
                    slot,
                    self.status.load()
                );
                self.fail_and_drain(ring, slot);
            }
            TransferOutcome::Cancelled => self.retire(slot),
            outcome => {
                error!("Bulk transfer on slot {} failed: {:?}", slot, outcome);
                self.fail_and_drain(ring, slot);
            }
        }
    }
}

impl<T: BulkTransport> Shared<T> {
    /// Hand the frame to the sink for the duration of the call
    fn deliver(&self, ring: &TransferRing<T>, completion: Completion) {
        let (Some(sink), Some(frame)) = (self.sink.as_deref(), ring.frame(completion.slot)) else {
            return;
        };
        trace!(
            "Slot {} delivered {} bytes",
            completion.slot,
            completion.actual_length
        );
        self.transport
            .with_frame(frame, completion.actual_length, &mut |bytes| {
                sink.on_samples(bytes)
            });
    }

    /// Account for one cancelled transfer
    ///
    /// Whichever completion takes the counter from 1 to 0 performs the
    /// CANCELLED to READY transition.
    fn retire(&self, slot: usize) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        trace!("Slot {} retired, {} still active", slot, previous - 1);

        if previous == 1
            && self
                .status
                .transition(Status::Cancelled, Status::Ready)
                .is_ok()
        {
            info!("All transfers drained, engine ready");
        }
    }

    /// Poison the engine and cancel every other slot
    pub(super) fn fail_and_drain(&self, ring: &TransferRing<T>, failed_slot: usize) {
        self.status.store(Status::Failed);
        self.active.fetch_sub(1, Ordering::AcqRel);

        for (slot, _) in ring.transfers().filter(|(slot, _)| *slot != failed_slot) {
            self.cancel_slot(ring, slot);
        }
    }

    /// Cancel one slot; "not found" means it already completed
    pub(super) fn cancel_slot(&self, ring: &TransferRing<T>, slot: usize) {
        let Some(transfer) = ring.transfer(slot) else {
            return;
        };
        match self.transport.cancel(transfer) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Slot {} not in flight", slot),
            Err(e) => error!("Cancelling slot {} failed: {}", slot, e),
        }
    }
}
