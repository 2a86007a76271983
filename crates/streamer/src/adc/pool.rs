//! Frame arena and transfer ring
//!
//! Frames and descriptors are allocated together and addressed by slot index.
//! Descriptor `i` is bound to frame `i` for the lifetime of the ring, so a
//! completion only ever carries an index, never a pointer into the engine.

use crate::error::{Result, StreamError};
use crate::transport::{Binding, BulkTransport, CompletionHandler};
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// `num_frames` frames plus one bound descriptor per frame
pub(crate) struct TransferRing<T: BulkTransport> {
    // Declared first so descriptors are released before the memory they point at
    transfers: Vec<T::Transfer>,
    frames: Vec<T::Frame>,
}

impl<T: BulkTransport> TransferRing<T> {
    /// Allocate and bind the whole ring
    ///
    /// On failure everything allocated so far is released before returning.
    pub(crate) fn allocate(
        transport: &T,
        endpoint: u8,
        frame_size: usize,
        num_frames: usize,
        timeout: Duration,
        handler: Weak<dyn CompletionHandler>,
    ) -> Result<Self> {
        let frames = (0..num_frames)
            .map(|index| {
                transport
                    .alloc_frame(frame_size)
                    .map_err(|source| StreamError::BufferAllocationFailed { index, source })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut transfers = Vec::with_capacity(num_frames);
        for (slot, frame) in frames.iter().enumerate() {
            let mut transfer = transport
                .alloc_transfer()
                .map_err(|source| StreamError::BufferAllocationFailed {
                    index: slot,
                    source,
                })?;
            transport.bind(
                &mut transfer,
                Binding {
                    slot,
                    endpoint,
                    frame,
                    timeout,
                    handler: handler.clone(),
                },
            );
            transfers.push(transfer);
        }

        debug!(
            "Allocated {} frames of {} bytes on endpoint {:#04x}",
            num_frames, frame_size, endpoint
        );

        Ok(Self { transfers, frames })
    }

    pub(crate) fn len(&self) -> usize {
        self.transfers.len()
    }

    pub(crate) fn transfer(&self, slot: usize) -> Option<&T::Transfer> {
        self.transfers.get(slot)
    }

    pub(crate) fn frame(&self, slot: usize) -> Option<&T::Frame> {
        self.frames.get(slot)
    }

    pub(crate) fn transfers(&self) -> impl Iterator<Item = (usize, &T::Transfer)> {
        self.transfers.iter().enumerate()
    }
}
