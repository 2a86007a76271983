//! ADC streaming engine
//!
//! Keeps a ring of bulk IN transfers in flight against the device's streaming
//! endpoint and hands every completed frame to a [`SampleSink`].
//!
//! # Threads
//!
//! The engine owns no threads. Completions are processed by whoever drives
//! the transport's event loop (see [`EventLoop`](crate::worker::EventLoop)),
//! while [`start`](AdcEngine::start), [`stop`](AdcEngine::stop) and
//! [`set_sample_rate`](AdcEngine::set_sample_rate) may be called from any
//! other thread. The two sides meet only at the status byte and the atomic
//! active-transfer counter.
//!
//! # Stopping
//!
//! `stop` is fire-and-forget. It marks the engine CANCELLED, cancels every
//! slot and flushes already-queued completions once. The engine returns to
//! READY when the last cancellation is observed; poll [`AdcEngine::status`]
//! to wait for it.

mod dispatch;
mod pool;
mod status;

pub use status::Status;

use crate::error::{Result, StreamError};
use crate::transport::{BulkInEndpoint, BulkSource, BulkTransport, CompletionHandler};
use pool::TransferRing;
use status::AtomicStatus;
use std::sync::atomic::{AtomicIsize, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Sample rate reported until [`AdcEngine::set_sample_rate`] is called
pub const DEFAULT_SAMPLE_RATE: u32 = 64_000_000;

/// Frame size used when `open_async` is given 0
pub const DEFAULT_FRAME_SIZE: usize = 16 * 1024;

/// Ring length used when `open_async` is given 0
pub const DEFAULT_NUM_FRAMES: usize = 64;

/// Per-transfer timeout of every bulk transfer in the ring
pub const BULK_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Consumer of streamed frames
///
/// Called on the event-processing thread. The slice is only valid for the
/// duration of the call: the frame is resubmitted as soon as it returns.
pub trait SampleSink: Send + Sync {
    fn on_samples(&self, frame: &[u8]);
}

impl<F> SampleSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_samples(&self, frame: &[u8]) {
        self(frame)
    }
}

/// State reachable from the completion path
pub(crate) struct Shared<T: BulkTransport> {
    // Dropped before the transport
    ring: Option<TransferRing<T>>,
    transport: Arc<T>,
    sink: Option<Box<dyn SampleSink>>,
    status: AtomicStatus,
    active: AtomicIsize,
}

/// Streaming engine bound to one bulk IN endpoint
pub struct AdcEngine<T: BulkTransport> {
    shared: Arc<Shared<T>>,
    endpoint: BulkInEndpoint,
    sample_rate: AtomicU32,
    frame_size: usize,
    num_frames: usize,
}

impl<T: BulkTransport> AdcEngine<T> {
    /// Open an engine for synchronous reads only
    ///
    /// No frames are allocated; [`start`](Self::start) returns
    /// [`StreamError::NotStreamable`].
    #[instrument(skip_all)]
    pub fn open_sync<S>(source: &S) -> Result<Self>
    where
        S: BulkSource<Transport = T>,
    {
        let endpoint = source
            .bulk_in_endpoint()
            .ok_or(StreamError::NoBulkEndpoint)?;

        let shared = Arc::new(Shared {
            ring: None,
            transport: source.bulk_transport(),
            sink: None,
            status: AtomicStatus::new(Status::Ready),
            active: AtomicIsize::new(0),
        });

        debug!("Opened synchronous engine on endpoint {:#04x}", endpoint.address);

        Ok(Self {
            shared,
            endpoint,
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
            frame_size: 0,
            num_frames: 0,
        })
    }

    /// Open an engine with a ring of `num_frames` transfers of `frame_size` bytes
    ///
    /// Zero selects [`DEFAULT_FRAME_SIZE`] / [`DEFAULT_NUM_FRAMES`]. The frame
    /// size must be a multiple of the endpoint's burst size
    /// (`max_packet_size * max_burst`).
    #[instrument(skip(source, sink))]
    pub fn open_async<S, K>(
        source: &S,
        frame_size: usize,
        num_frames: usize,
        sink: K,
    ) -> Result<Self>
    where
        S: BulkSource<Transport = T>,
        K: SampleSink + 'static,
    {
        let endpoint = source
            .bulk_in_endpoint()
            .ok_or(StreamError::NoBulkEndpoint)?;

        let frame_size = if frame_size == 0 {
            DEFAULT_FRAME_SIZE
        } else {
            frame_size
        };
        let num_frames = if num_frames == 0 {
            DEFAULT_NUM_FRAMES
        } else {
            num_frames
        };

        let max_xfer_size = endpoint.max_xfer_size();
        if max_xfer_size == 0 || frame_size % max_xfer_size != 0 {
            return Err(StreamError::InvalidFrameSize {
                frame_size,
                max_xfer_size,
            });
        }

        let transport = source.bulk_transport();
        let mut failure = None;

        // Descriptors route completions back to the shared state, so it has to
        // exist (weakly) before the ring is bound
        let shared = Arc::new_cyclic(|weak: &Weak<Shared<T>>| {
            let handler: Weak<dyn CompletionHandler> = weak.clone();
            let ring = match TransferRing::allocate(
                transport.as_ref(),
                endpoint.address,
                frame_size,
                num_frames,
                BULK_TRANSFER_TIMEOUT,
                handler,
            ) {
                Ok(ring) => Some(ring),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            };
            Shared {
                ring,
                transport: transport.clone(),
                sink: Some(Box::new(sink)),
                status: AtomicStatus::new(Status::Ready),
                active: AtomicIsize::new(0),
            }
        });

        if let Some(e) = failure {
            error!("Failed to allocate transfer ring: {}", e);
            return Err(e);
        }

        info!(
            "Opened streaming engine: {} frames of {} bytes on endpoint {:#04x}",
            num_frames, frame_size, endpoint.address
        );

        Ok(Self {
            shared,
            endpoint,
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
            frame_size,
            num_frames,
        })
    }

    /// Record the ADC sample rate; not validated here
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    /// Submit every transfer in the ring
    ///
    /// Only valid from READY. If a submission fails the engine is FAILED and
    /// the transfers already submitted stay in flight until they complete or
    /// are cancelled.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let shared = &*self.shared;
        let ring = shared.ring.as_ref().ok_or(StreamError::NotStreamable)?;

        shared
            .status
            .transition(Status::Ready, Status::Streaming)
            .map_err(|status| StreamError::InvalidState { status })?;
        shared.active.store(0, Ordering::Release);

        for (slot, transfer) in ring.transfers() {
            // Counted before submission so a fast completion never sees zero
            shared.active.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = shared.transport.submit(transfer) {
                shared.active.fetch_sub(1, Ordering::AcqRel);
                shared.status.store(Status::Failed);
                error!("Submitting slot {} failed: {}", slot, e);
                return Err(e.into());
            }
            if shared.status.load() != Status::Streaming {
                shared.cancel_slot(ring, slot);
            }
        }

        info!(
            "Streaming started: {} transfers in flight at {} Hz",
            ring.len(),
            self.sample_rate()
        );
        Ok(())
    }

    /// Cancel every transfer
    ///
    /// Does not wait for the cancellations to complete. A FAILED engine stays
    /// FAILED. Returns the first cancellation error other than "not found".
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let shared = &*self.shared;
        let Some(ring) = shared.ring.as_ref() else {
            return Ok(());
        };

        let previous = shared.status.cancel();
        debug!("Stopping engine (was {})", previous);

        let mut result = Ok(());
        for (slot, transfer) in ring.transfers() {
            match shared.transport.cancel(transfer) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Slot {} already completed", slot),
                Err(e) => {
                    error!("Cancelling slot {} failed: {}", slot, e);
                    shared.status.store(Status::Failed);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }

        if let Err(e) = shared.transport.handle_events(Duration::ZERO) {
            debug!("Flushing completions: {}", e);
        }

        // Nothing was in flight, so no completion will make the transition
        if shared.active.load(Ordering::Acquire) == 0
            && shared
                .status
                .transition(Status::Cancelled, Status::Ready)
                .is_ok()
        {
            info!("Engine stopped with no transfers in flight");
        }

        result
    }

    /// Blocking read from the bulk endpoint
    ///
    /// Not available while the ring is streaming.
    pub fn read_sync(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.status() {
            Status::Ready => {}
            status => return Err(StreamError::InvalidState { status }),
        }
        Ok(self
            .shared
            .transport
            .read_bulk(self.endpoint.address, buf, timeout)?)
    }

    /// Release the ring and its frames
    ///
    /// The engine must not be streaming and its active count must be zero.
    /// An engine closed with transfers still in flight leaks its frames
    /// instead of freeing memory the device may still write to.
    pub fn close(self) {}

    pub fn status(&self) -> Status {
        self.shared.status.load()
    }

    /// Transfers submitted and not yet completed
    pub fn active_transfers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire).max(0) as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Bytes per frame (0 for a synchronous engine)
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Ring length (0 for a synchronous engine)
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn endpoint(&self) -> BulkInEndpoint {
        self.endpoint
    }

    /// Transport whose events must be processed while streaming
    pub fn transport(&self) -> Arc<T> {
        self.shared.transport.clone()
    }
}

impl<T: BulkTransport> Drop for AdcEngine<T> {
    fn drop(&mut self) {
        let active = self.active_transfers();
        if active > 0 {
            error!(
                "ADC engine closed with {} transfers in flight, leaking its frames",
                active
            );
            std::mem::forget(self.shared.clone());
            return;
        }
        debug!("Closing ADC engine ({})", self.status());
    }
}
