//! Asynchronous bulk transport seam
//!
//! The ADC engine never talks to libusb directly. It allocates frames and
//! transfer descriptors through [`BulkTransport`], binds each descriptor to one
//! frame and one ring slot, and receives completions through
//! [`CompletionHandler`] from whatever thread drives event processing.
//!
//! Transports keep only a `Weak` reference to the handler. A completion that
//! arrives after the engine is gone is dropped instead of touching freed state.

use crate::usb::UsbError;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Terminal status of one bulk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Transfer finished; `actual_length` bytes are valid
    Completed,
    /// Transfer was cancelled on request
    Cancelled,
    /// Per-transfer timeout expired
    TimedOut,
    /// Endpoint stalled
    Stall,
    /// Device went away
    NoDevice,
    /// Device sent more data than requested
    Overflow,
    /// Any other transport failure
    Error,
}

/// Completion event for one ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Index of the descriptor (and its frame) in the ring
    pub slot: usize,
    pub outcome: TransferOutcome,
    /// Bytes actually transferred into the frame
    pub actual_length: usize,
}

/// Receiver of completion events
///
/// Called from the event-processing context, possibly concurrently with
/// control calls made from another thread.
pub trait CompletionHandler: Send + Sync {
    fn on_completion(&self, completion: Completion);
}

/// Bulk IN endpoint characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInEndpoint {
    /// Endpoint address including the IN direction bit
    pub address: u8,
    pub max_packet_size: u16,
    /// Packets per burst (1 for USB 2.0 devices)
    pub max_burst: u8,
}

impl BulkInEndpoint {
    /// Bytes the endpoint moves per burst; frame sizes must be a multiple of this
    pub fn max_xfer_size(&self) -> usize {
        self.max_packet_size as usize * self.max_burst as usize
    }
}

/// Everything a transport needs to pre-bind one descriptor
pub struct Binding<'a, F> {
    pub slot: usize,
    pub endpoint: u8,
    pub frame: &'a F,
    pub timeout: Duration,
    pub handler: Weak<dyn CompletionHandler>,
}

/// Asynchronous bulk transport
///
/// `Frame` is a transport-owned buffer, ideally in device-accessible memory.
/// `Transfer` is a reusable descriptor; once bound it always refers to the same
/// frame and slot. Dropping either releases it.
pub trait BulkTransport: Send + Sync + 'static {
    type Frame: Send + Sync;
    type Transfer: Send + Sync;

    /// Allocate one zero-copy frame of `len` bytes
    fn alloc_frame(&self, len: usize) -> Result<Self::Frame, UsbError>;

    /// Allocate one unbound transfer descriptor
    fn alloc_transfer(&self) -> Result<Self::Transfer, UsbError>;

    /// Bind a descriptor to its endpoint, frame, slot and completion handler
    fn bind(&self, transfer: &mut Self::Transfer, binding: Binding<'_, Self::Frame>);

    /// Submit a bound descriptor
    fn submit(&self, transfer: &Self::Transfer) -> Result<(), UsbError>;

    /// Request cancellation; `UsbError::NotFound` means it was not in flight
    fn cancel(&self, transfer: &Self::Transfer) -> Result<(), UsbError>;

    /// Give `f` read access to the first `len` bytes of `frame`
    fn with_frame(&self, frame: &Self::Frame, len: usize, f: &mut dyn FnMut(&[u8]));

    /// Process pending completion events for at most `timeout`
    ///
    /// `Duration::ZERO` performs one non-blocking pass.
    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError>;

    /// Blocking bulk read, used by engines opened for synchronous reads
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> Result<usize, UsbError>;
}

/// Anything that can hand out a bulk transport and its IN endpoint
pub trait BulkSource {
    type Transport: BulkTransport;

    /// Discovered bulk IN endpoint, if the device has one
    fn bulk_in_endpoint(&self) -> Option<BulkInEndpoint>;

    /// Shared transport for the device
    fn bulk_transport(&self) -> Arc<Self::Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_xfer_size() {
        let ep = BulkInEndpoint {
            address: 0x81,
            max_packet_size: 1024,
            max_burst: 16,
        };
        assert_eq!(ep.max_xfer_size(), 16384);
    }

    #[test]
    fn test_max_xfer_size_usb2() {
        let ep = BulkInEndpoint {
            address: 0x81,
            max_packet_size: 512,
            max_burst: 1,
        };
        assert_eq!(ep.max_xfer_size(), 512);
    }
}
