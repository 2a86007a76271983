//! Streaming library error types

use crate::adc::Status;
use crate::usb::UsbError;
use firmware::ImageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by device, loader and engine operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// The device exposes no bulk IN endpoint on interface 0
    #[error("No USB bulk IN endpoint found")]
    NoBulkEndpoint,

    /// Frame size is not a multiple of the endpoint's burst size
    #[error("Frame size {frame_size} is not a multiple of {max_xfer_size}")]
    InvalidFrameSize {
        frame_size: usize,
        max_xfer_size: usize,
    },

    /// A zero-copy frame or its transfer descriptor could not be allocated
    #[error("Buffer allocation failed at frame {index}: {source}")]
    BufferAllocationFailed {
        index: usize,
        #[source]
        source: UsbError,
    },

    /// Firmware image failed validation
    #[error("Invalid firmware image: {0}")]
    Image(#[from] ImageError),

    /// Underlying USB transport error
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    /// A firmware control transfer moved fewer bytes than requested
    #[error("Short write at {address:#010x}: {actual} of {expected} bytes")]
    ShortWrite {
        address: u32,
        expected: usize,
        actual: usize,
    },

    /// Operation is not valid in the engine's current state
    #[error("Invalid engine state: {status:?}")]
    InvalidState { status: Status },

    /// A bulk transfer failed while streaming
    #[error("Bulk transfer failed")]
    TransferFailed,

    /// Engine was opened without a transfer ring
    #[error("Engine was opened for synchronous reads only")]
    NotStreamable,

    /// No supported device at this index
    #[error("No supported device at index {index}")]
    DeviceNotFound { index: usize },

    /// A kernel driver is bound to the interface
    #[error("Device busy: kernel driver attached")]
    DeviceBusy,

    /// Device did not leave boot-loader mode after loading firmware
    #[error("Device is still in boot loader mode")]
    StillInBootloader,

    /// Device is in boot-loader mode and no image was supplied
    #[error("Device needs firmware but no image was given")]
    FirmwareRequired,

    /// Firmware image file could not be read
    #[error("Failed to read image {}: {source}", path.display())]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<rusb::Error> for StreamError {
    fn from(err: rusb::Error) -> Self {
        StreamError::Usb(err.into())
    }
}

/// Type alias for streaming results
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::InvalidFrameSize {
            frame_size: 4000,
            max_xfer_size: 4096,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4000"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_usb_error_conversion() {
        let err: StreamError = UsbError::NotFound.into();
        assert!(matches!(err, StreamError::Usb(UsbError::NotFound)));
    }
}
