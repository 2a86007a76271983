//! USB transport error codes
//!
//! Mirrors libusb's error space so both the synchronous rusb paths and the raw
//! asynchronous transfer paths report through one type.

use rusb::ffi::constants::*;
use std::os::raw::c_int;
use thiserror::Error;

/// Error reported by the USB transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// Transfer timed out
    #[error("timeout")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("pipe error")]
    Pipe,
    /// Device was disconnected
    #[error("no device")]
    NoDevice,
    /// Entity not found; for cancellation this means the transfer already completed
    #[error("not found")]
    NotFound,
    /// Device or resource is busy
    #[error("busy")]
    Busy,
    /// Buffer overflow
    #[error("overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// System call interrupted
    #[error("interrupted")]
    Interrupted,
    /// Out of memory
    #[error("out of memory")]
    NoMem,
    /// Operation not supported on this platform
    #[error("not supported")]
    NotSupported,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// True for the "not found" outcome that cancellation tolerates
    pub fn is_not_found(&self) -> bool {
        matches!(self, UsbError::NotFound)
    }

    /// Map a raw libusb return code (negative) to an error
    pub fn from_code(code: c_int) -> Self {
        match code {
            LIBUSB_ERROR_IO => UsbError::Io,
            LIBUSB_ERROR_INVALID_PARAM => UsbError::InvalidParam,
            LIBUSB_ERROR_ACCESS => UsbError::Access,
            LIBUSB_ERROR_NO_DEVICE => UsbError::NoDevice,
            LIBUSB_ERROR_NOT_FOUND => UsbError::NotFound,
            LIBUSB_ERROR_BUSY => UsbError::Busy,
            LIBUSB_ERROR_TIMEOUT => UsbError::Timeout,
            LIBUSB_ERROR_OVERFLOW => UsbError::Overflow,
            LIBUSB_ERROR_PIPE => UsbError::Pipe,
            LIBUSB_ERROR_INTERRUPTED => UsbError::Interrupted,
            LIBUSB_ERROR_NO_MEM => UsbError::NoMem,
            LIBUSB_ERROR_NOT_SUPPORTED => UsbError::NotSupported,
            other => UsbError::Other {
                message: format!("libusb error {}", other),
            },
        }
    }
}

impl From<rusb::Error> for UsbError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => UsbError::Timeout,
            rusb::Error::Pipe => UsbError::Pipe,
            rusb::Error::NoDevice => UsbError::NoDevice,
            rusb::Error::NotFound => UsbError::NotFound,
            rusb::Error::Busy => UsbError::Busy,
            rusb::Error::Overflow => UsbError::Overflow,
            rusb::Error::Io => UsbError::Io,
            rusb::Error::InvalidParam => UsbError::InvalidParam,
            rusb::Error::Access => UsbError::Access,
            rusb::Error::Interrupted => UsbError::Interrupted,
            rusb::Error::NoMem => UsbError::NoMem,
            rusb::Error::NotSupported => UsbError::NotSupported,
            _ => UsbError::Other {
                message: err.to_string(),
            },
        }
    }
}
