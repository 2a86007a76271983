//! Vendor control transfers
//!
//! The firmware loader only ever writes vendor requests to the device, so the
//! seam is a single method. This keeps the loader testable without hardware.

use crate::usb::UsbError;
use rusb::{DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::time::Duration;
use tracing::trace;

/// Host-to-device vendor control transfers
pub trait ControlChannel {
    /// Issue an OUT vendor request to the device recipient
    ///
    /// Returns the number of bytes the device accepted.
    fn write_vendor(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;
}

/// bmRequestType for OUT | VENDOR | DEVICE
pub fn vendor_out_request_type() -> u8 {
    rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device)
}

impl<T: UsbContext> ControlChannel for DeviceHandle<T> {
    fn write_vendor(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        trace!(
            "Vendor write: request={:#x}, value={:#x}, index={:#x}, data_len={}",
            request,
            value,
            index,
            data.len()
        );
        Ok(self.write_control(
            vendor_out_request_type(),
            request,
            value,
            index,
            data,
            timeout,
        )?)
    }
}
