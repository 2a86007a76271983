//! libusb-backed asynchronous bulk transport
//!
//! rusb covers synchronous transfers only, so the streaming ring goes through
//! `rusb::ffi` directly: zero-copy frames come from `libusb_dev_mem_alloc`,
//! descriptors from `libusb_alloc_transfer`, and completions are routed by a C
//! trampoline to the engine's [`CompletionHandler`].
//!
//! # Safety contract
//!
//! A descriptor must not be dropped while it is in flight. The engine upholds
//! this by only being closed once its active-transfer count is back to zero.

use crate::transport::{Binding, BulkTransport, Completion, CompletionHandler, TransferOutcome};
use crate::usb::UsbError;
use rusb::ffi::{self, constants::*};
use rusb::{Context, DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, trace};

// Device-memory allocation, libusb 1.0.21+. libusb1-sys links the library but
// does not bind these two.
unsafe extern "system" {
    fn libusb_dev_mem_alloc(dev_handle: *mut ffi::libusb_device_handle, length: usize) -> *mut u8;
    fn libusb_dev_mem_free(
        dev_handle: *mut ffi::libusb_device_handle,
        buffer: *mut u8,
        length: usize,
    ) -> c_int;
}

/// Bulk transport over an opened, claimed libusb device handle
pub struct LibusbTransport {
    handle: Arc<DeviceHandle<Context>>,
    context: Context,
}

impl LibusbTransport {
    pub(crate) fn new(handle: Arc<DeviceHandle<Context>>) -> Self {
        let context = handle.context().clone();
        Self { handle, context }
    }
}

/// Frame in device-accessible memory
pub struct LibusbFrame {
    ptr: NonNull<u8>,
    len: usize,
    handle: Arc<DeviceHandle<Context>>,
}

// SAFETY: the frame is plain memory owned by this value; libusb writes to it
// only while its descriptor is in flight, and readers go through `with_frame`
// after the completion has been delivered.
unsafe impl Send for LibusbFrame {}
unsafe impl Sync for LibusbFrame {}

impl Drop for LibusbFrame {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from libusb_dev_mem_alloc on this handle
        let rc = unsafe {
            libusb_dev_mem_free(self.handle.as_raw(), self.ptr.as_ptr(), self.len)
        };
        if rc < 0 {
            error!("libusb_dev_mem_free failed: {}", UsbError::from_code(rc));
        }
    }
}

/// Where a completion for one descriptor is delivered
struct Route {
    slot: usize,
    handler: Weak<dyn CompletionHandler>,
}

/// A libusb transfer descriptor
pub struct LibusbTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    route: Option<Box<Route>>,
}

// SAFETY: the descriptor is only mutated by libusb under its own locking and
// by `bind`, which requires exclusive access.
unsafe impl Send for LibusbTransfer {}
unsafe impl Sync for LibusbTransfer {}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        // SAFETY: allocated by libusb_alloc_transfer; not in flight (see module docs)
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) };
    }
}

impl BulkTransport for LibusbTransport {
    type Frame = LibusbFrame;
    type Transfer = LibusbTransfer;

    fn alloc_frame(&self, len: usize) -> Result<LibusbFrame, UsbError> {
        // SAFETY: handle is open for the lifetime of self
        let ptr = unsafe { libusb_dev_mem_alloc(self.handle.as_raw(), len) };
        NonNull::new(ptr)
            .map(|ptr| LibusbFrame {
                ptr,
                len,
                handle: self.handle.clone(),
            })
            .ok_or(UsbError::NoMem)
    }

    fn alloc_transfer(&self) -> Result<LibusbTransfer, UsbError> {
        // SAFETY: no isochronous packets; freed in Drop
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        NonNull::new(raw)
            .map(|raw| LibusbTransfer { raw, route: None })
            .ok_or(UsbError::NoMem)
    }

    fn bind(&self, transfer: &mut LibusbTransfer, binding: Binding<'_, LibusbFrame>) {
        let route = Box::new(Route {
            slot: binding.slot,
            handler: binding.handler,
        });
        let user_data = &*route as *const Route as *mut c_void;

        // SAFETY: the descriptor is not in flight; frame memory and the boxed
        // route are owned alongside it and outlive every submission.
        unsafe {
            ffi::libusb_fill_bulk_transfer(
                transfer.raw.as_ptr(),
                self.handle.as_raw(),
                binding.endpoint,
                binding.frame.ptr.as_ptr(),
                binding.frame.len as c_int,
                transfer_callback,
                user_data,
                binding.timeout.as_millis() as c_uint,
            );
        }
        transfer.route = Some(route);
    }

    fn submit(&self, transfer: &LibusbTransfer) -> Result<(), UsbError> {
        // SAFETY: bound descriptor, see `bind`
        let rc = unsafe { ffi::libusb_submit_transfer(transfer.raw.as_ptr()) };
        check(rc)
    }

    fn cancel(&self, transfer: &LibusbTransfer) -> Result<(), UsbError> {
        // SAFETY: cancelling a descriptor that is not in flight yields NOT_FOUND
        let rc = unsafe { ffi::libusb_cancel_transfer(transfer.raw.as_ptr()) };
        check(rc)
    }

    fn with_frame(&self, frame: &LibusbFrame, len: usize, f: &mut dyn FnMut(&[u8])) {
        let len = len.min(frame.len);
        // SAFETY: called between completion and resubmission, so libusb is not writing
        let bytes = unsafe { std::slice::from_raw_parts(frame.ptr.as_ptr(), len) };
        f(bytes);
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        self.context
            .handle_events(Some(timeout))
            .map_err(UsbError::from)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }
}

fn check(rc: c_int) -> Result<(), UsbError> {
    if rc < 0 {
        Err(UsbError::from_code(rc))
    } else {
        Ok(())
    }
}

/// Map a libusb transfer status to an outcome
fn outcome_from_status(status: c_int) -> TransferOutcome {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferOutcome::Completed,
        LIBUSB_TRANSFER_CANCELLED => TransferOutcome::Cancelled,
        LIBUSB_TRANSFER_TIMED_OUT => TransferOutcome::TimedOut,
        LIBUSB_TRANSFER_STALL => TransferOutcome::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferOutcome::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferOutcome::Overflow,
        _ => TransferOutcome::Error,
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back a descriptor we filled in `bind`; its user_data
    // points at the Route boxed in the owning LibusbTransfer.
    let (route, status, actual_length) = unsafe {
        let transfer = &*transfer;
        (
            &*(transfer.user_data as *const Route),
            transfer.status,
            transfer.actual_length,
        )
    };

    let Some(handler) = route.handler.upgrade() else {
        trace!("Completion for slot {} after engine was dropped", route.slot);
        return;
    };

    let completion = Completion {
        slot: route.slot,
        outcome: outcome_from_status(status),
        actual_length: actual_length.max(0) as usize,
    };

    // Unwinding into libusb would abort the process
    if let Err(e) = catch_unwind(AssertUnwindSafe(|| handler.on_completion(completion))) {
        error!("Panic in completion handler: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_COMPLETED),
            TransferOutcome::Completed
        );
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_CANCELLED),
            TransferOutcome::Cancelled
        );
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_TIMED_OUT),
            TransferOutcome::TimedOut
        );
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_STALL),
            TransferOutcome::Stall
        );
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_ERROR),
            TransferOutcome::Error
        );
    }

    #[test]
    fn test_device_memory_symbols_link() {
        let alloc: unsafe extern "system" fn(*mut ffi::libusb_device_handle, usize) -> *mut u8 =
            libusb_dev_mem_alloc;
        let free: unsafe extern "system" fn(
            *mut ffi::libusb_device_handle,
            *mut u8,
            usize,
        ) -> c_int = libusb_dev_mem_free;
        assert_ne!(alloc as usize, 0);
        assert_ne!(free as usize, 0);
    }

    #[test]
    fn test_check_return_codes() {
        assert!(check(0).is_ok());
        assert_eq!(check(LIBUSB_ERROR_NOT_FOUND), Err(UsbError::NotFound));
    }
}
