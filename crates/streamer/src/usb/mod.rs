//! USB device access
//!
//! Device discovery and opening, vendor control writes and the libusb-backed
//! asynchronous bulk transport.

pub mod control;
pub mod device;
pub mod error;
pub mod ids;
pub mod libusb;

pub use control::{ControlChannel, vendor_out_request_type};
pub use device::{DeviceInfo, UsbDevice, count_devices, list_devices};
pub use error::UsbError;
pub use ids::{DEVICE_IDS, DeviceIdentity, lookup};
pub use libusb::{LibusbFrame, LibusbTransfer, LibusbTransport};
