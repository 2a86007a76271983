//! FX3 ADC streaming
//!
//! Opens a supported FX3-based receiver, loads its firmware when it is still
//! in boot-loader mode, and streams ADC frames over a ring of zero-copy bulk
//! transfers.
//!
//! # Layout
//!
//! - [`usb`]: identity table, device open/enumeration, control channel and the
//!   libusb transport
//! - [`loader`]: firmware download over vendor control transfers
//! - [`adc`]: the streaming engine and its completion dispatcher
//! - [`transport`]: the seam between the engine and any bulk transport
//! - [`worker`]: optional thread that drives completion events
//!
//! # Example
//!
//! ```no_run
//! use streamer::{AdcEngine, EventLoop, UsbDevice};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = UsbDevice::open(0, Some(Path::new("SDDC_FX3.img")))?;
//! let engine = AdcEngine::open_async(&device, 0, 0, |frame: &[u8]| {
//!     println!("{} bytes", frame.len());
//! })?;
//! let events = EventLoop::spawn(engine.transport())?;
//!
//! engine.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! engine.stop()?;
//!
//! events.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod adc;
pub mod error;
pub mod loader;
pub mod transport;
pub mod usb;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adc::{AdcEngine, SampleSink, Status};
pub use error::{Result, StreamError};
pub use transport::{BulkInEndpoint, BulkSource, BulkTransport, Completion, TransferOutcome};
pub use usb::{
    DeviceInfo, LibusbTransport, UsbDevice, UsbError, count_devices, list_devices,
};
pub use worker::EventLoop;
