//! USB device handle
//!
//! Opens one supported device by index, loading firmware first when it is
//! still in boot-loader mode, claims interface 0 and discovers the bulk IN
//! endpoint used for streaming. Dropping the device releases the claim and
//! closes the handle once no engine still shares it.

use crate::error::{Result, StreamError};
use crate::loader;
use crate::transport::{BulkInEndpoint, BulkSource};
use crate::usb::ids::{DeviceIdentity, lookup};
use crate::usb::libusb::LibusbTransport;
use crate::usb::UsbError;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Interface carrying the streaming endpoint
const INTERFACE: u8 = 0;

/// How long to wait for the device to come back after a firmware load
const REENUMERATION_TIMEOUT: Duration = Duration::from_secs(5);

const REENUMERATION_POLL: Duration = Duration::from_millis(100);

/// bDescriptorType of the SuperSpeed endpoint companion descriptor
const SS_ENDPOINT_COMPANION: u8 = 0x30;

/// Identity and strings of one attached, supported device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index accepted by [`UsbDevice::open`]
    pub index: usize,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub needs_firmware: bool,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// An opened, claimed device
pub struct UsbDevice {
    index: usize,
    identity: DeviceIdentity,
    handle: Arc<DeviceHandle<Context>>,
    transport: Arc<LibusbTransport>,
    endpoint: Option<BulkInEndpoint>,
}

impl UsbDevice {
    /// Open the `index`-th supported device
    ///
    /// If the device is in boot-loader mode, `firmware` is validated and
    /// loaded, the handle is closed and the device is re-opened once it has
    /// re-enumerated with its application identity.
    #[instrument(skip(firmware))]
    pub fn open(index: usize, firmware: Option<&Path>) -> Result<Self> {
        let context = Context::new()?;

        let (handle, identity) = match open_by_index(&context, index)? {
            (handle, identity) if !identity.needs_firmware => (handle, identity),
            (handle, _) => {
                let path = firmware.ok_or(StreamError::FirmwareRequired)?;
                info!(
                    "Device {} is in boot loader mode, loading {}",
                    index,
                    path.display()
                );
                loader::load(&handle, path)?;
                drop(handle);
                wait_for_application(&context, index)?
            }
        };

        let endpoint = find_bulk_in_endpoint(&handle.device());
        match endpoint {
            Some(ep) => debug!(
                "Bulk IN endpoint {:#04x}: max_packet_size={}, max_burst={}",
                ep.address, ep.max_packet_size, ep.max_burst
            ),
            None => warn!("Device {} has no bulk IN endpoint", index),
        }

        let handle = Arc::new(handle);
        let transport = Arc::new(LibusbTransport::new(handle.clone()));

        info!(
            "Opened device {} ({:04x}:{:04x})",
            index, identity.vendor_id, identity.product_id
        );

        Ok(Self {
            index,
            identity,
            handle,
            transport,
            endpoint,
        })
    }

    /// Index this device was opened with
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity table entry the device matched
    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Close the device
    ///
    /// Equivalent to dropping it.
    pub fn close(self) {}
}

impl BulkSource for UsbDevice {
    type Transport = LibusbTransport;

    fn bulk_in_endpoint(&self) -> Option<BulkInEndpoint> {
        self.endpoint
    }

    fn bulk_transport(&self) -> Arc<LibusbTransport> {
        self.transport.clone()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        // rusb releases claimed interfaces when the last handle reference goes
        debug!(
            "Closing device {} ({} handle references)",
            self.index,
            Arc::strong_count(&self.handle)
        );
    }
}

/// Number of attached devices in the identity table (either mode)
pub fn count_devices() -> Result<usize> {
    let context = Context::new()?;
    Ok(matching_devices(&context)?.len())
}

/// Describe every attached supported device
///
/// A device that cannot be opened is still listed, with empty strings.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = Context::new()?;
    let devices = matching_devices(&context)?;

    Ok(devices
        .into_iter()
        .enumerate()
        .map(|(index, (device, identity))| {
            let (manufacturer, product, serial_number) = match device.open() {
                Ok(handle) => read_strings(&device, &handle),
                Err(e) => {
                    warn!("Could not open device {} to read strings: {}", index, e);
                    Default::default()
                }
            };
            DeviceInfo {
                index,
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
                bus_number: device.bus_number(),
                address: device.address(),
                needs_firmware: identity.needs_firmware,
                manufacturer,
                product,
                serial_number,
            }
        })
        .collect())
}

/// Supported devices in bus enumeration order
fn matching_devices(context: &Context) -> Result<Vec<(Device<Context>, DeviceIdentity)>> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if let Some(identity) = lookup(desc.vendor_id(), desc.product_id()) {
            found.push((device, *identity));
        }
    }
    Ok(found)
}

fn open_by_index(
    context: &Context,
    index: usize,
) -> Result<(DeviceHandle<Context>, DeviceIdentity)> {
    let (device, identity) = matching_devices(context)?
        .into_iter()
        .nth(index)
        .ok_or(StreamError::DeviceNotFound { index })?;

    let handle = device.open()?;

    match handle.kernel_driver_active(INTERFACE) {
        Ok(true) => return Err(StreamError::DeviceBusy),
        Ok(false) | Err(rusb::Error::NotSupported) => {}
        Err(e) => return Err(e.into()),
    }

    handle.claim_interface(INTERFACE)?;
    debug!("Claimed interface {} on device {}", INTERFACE, index);

    Ok((handle, identity))
}

/// Re-open `index` once it reports its application identity
fn wait_for_application(
    context: &Context,
    index: usize,
) -> Result<(DeviceHandle<Context>, DeviceIdentity)> {
    let deadline = Instant::now() + REENUMERATION_TIMEOUT;
    loop {
        let expired = Instant::now() >= deadline;
        match open_by_index(context, index) {
            Ok((handle, identity)) if !identity.needs_firmware => {
                info!("Device {} re-enumerated with firmware running", index);
                return Ok((handle, identity));
            }
            Ok(_) if expired => return Err(StreamError::StillInBootloader),
            Ok(_) => {}
            // The device drops off the bus while it re-enumerates
            Err(StreamError::DeviceNotFound { .. }) if !expired => {}
            Err(StreamError::Usb(UsbError::NoDevice | UsbError::NotFound)) if !expired => {}
            Err(e) => return Err(e),
        }
        std::thread::sleep(REENUMERATION_POLL);
    }
}

/// First bulk IN endpoint on interface 0
fn find_bulk_in_endpoint(device: &Device<Context>) -> Option<BulkInEndpoint> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to get active config descriptor: {}", e);
            return None;
        }
    };

    for interface in config.interfaces() {
        if interface.number() != INTERFACE {
            continue;
        }
        for alt in interface.descriptors() {
            for ep in alt.endpoint_descriptors() {
                if ep.transfer_type() == TransferType::Bulk && ep.direction() == Direction::In {
                    return Some(BulkInEndpoint {
                        address: ep.address(),
                        max_packet_size: ep.max_packet_size(),
                        max_burst: max_burst_from_extra(ep.extra().unwrap_or_default()),
                    });
                }
            }
        }
    }
    None
}

/// Burst size from the SuperSpeed companion descriptor in an endpoint's extra bytes
fn max_burst_from_extra(extra: &[u8]) -> u8 {
    let mut rest = extra;
    while rest.len() >= 2 {
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            break;
        }
        if rest[1] == SS_ENDPOINT_COMPANION && len >= 3 {
            return rest[2].saturating_add(1);
        }
        rest = &rest[len..];
    }
    1
}

fn read_strings(device: &Device<Context>, handle: &DeviceHandle<Context>) -> (String, String, String) {
    let Ok(desc) = device.device_descriptor() else {
        return Default::default();
    };
    let read = |index: Option<u8>| {
        index
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .unwrap_or_default()
    };
    (
        read(desc.manufacturer_string_index()),
        read(desc.product_string_index()),
        read(desc.serial_number_string_index()),
    )
}
