//! Firmware download over vendor control transfers
//!
//! Every section of a validated image is written in chunks of at most
//! [`MAX_WRITE_SIZE`] bytes. The 32-bit target address is split across the
//! setup packet: low half in `wValue`, high half in `wIndex`. After a short
//! settle delay a zero-length request addressed at the entry point starts the
//! firmware. The device usually drops off the bus at that moment, so a failed
//! jump is only logged.

use crate::error::{Result, StreamError};
use crate::usb::ControlChannel;
use firmware::FirmwareImage;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Vendor request code for firmware RAM writes and the final jump
pub const VENDOR_REQUEST_FW_LOAD: u8 = 0xA0;

/// Largest payload of a single control transfer
pub const MAX_WRITE_SIZE: usize = 2048;

/// Timeout applied to each control transfer
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between the last section write and the jump to the entry point
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Split a device address into (wValue, wIndex)
fn split_address(address: u32) -> (u16, u16) {
    ((address & 0xffff) as u16, (address >> 16) as u16)
}

/// Write every section of `image` and start it
pub fn transfer<C: ControlChannel + ?Sized>(image: &FirmwareImage, channel: &C) -> Result<()> {
    transfer_with_settle(image, channel, SETTLE_DELAY)
}

/// Like [`transfer`] with an explicit settle delay
pub fn transfer_with_settle<C: ControlChannel + ?Sized>(
    image: &FirmwareImage,
    channel: &C,
    settle: Duration,
) -> Result<()> {
    for section in image.sections() {
        debug!(
            "Writing section: address={:#010x}, bytes={}",
            section.start_address,
            section.data.len()
        );

        let mut address = section.start_address;
        for chunk in section.data.chunks(MAX_WRITE_SIZE) {
            write_chunk(channel, address, chunk)?;
            address = address.wrapping_add(chunk.len() as u32);
        }
    }

    std::thread::sleep(settle);

    let entry = image.entry_address();
    let (value, index) = split_address(entry);
    match channel.write_vendor(VENDOR_REQUEST_FW_LOAD, value, index, &[], CONTROL_TIMEOUT) {
        Ok(_) => info!("Firmware started at {:#010x}", entry),
        Err(e) => warn!("Jump to entry point {:#010x} failed: {}", entry, e),
    }

    Ok(())
}

fn write_chunk<C: ControlChannel + ?Sized>(channel: &C, address: u32, chunk: &[u8]) -> Result<()> {
    let (value, index) = split_address(address);
    let written = channel.write_vendor(
        VENDOR_REQUEST_FW_LOAD,
        value,
        index,
        chunk,
        CONTROL_TIMEOUT,
    )?;

    if written != chunk.len() {
        return Err(StreamError::ShortWrite {
            address,
            expected: chunk.len(),
            actual: written,
        });
    }
    Ok(())
}

/// Read, validate and download the image at `path`
///
/// The caller must close and re-open the device afterwards: once the firmware
/// runs the device re-enumerates with a different identity.
#[instrument(skip(channel), fields(path = %path.display()))]
pub fn load<C: ControlChannel + ?Sized>(channel: &C, path: &Path) -> Result<()> {
    let image = read_image(path)?;
    info!(
        "Loading firmware: {} sections, {} payload bytes, entry {:#010x}",
        image.section_count(),
        image.payload_len(),
        image.entry_address()
    );
    transfer(&image, channel)
}

/// Read and validate an image file
pub fn read_image(path: &Path) -> Result<FirmwareImage> {
    let bytes = std::fs::read(path).map_err(|source| StreamError::ImageRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(FirmwareImage::from_bytes(bytes)?)
}
