//! Firmware image error types

use thiserror::Error;

/// Reasons a firmware image is rejected before anything is sent to the device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Image is shorter than the minimum accepted size
    #[error("Image too small: {size} bytes (min: {min})")]
    TooSmall { size: usize, min: usize },

    /// First two bytes are not the `CY` signature
    #[error("Bad image magic: {found:02x?} (expected \"CY\")")]
    BadMagic { found: [u8; 2] },

    /// I2C configuration byte does not match
    #[error("Bad I2C config byte: {found:#04x} (expected {expected:#04x})")]
    BadConfig { found: u8, expected: u8 },

    /// Image type byte does not match
    #[error("Bad image type byte: {found:#04x} (expected {expected:#04x})")]
    BadType { found: u8, expected: u8 },

    /// A section's declared length runs into the trailer or past the end
    #[error("Section at offset {offset:#x} too large: load_size={load_size} words")]
    SectionTooLarge { offset: usize, load_size: u32 },

    /// Word-sum of the section payloads does not match the stored checksum
    #[error("Checksum mismatch: computed {computed:#010x}, expected {expected:#010x}")]
    ChecksumMismatch { computed: u32, expected: u32 },
}

/// Type alias for image results
pub type Result<T> = std::result::Result<T, ImageError>;
