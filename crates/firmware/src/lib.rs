//! Firmware image format for FX3-class USB controllers
//!
//! This crate knows nothing about USB. It parses and validates boot images so
//! the loader in `streamer` only ever sees well-formed input.
//!
//! # Example
//!
//! ```
//! use firmware::{FirmwareImage, ImageError};
//! use firmware::test_utils::ImageBuilder;
//!
//! let bytes = ImageBuilder::new()
//!     .section(0x0, &[1, 1, 1, 1])
//!     .checksum(5)
//!     .build();
//!
//! assert!(matches!(
//!     FirmwareImage::from_bytes(bytes),
//!     Err(ImageError::ChecksumMismatch { computed: 4, expected: 5 })
//! ));
//! ```

pub mod error;
pub mod image;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{ImageError, Result};
pub use image::{
    FirmwareImage, HEADER_LEN, I2C_CONFIG, IMAGE_TYPE, MAGIC, MIN_IMAGE_SIZE, Section, validate,
    word_sum,
};
