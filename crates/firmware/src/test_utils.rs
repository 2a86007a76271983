//! Test fixtures for firmware images
//!
//! Lays out minimal well-formed images so validation and loader tests do not
//! need a real firmware file on disk.
//!
//! # Example
//!
//! ```
//! use firmware::test_utils::ImageBuilder;
//!
//! let bytes = ImageBuilder::new().section(0x4000_0000, &[1, 2, 3]).build();
//! assert!(firmware::validate(&bytes).is_ok());
//! ```

use crate::image::{I2C_CONFIG, IMAGE_TYPE, MAGIC, MIN_IMAGE_SIZE};

/// Builds image byte buffers for tests
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    header: [u8; 4],
    sections: Vec<(u32, Vec<u32>)>,
    entry_address: u32,
    checksum: Option<u32>,
    pad_to: usize,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Empty image with a valid header, padded to the minimum size
    pub fn new() -> Self {
        Self {
            header: [MAGIC[0], MAGIC[1], I2C_CONFIG, IMAGE_TYPE],
            sections: Vec::new(),
            entry_address: 0,
            checksum: None,
            pad_to: MIN_IMAGE_SIZE,
        }
    }

    /// Override the 4-byte header
    pub fn header(mut self, header: [u8; 4]) -> Self {
        self.header = header;
        self
    }

    /// Append a section
    ///
    /// # Panics
    ///
    /// If `words` is empty: a zero length is the section-list terminator.
    pub fn section(mut self, start_address: u32, words: &[u32]) -> Self {
        assert!(!words.is_empty(), "an empty section would terminate the list");
        self.sections.push((start_address, words.to_vec()));
        self
    }

    /// Set the entry address
    pub fn entry(mut self, entry_address: u32) -> Self {
        self.entry_address = entry_address;
        self
    }

    /// Store this checksum instead of the computed one
    pub fn checksum(mut self, checksum: u32) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Zero-pad the result to at least `len` bytes (0 disables padding)
    pub fn pad_to(mut self, len: usize) -> Self {
        self.pad_to = len;
        self
    }

    /// Produce the image bytes
    pub fn build(&self) -> Vec<u8> {
        let mut out = self.header.to_vec();
        let mut sum = 0u32;
        for (address, words) in &self.sections {
            out.extend_from_slice(&(words.len() as u32).to_le_bytes());
            out.extend_from_slice(&address.to_le_bytes());
            for word in words {
                sum = sum.wrapping_add(*word);
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.entry_address.to_le_bytes());
        out.extend_from_slice(&self.checksum.unwrap_or(sum).to_le_bytes());
        if out.len() < self.pad_to {
            out.resize(self.pad_to, 0);
        }
        out
    }
}
