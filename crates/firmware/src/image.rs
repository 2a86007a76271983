//! FX3 boot image layout and validation
//!
//! # Image Format
//!
//! ```text
//! [0]  'C' 'Y'          magic
//! [2]  0x1C             I2C config
//! [3]  0xB0             image type
//! repeat {
//!     u32 load_size     (words, 0 terminates)
//!     u32 start_address
//!     u32 data[load_size]
//! }
//! u32 entry_address
//! u32 checksum          (wrapping sum of every data word)
//! ```
//!
//! All words are little-endian. Bytes after the checksum are tolerated with a
//! warning.

use crate::error::{ImageError, Result};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

/// Images shorter than this are rejected outright
pub const MIN_IMAGE_SIZE: usize = 10240;

/// Signature at offset 0
pub const MAGIC: [u8; 2] = *b"CY";

/// Expected I2C configuration byte at offset 2
pub const I2C_CONFIG: u8 = 0x1C;

/// Expected image type byte at offset 3 (executable binary)
pub const IMAGE_TYPE: u8 = 0xB0;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 4;

const WORD: usize = 4;

/// Words that must follow any section payload: terminator, entry, checksum
const TRAILER_WORDS: usize = 3;

/// Location of one section inside the image buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectionSpan {
    start_address: u32,
    data_offset: usize,
    data_len: usize,
}

/// Result of walking the section list
#[derive(Debug, Clone)]
struct Layout {
    sections: Vec<SectionSpan>,
    entry_address: u32,
    checksum: u32,
    end: usize,
}

/// One loadable section of a validated image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    /// Target address in device memory
    pub start_address: u32,
    /// Raw payload bytes (a whole number of words)
    pub data: &'a [u8],
}

impl Section<'_> {
    /// Payload length in 32-bit words
    pub fn load_size(&self) -> u32 {
        (self.data.len() / WORD) as u32
    }
}

/// A firmware image that has passed validation
///
/// Only a validated image can be handed to the loader, so the transfer path
/// never has to re-check bounds.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    layout: Layout,
}

impl FirmwareImage {
    /// Validate `bytes` and take ownership of them
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let layout = walk(&bytes)?;
        Ok(Self { bytes, layout })
    }

    /// Entry point the device jumps to after loading
    pub fn entry_address(&self) -> u32 {
        self.layout.entry_address
    }

    /// Stored (and verified) checksum
    pub fn checksum(&self) -> u32 {
        self.layout.checksum
    }

    /// Number of loadable sections
    pub fn section_count(&self) -> usize {
        self.layout.sections.len()
    }

    /// Total payload bytes across all sections
    pub fn payload_len(&self) -> usize {
        self.layout.sections.iter().map(|s| s.data_len).sum()
    }

    /// Bytes present after the checksum word
    pub fn trailing_len(&self) -> usize {
        self.bytes.len() - self.layout.end
    }

    /// Iterate over sections in image order
    pub fn sections(&self) -> impl Iterator<Item = Section<'_>> + '_ {
        self.layout.sections.iter().map(|span| Section {
            start_address: span.start_address,
            data: &self.bytes[span.data_offset..span.data_offset + span.data_len],
        })
    }
}

/// Validate a raw image buffer
///
/// Fails closed on any header, bounds or checksum mismatch. Trailing bytes
/// after the checksum only produce a warning.
pub fn validate(image: &[u8]) -> Result<()> {
    walk(image).map(|_| ())
}

/// Wrapping sum of little-endian words
pub fn word_sum(data: &[u8]) -> u32 {
    data.chunks_exact(WORD)
        .fold(0u32, |acc, w| acc.wrapping_add(LittleEndian::read_u32(w)))
}

fn walk(image: &[u8]) -> Result<Layout> {
    if image.len() < MIN_IMAGE_SIZE {
        return Err(ImageError::TooSmall {
            size: image.len(),
            min: MIN_IMAGE_SIZE,
        });
    }
    if image[0..2] != MAGIC {
        return Err(ImageError::BadMagic {
            found: [image[0], image[1]],
        });
    }
    if image[2] != I2C_CONFIG {
        return Err(ImageError::BadConfig {
            found: image[2],
            expected: I2C_CONFIG,
        });
    }
    if image[3] != IMAGE_TYPE {
        return Err(ImageError::BadType {
            found: image[3],
            expected: IMAGE_TYPE,
        });
    }

    // Partial trailing words are never part of the layout
    let end_words = image.len() / WORD;
    let read_word = |word: usize| LittleEndian::read_u32(&image[word * WORD..(word + 1) * WORD]);

    let mut checksum = 0u32;
    let mut sections = Vec::new();
    let mut cursor = HEADER_LEN / WORD;

    loop {
        let header_word = cursor;
        let load_size = read_word(cursor);
        cursor += 1;
        if load_size == 0 {
            break;
        }
        let start_address = read_word(cursor);
        cursor += 1;

        let data_end = cursor
            .checked_add(load_size as usize)
            .filter(|&data_end| data_end + TRAILER_WORDS <= end_words)
            .ok_or(ImageError::SectionTooLarge {
                offset: header_word * WORD,
                load_size,
            })?;

        let span = SectionSpan {
            start_address,
            data_offset: cursor * WORD,
            data_len: load_size as usize * WORD,
        };
        checksum = checksum
            .wrapping_add(word_sum(&image[span.data_offset..span.data_offset + span.data_len]));
        debug!(
            "Image section: address={:#010x}, words={}",
            start_address, load_size
        );
        sections.push(span);
        cursor = data_end;
    }

    let entry_address = read_word(cursor);
    let expected = read_word(cursor + 1);
    let end = (cursor + 2) * WORD;

    if end != image.len() {
        warn!(
            "Image longer than expected: {} trailing bytes after checksum",
            image.len() - end
        );
    }

    if checksum != expected {
        return Err(ImageError::ChecksumMismatch {
            computed: checksum,
            expected,
        });
    }

    Ok(Layout {
        sections,
        entry_address,
        checksum,
        end,
    })
}
