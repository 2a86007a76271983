//! Integration tests for firmware loading from disk

use firmware::test_utils::ImageBuilder;
use firmware::ImageError;
use std::io::Write;
use streamer::loader::{self, MAX_WRITE_SIZE, VENDOR_REQUEST_FW_LOAD};
use streamer::test_utils::RecordingControl;
use streamer::StreamError;
use tempfile::NamedTempFile;

fn write_image(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_writes_every_section_then_jumps() {
    let first: Vec<u32> = (0..600).collect();
    let bytes = ImageBuilder::new()
        .section(0x4000_0000, &first)
        .section(0x4001_0000, &[0xdead_beef; 8])
        .entry(0x4000_0040)
        .build();
    let file = write_image(&bytes);
    let control = RecordingControl::new();

    loader::load(&control, file.path()).unwrap();

    let writes = control.writes();
    assert!(writes.iter().all(|w| w.request == VENDOR_REQUEST_FW_LOAD));
    assert!(writes.iter().all(|w| w.data.len() <= MAX_WRITE_SIZE));

    // 2400 bytes = 2048 + 352, then the second section, then the jump
    let layout: Vec<(u16, u16, usize)> = writes
        .iter()
        .map(|w| (w.index, w.value, w.data.len()))
        .collect();
    assert_eq!(
        layout,
        vec![
            (0x4000, 0x0000, 2048),
            (0x4000, 0x0800, 352),
            (0x4001, 0x0000, 32),
            (0x4000, 0x0040, 0),
        ]
    );

    let payload: Vec<u8> = writes[..2].iter().flat_map(|w| w.data.clone()).collect();
    let expected: Vec<u8> = first.iter().flat_map(|w| w.to_le_bytes()).collect();
    assert_eq!(payload, expected);
}

#[test]
fn test_invalid_image_is_never_written() {
    let bytes = ImageBuilder::new()
        .section(0x0, &[1, 1, 1, 1])
        .checksum(5)
        .build();
    let file = write_image(&bytes);
    let control = RecordingControl::new();

    let err = loader::load(&control, file.path()).unwrap_err();

    assert!(matches!(
        err,
        StreamError::Image(ImageError::ChecksumMismatch {
            computed: 4,
            expected: 5
        })
    ));
    assert!(control.writes().is_empty());
}

#[test]
fn test_truncated_file_is_too_small() {
    let file = write_image(&[b'C', b'Y', 0x1C, 0xB0]);
    let err = loader::read_image(file.path()).unwrap_err();
    assert!(matches!(
        err,
        StreamError::Image(ImageError::TooSmall { size: 4, .. })
    ));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.img");

    let err = loader::load(&RecordingControl::new(), &path).unwrap_err();
    match err {
        StreamError::ImageRead { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {}", other),
    }
}
