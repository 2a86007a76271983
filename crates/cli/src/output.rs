//! Sample output
//!
//! Frames arrive on the Tokio side of the frame bridge and are written as raw
//! bytes, in arrival order, to a file or stdout.

use anyhow::{Context, Result};
use common::FrameReceiver;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

/// Boxed async writer for the selected output
pub type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Open `target`; `-` selects stdout
pub async fn open_output(target: &str) -> Result<Output> {
    if target == "-" {
        return Ok(Box::new(tokio::io::stdout()));
    }

    let path = Path::new(target);
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    Ok(Box::new(file))
}

/// Write every frame until the bridge is closed and drained
///
/// Returns the number of bytes written.
pub async fn write_frames<W>(receiver: FrameReceiver, writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut written = 0u64;

    while let Some(frame) = receiver.recv().await {
        writer
            .write_all(&frame)
            .await
            .context("Failed to write samples")?;
        written += frame.len() as u64;
    }

    writer.flush().await.context("Failed to flush output")?;
    debug!("Writer finished after {} bytes", written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_frame_bridge;

    #[tokio::test]
    async fn test_write_frames_in_order() {
        let (sender, receiver) = create_frame_bridge(8);
        sender.push(&[1, 2, 3]);
        sender.push(&[4, 5]);
        sender.close();

        let mut out = Vec::new();
        let written = write_frames(receiver, &mut out).await.unwrap();

        assert_eq!(written, 5);
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_open_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.bin");

        let output = open_output(path.to_str().unwrap()).await.unwrap();
        let (sender, receiver) = create_frame_bridge(4);
        sender.push(&[0xaa; 16]);
        sender.close();
        write_frames(receiver, output).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0xaa; 16]);
    }

    #[tokio::test]
    async fn test_open_output_bad_path() {
        assert!(open_output("/nonexistent/dir/samples.bin").await.is_err());
    }
}
