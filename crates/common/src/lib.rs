//! Common utilities for fx3-stream
//!
//! This crate provides functionality shared between the streaming library and
//! the command-line front end: error handling, logging setup, the frame bridge
//! between the USB event thread and Tokio, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{BridgeStats, FrameReceiver, FrameSender, create_frame_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
