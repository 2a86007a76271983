//! Library half of the `fx3-stream` binary
//!
//! Configuration, output and shutdown handling live here so they can be
//! tested without a device attached.

pub mod config;
pub mod output;
pub mod shutdown;

pub use config::StreamerConfig;
