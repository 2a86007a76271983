//! fx3-stream
//!
//! Streams raw ADC samples from an FX3-based receiver to a file or stdout,
//! loading the device firmware first when it is still in boot loader mode.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{create_frame_bridge, setup_logging};
use fx3_stream::StreamerConfig;
use fx3_stream::output::{open_output, write_frames};
use fx3_stream::shutdown::{StopReason, session_failed};
use std::path::PathBuf;
use std::time::Duration;
use streamer::{AdcEngine, EventLoop, LibusbTransport, Status, UsbDevice, list_devices};
use tokio::signal;
use tracing::{error, info, warn};

/// How long to wait for outstanding cancellations after stopping
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval for checking the engine for asynchronous failure
const STATUS_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "fx3-stream")]
#[command(author, version, about = "Stream ADC samples from an FX3-based receiver")]
#[command(long_about = "
Streams raw ADC samples from an FX3-based USB receiver. Devices that are still
in boot loader mode get the configured firmware image loaded first.

EXAMPLES:
    # List attached devices
    fx3-stream --list-devices

    # Stream 10 seconds from the first device into a file
    fx3-stream --firmware ~/fx3/SDDC_FX3.img --duration 10 --output samples.bin

    # Stream to stdout until Ctrl-C
    fx3-stream --output - | my-dsp-tool

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/fx3-stream/streamer.toml
    3. /etc/fx3-stream/streamer.toml
    4. Built-in defaults
    Command line flags override values from the file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List supported devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Device index among supported devices
    #[arg(short, long, value_name = "INDEX")]
    device: Option<usize>,

    /// Firmware image for devices in boot loader mode
    #[arg(short, long, value_name = "PATH")]
    firmware: Option<String>,

    /// Output file, or - for stdout
    #[arg(short, long, value_name = "PATH", default_value = "-")]
    output: String,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(short = 't', long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Bytes per bulk transfer
    #[arg(long, value_name = "BYTES")]
    frame_size: Option<usize>,

    /// Transfers kept in flight
    #[arg(long, value_name = "COUNT")]
    num_frames: Option<usize>,

    /// ADC sample rate in Hz
    #[arg(long, value_name = "HZ")]
    sample_rate: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = StreamerConfig::default();
        let path = StreamerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        StreamerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        StreamerConfig::load_or_default()
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.logging.log_level).context("Failed to setup logging")?;

    info!("fx3-stream v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode().await;
    }

    run_stream(config, &args.output, args.duration.map(Duration::from_secs)).await
}

fn apply_overrides(config: &mut StreamerConfig, args: &Args) {
    if let Some(index) = args.device {
        config.device.index = index;
    }
    if let Some(firmware) = &args.firmware {
        config.device.firmware = Some(firmware.clone());
    }
    if let Some(frame_size) = args.frame_size {
        config.stream.frame_size = frame_size;
    }
    if let Some(num_frames) = args.num_frames {
        config.stream.num_frames = num_frames;
    }
    if let Some(sample_rate) = args.sample_rate {
        config.stream.sample_rate = sample_rate;
    }
    if let Some(level) = &args.log_level {
        config.logging.log_level = level.clone();
    }
}

/// List supported devices and exit
async fn list_devices_mode() -> Result<()> {
    let devices = tokio::task::spawn_blocking(list_devices)
        .await
        .context("Device enumeration task failed")?
        .context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No supported devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        let mode = if device.needs_firmware {
            "boot loader"
        } else {
            "firmware running"
        };
        println!(
            "  [{}] {:04x}:{:04x} - {} {} ({})",
            device.index,
            device.vendor_id,
            device.product_id,
            non_empty(&device.manufacturer, "Unknown Manufacturer"),
            non_empty(&device.product, "Unknown Product"),
            mode
        );
        println!(
            "      Bus {:03} Device {:03}",
            device.bus_number, device.address
        );
        if !device.serial_number.is_empty() {
            println!("      Serial: {}", device.serial_number);
        }
        println!();
    }

    Ok(())
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

/// Stream until Ctrl-C, the duration elapses or the engine fails
async fn run_stream(config: StreamerConfig, output: &str, duration: Option<Duration>) -> Result<()> {
    let index = config.device.index;
    let firmware = config.device.firmware_path();

    let device = tokio::task::spawn_blocking(move || UsbDevice::open(index, firmware.as_deref()))
        .await
        .context("Device open task failed")?
        .with_context(|| format!("Failed to open device {}", index))?;
    let identity = device.identity();
    info!(
        "Opened device {} ({:04x}:{:04x})",
        device.index(),
        identity.vendor_id,
        identity.product_id
    );

    let (sender, receiver) = create_frame_bridge(config.stream.queue_depth);
    let sink = sender.clone();

    let engine = AdcEngine::open_async(
        &device,
        config.stream.frame_size,
        config.stream.num_frames,
        move |frame: &[u8]| {
            sink.push(frame);
        },
    )
    .context("Failed to open ADC engine")?;
    engine.set_sample_rate(config.stream.sample_rate);

    let events = EventLoop::spawn(engine.transport()).context("Failed to spawn USB event thread")?;

    let writer = tokio::spawn(write_frames(receiver, open_output(output).await?));

    engine.start().context("Failed to start streaming")?;
    info!(
        "Streaming from device {} at {} Hz",
        index,
        engine.sample_rate()
    );

    let reason = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            StopReason::Interrupted
        }
        _ = sleep_for(duration) => StopReason::DurationElapsed,
        _ = wait_for_failure(&engine) => StopReason::EngineFailed,
    };
    info!("Stopping: {}", reason);
    let failed = session_failed(reason, engine.status());

    if let Err(e) = engine.stop() {
        error!("Error stopping engine: {:#}", e);
    }
    if !wait_for_drain(&engine, DRAIN_TIMEOUT).await {
        warn!(
            "{} transfers still in flight after {:?}",
            engine.active_transfers(),
            DRAIN_TIMEOUT
        );
    }

    events.shutdown();
    sender.close();

    let written = writer
        .await
        .context("Writer task panicked")?
        .context("Writer failed")?;

    let stats = sender.stats();
    let status = engine.status();
    engine.close();
    drop(device);

    eprintln!(
        "{} frames ({} bytes) received, {} dropped, {} bytes written",
        stats.delivered, stats.bytes, stats.dropped, written
    );

    if failed {
        return Err(anyhow!("Streaming failed, see log for the transfer error"));
    }
    if status == Status::Failed {
        warn!("A transfer completed after stop was requested; engine ended failed");
    }
    Ok(())
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_failure(engine: &AdcEngine<LibusbTransport>) {
    let mut interval = tokio::time::interval(STATUS_POLL);
    loop {
        interval.tick().await;
        if engine.status() == Status::Failed {
            return;
        }
    }
}

/// Wait until no transfer is in flight; false on timeout
async fn wait_for_drain(engine: &AdcEngine<LibusbTransport>, timeout: Duration) -> bool {
    let drained = async {
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        while engine.active_transfers() > 0 {
            interval.tick().await;
        }
    };
    tokio::time::timeout(timeout, drained).await.is_ok()
}
