//! Audio Player (pcmq-ap) - Main entry point
//!
//! Plays one raw PCM file through the audio output device and exits when
//! playback ends. Ctrl+C stops playback first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pcmq_ap::audio::{AudioDevice, CpalDevice, SimulatedDevice};
use pcmq_ap::{ConfigOverrides, PlaybackController, PlayerConfig};
use pcmq_common::config::ConfigSource;
use pcmq_common::{PlayerEvent, SampleEncoding};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for pcmq-ap
#[derive(Parser, Debug)]
#[command(name = "pcmq-ap")]
#[command(about = "Raw PCM buffer-queue audio player")]
#[command(version)]
struct Args {
    /// Raw PCM file to play
    #[arg(required_unless_present = "list_devices")]
    path: Option<PathBuf>,

    /// Configuration file (default: <config dir>/pcmq/config.toml)
    #[arg(short, long, env = "PCMQ_CONFIG")]
    config: Option<PathBuf>,

    /// Output device name
    #[arg(short, long)]
    device: Option<String>,

    /// Number of buffers in the queue (2-8)
    #[arg(short, long)]
    buffers: Option<usize>,

    /// Frames per buffer
    #[arg(long)]
    buffer_frames: Option<usize>,

    /// Sample rate of the stream in Hz
    #[arg(short = 'r', long)]
    sample_rate: Option<u32>,

    /// Channel count of the stream (1 or 2)
    #[arg(long)]
    channels: Option<u8>,

    /// Bits per sample (8, 16, 24 or 32)
    #[arg(long)]
    bits: Option<u8>,

    /// Sample encoding: signed, unsigned or float
    #[arg(long)]
    encoding: Option<SampleEncoding>,

    /// Play through a simulated device in real time (no audio output)
    #[arg(long)]
    dry_run: bool,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
            buffer_count: self.buffers,
            buffer_frames: self.buffer_frames,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits,
            encoding: self.encoding,
        }
    }
}

/// How the playback loop ended
enum Outcome {
    Finished,
    Interrupted,
    Failed(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_source) = PlayerConfig::load(args.config.as_deref(), &args.overrides())
        .context("Failed to load configuration")?;

    // Initialize tracing (RUST_LOG wins over the configured level)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pcmq-ap {}", env!("CARGO_PKG_VERSION"));
    match &config_source {
        ConfigSource::File(path) => info!("Configuration: {}", path.display()),
        ConfigSource::Defaults => info!("Configuration: compiled defaults"),
    }

    if args.list_devices {
        let devices = CpalDevice::list_devices().context("Failed to list output devices")?;
        for name in devices {
            println!("{}", name);
        }
        return Ok(());
    }

    let path = args.path.clone().context("No PCM file given")?;

    let device: Arc<dyn AudioDevice> = if args.dry_run {
        info!("Dry run: using simulated output device");
        Arc::new(SimulatedDevice::timed(1.0))
    } else {
        Arc::new(CpalDevice::new(config.device.clone()))
    };
    info!("Output: {} ({})", device.describe(), config.format);

    let controller = Arc::new(
        PlaybackController::new(device, config).context("Failed to initialize player")?,
    );

    // Subscribe before starting so no event of this session is missed
    let mut events = controller.subscribe();
    let session_id = controller
        .start(&path)
        .with_context(|| format!("Failed to start playback of {}", path.display()))?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut progress = tokio::time::interval(Duration::from_secs(1));

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, stopping playback");
                let stopper = Arc::clone(&controller);
                tokio::task::spawn_blocking(move || stopper.stop())
                    .await
                    .context("Stop task failed")?;
                break Outcome::Interrupted;
            }
            _ = progress.tick() => {
                debug!("Position: {:.1}s", controller.position().as_secs_f64());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    debug!(
                        "Event: {}",
                        serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event))
                    );
                    if event.session_id() != session_id || !event.is_final() {
                        continue;
                    }
                    match event {
                        PlayerEvent::PlaybackFailed { reason, .. } => break Outcome::Failed(reason),
                        _ => break Outcome::Finished,
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break Outcome::Finished,
            }
        }
    };

    let stats = controller.stats();
    info!(
        "Played {:.2}s ({} buffers, {} bytes, {} underruns)",
        controller.position().as_secs_f64(),
        stats.buffers_enqueued,
        stats.bytes_played,
        stats.underruns
    );

    match outcome {
        Outcome::Finished => info!("Playback complete"),
        Outcome::Interrupted => info!("Playback stopped"),
        Outcome::Failed(reason) => bail!("Playback failed: {}", reason),
    }
    Ok(())
}
