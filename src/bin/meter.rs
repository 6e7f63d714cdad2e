//! Live Level Meter
//!
//! Captures from an input device and prints RMS / peak levels until Ctrl+C.
//!
//! ```text
//! capture-meter --list
//! capture-meter [DEVICE_INDEX] [--gain 1.5] [--config path/to/config.toml]
//! ```

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture_meter::{
    audio::{AudioBlock, AudioSource, DeviceDirectory, DeviceId, Level},
    config::AppConfig,
};

/// Lowest level shown on the bar
const METER_FLOOR_DB: f32 = -60.0;

/// Bar width in characters
const METER_WIDTH: usize = 40;

/// Refresh interval
const REFRESH: Duration = Duration::from_millis(50);

/// Latest level, shared lock-free with the capture thread
///
/// RMS in the high 32 bits, peak in the low 32 bits.
struct LevelCell(AtomicU64);

impl LevelCell {
    fn new() -> Self {
        Self(AtomicU64::new(Self::pack(Level::SILENCE)))
    }

    fn pack(level: Level) -> u64 {
        ((level.rms_db.to_bits() as u64) << 32) | level.peak_db.to_bits() as u64
    }

    fn store(&self, level: Level) {
        self.0.store(Self::pack(level), Ordering::Relaxed);
    }

    fn load(&self) -> Level {
        let packed = self.0.load(Ordering::Relaxed);
        Level {
            rms_db: f32::from_bits((packed >> 32) as u32),
            peak_db: f32::from_bits(packed as u32),
        }
    }
}

struct Args {
    list: bool,
    device: Option<usize>,
    gain: Option<f32>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        list: false,
        device: None,
        gain: None,
        config: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--list" | "-l" => args.list = true,
            "--gain" | "-g" => {
                let value = iter.next().context("--gain needs a value")?;
                args.gain = Some(value.parse().context("invalid gain")?);
            }
            "--config" | "-c" => {
                let value = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(value));
            }
            other => match other.parse::<usize>() {
                Ok(index) => args.device = Some(index),
                Err(_) => bail!("unknown argument: {}", other),
            },
        }
    }
    Ok(args)
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    match path.or_else(AppConfig::default_path) {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {}", path.display());
            AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(AppConfig::default()),
    }
}

fn zone(db: f32) -> &'static str {
    if db > -3.0 {
        "CLIP"
    } else if db > -12.0 {
        "HOT "
    } else {
        "OK  "
    }
}

fn bar(db: f32) -> String {
    let fraction = ((db - METER_FLOOR_DB) / -METER_FLOOR_DB).clamp(0.0, 1.0);
    let filled = (fraction * METER_WIDTH as f32).round() as usize;
    format!("{}{}", "#".repeat(filled), "-".repeat(METER_WIDTH - filled))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args()?;
    let directory = DeviceDirectory::new();

    if args.list {
        println!("\n=== Input Devices ===");
        for device in directory.devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}: {}{}", device.index, device.name, default_marker);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
        return Ok(());
    }

    let config = load_config(args.config)?;
    let device = match args.device {
        Some(index) => DeviceId::Index(index),
        None => config.capture.device.clone(),
    };
    if let Some(info) = directory.find(&device) {
        tracing::info!("Using input device {}: {}", info.index, info.name);
    }

    let mut source = AudioSource::new(config.capture.clone(), config.meter);
    if let Some(gain) = args.gain {
        source.set_gain(gain);
    }

    let level = Arc::new(LevelCell::new());
    let level_for_callback = level.clone();
    source.set_callback(move |_: &AudioBlock, current: Level| {
        level_for_callback.store(current);
        Ok(())
    });

    source.start(device).context("starting audio capture")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || running_for_handler.store(false, Ordering::SeqCst))
        .context("installing Ctrl+C handler")?;

    let mut stdout = std::io::stdout();
    while running.load(Ordering::SeqCst) {
        while let Some(event) = source.check_errors() {
            tracing::warn!("{}", event);
        }

        let current = level.load();
        write!(
            stdout,
            "\rRMS  {} {:>7.1} dB {}   PEAK {} {:>7.1} dB {}",
            bar(current.rms_db),
            current.rms_db.max(METER_FLOOR_DB),
            zone(current.rms_db),
            bar(current.peak_db),
            current.peak_db.max(METER_FLOOR_DB),
            zone(current.peak_db),
        )?;
        stdout.flush()?;

        std::thread::sleep(REFRESH);
    }
    println!();

    let stats = source.stats();
    source.stop()?;
    tracing::info!(
        "Delivered {} blocks, {} callback errors, {} overflows",
        stats.blocks_delivered,
        stats.callback_errors,
        stats.overflows
    );

    Ok(())
}
