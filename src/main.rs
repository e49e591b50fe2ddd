//! Astro capture CLI application

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use astro_capture::config::Config;
use astro_capture::ser::time::ticks_to_datetime;
use astro_capture::ser::{self, Completeness, SerReader, SerWriter};
use astro_capture::{device, recorder, Acquisition, Preview};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "astro-capture")]
#[command(about = "Imaging sensor acquisition with SER video recording")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream and record until Ctrl+C or the duration elapses
    Record {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print header, completeness and timestamps of a SER file
    Inspect {
        file: PathBuf,

        /// Also print details of this frame
        #[arg(short, long)]
        frame: Option<u32>,
    },

    /// Take one still exposure and save it as a single-frame SER file
    Still,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    let config = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Config::load(path)?
        }
        None => Config::default(),
    };
    ser::set_never_swap(config.recording.never_swap);

    match cli.command {
        Command::Record { duration } => run_record(config, duration).await,
        Command::Inspect { file, frame } => run_inspect(&file, frame),
        Command::Still => tokio::task::spawn_blocking(move || run_still(&config)).await?,
    }
}

async fn run_record(config: Config, duration: Option<u64>) -> Result<()> {
    let device = device::open(&config.device)?;
    let acq = Arc::new(Acquisition::new(device, &config)?);

    acq.toggle_record(true);
    acq.start_streaming()?;
    info!(
        output_dir = %config.recording.output_dir.display(),
        duration = ?duration,
        "Recording started, press Ctrl+C to stop"
    );

    let stats_task = tokio::spawn(report_stats(Arc::clone(&acq)));
    let preview_task = tokio::spawn(watch_preview(Arc::clone(&acq), config.preview.target_fps));

    let limit = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let stream_ended = {
        let acq = Arc::clone(&acq);
        async move {
            while acq.is_active() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
        _ = limit => info!("Duration reached"),
        _ = stream_ended => warn!("Stream ended on its own"),
    }

    stats_task.abort();
    preview_task.abort();
    acq.request_abort();

    let waiter = Arc::clone(&acq);
    match tokio::task::spawn_blocking(move || waiter.wait_idle(Duration::from_secs(30))).await? {
        Ok(outcome) => debug!(outcome = ?outcome, "Capture finished"),
        Err(e) => error!(error = %e, "Capture failed"),
    }

    let stats = acq.stats();
    info!(
        captured = %stats.frames_captured,
        dropped = %stats.frames_dropped,
        drop_rate = %format!("{:.2}%", stats.drop_rate() * 100.0),
        hardware_dropped = %stats.hardware_dropped,
        timeouts = %stats.timeouts,
        "Recording finished"
    );

    tokio::task::spawn_blocking(move || acq.shutdown()).await?;
    Ok(())
}

/// Logs stats periodically
async fn report_stats(acq: Arc<Acquisition>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut previous = acq.stats();
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let stats = acq.stats();
        info!(
            fps = %format!("{:.1}", stats.fps),
            record_fps = %format!("{:.1}", stats.calculate_fps(&previous, 2.0)),
            captured = %stats.frames_captured,
            dropped = %stats.frames_dropped,
            drop_rate = %format!("{:.2}%", stats.drop_rate() * 100.0),
            buffer = %format!("{:.0}%", stats.buffer_fullness * 100.0),
            "Stats"
        );
        previous = stats;
    }
}

/// Stands in for a display: pulls decimated frames and logs their level
async fn watch_preview(acq: Arc<Acquisition>, target_fps: u32) {
    let mut preview = Preview::new(target_fps);
    let period = preview.interval().max(Duration::from_millis(5));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;
        let Some(stream) = acq.session().stream() else {
            continue;
        };
        if let Some(frame) = preview.poll(&stream) {
            debug!(
                sequence = %frame.sequence,
                level = %format!("{:.3}", frame.mean_level()),
                "Preview frame"
            );
        }
    }
}

fn run_still(config: &Config) -> Result<()> {
    let device = device::open(&config.device)?;
    let acq = Acquisition::new(device, config)?;

    acq.capture_still()?;
    let wait = Duration::from_millis(config.device.exposure_ms) * 2 + Duration::from_secs(10);
    acq.wait_idle(wait)?;
    let image = acq.take_still().context("no still image was produced")?;

    let prefix = format!("{}still_", config.recording.prefix);
    let path = recorder::container_path(&config.recording.output_dir, &prefix);
    let mut writer = SerWriter::new(&path);
    if let Some(e) = writer.open_error() {
        bail!("cannot create {}: {}", path.display(), e);
    }

    let format = image.format;
    writer.prepare_header(
        format.dims(),
        &config.recording.metadata(),
        format.bytes_per_channel,
        format.color,
    )?;
    writer.write_frame(&image.data)?;
    let bytes = writer.close()?;

    info!(path = %path.display(), bytes = %bytes, "Still saved");
    acq.shutdown();
    Ok(())
}

fn run_inspect(file: &Path, frame: Option<u32>) -> Result<()> {
    let mut reader = SerReader::open(file)?;
    let header = reader.header().clone();

    let color = match header.color() {
        Some(color) => color.to_string(),
        None => format!("unknown ({})", header.color_id),
    };
    let completeness = match reader.completeness() {
        Completeness::Complete => "complete".to_string(),
        Completeness::MissingTrailer => "no timestamp trailer".to_string(),
        Completeness::IncompleteTrailer { present, expected } => {
            format!("trailer has {} of {} bytes", present, expected)
        }
        Completeness::Truncated { declared, available } => {
            format!("truncated, {} of {} frames present", available, declared)
        }
    };

    println!("File:        {}", file.display());
    println!("Size:        {} bytes", reader.file_size());
    println!("Status:      {}", completeness);
    println!("Resolution:  {}x{}", header.width, header.height);
    println!("Color:       {}", color);
    println!("Depth:       {} bits", header.pixel_depth);
    println!("Frame size:  {} bytes", reader.frame_size());
    println!("Frames:      {}", reader.frame_count());
    println!("Big-endian:  {}", header.data_is_big_endian());
    println!("Observer:    {}", header.observer);
    println!("Instrument:  {}", header.instrument);
    println!("Telescope:   {}", header.telescope);
    if let Some(local) = ticks_to_datetime(header.date_time) {
        println!("Started:     {} (local)", local.naive_utc());
    }
    if let Some(utc) = ticks_to_datetime(header.date_time_utc) {
        println!("Started UTC: {}", utc);
    }

    if reader.has_trailer() {
        if let Some(duration) = reader.duration() {
            println!("Duration:    {:.3} s", duration.as_secs_f64());
            if reader.frame_count() > 1 && !duration.is_zero() {
                let fps = f64::from(reader.frame_count() - 1) / duration.as_secs_f64();
                println!("Frame rate:  {:.2} fps", fps);
            }
        }
    }

    if let Some(index) = frame {
        let data = reader.get_frame(index)?;
        let mean = data.iter().map(|&b| u64::from(b)).sum::<u64>() as f64 / data.len().max(1) as f64;
        println!();
        println!("Frame {}:", index);
        println!("  Bytes:     {}", data.len());
        println!("  Mean byte: {:.2}", mean);
        match reader.frame_time(index) {
            Ok(Some(time)) => println!("  Time:      {}", time),
            Ok(None) => println!("  Time:      out of range"),
            Err(e) => println!("  Time:      unavailable ({})", e),
        }
    }

    Ok(())
}
