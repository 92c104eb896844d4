use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plate_sightings::adapters::iou_tracker::IouTracker;
use plate_sightings::adapters::object_detector::ObjectDetector;
use plate_sightings::adapters::rtp_sink::RtpPreview;
use plate_sightings::adapters::tesseract_ocr::TesseractOcr;
use plate_sightings::adapters::video_source::VideoSource;
use plate_sightings::adapters::{DetectionAdapter, FrameSink, FrameSource};
use plate_sightings::alpr::index::{PlateIndex, Risk};
use plate_sightings::alpr::recovery::recover_leftovers;
use plate_sightings::alpr::session::{ProcessingSession, StatusLogger};
use plate_sightings::alpr::transient::TransientStore;
use plate_sightings::config::{Config, SourceConfig};
use plate_sightings::metrics;

#[derive(Parser, Debug)]
#[command(name = "plate_sightings", about = "Track vehicles, vote their plates and keep a sightings log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a video file or camera until the stream ends.
    Run {
        /// YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Video file path or camera index.
        #[arg(long)]
        source: Option<SourceConfig>,
        /// Process every N-th frame.
        #[arg(long)]
        frame_skip: Option<u32>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Finalize again the vehicles kept by failed finalizes.
    Recover {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Every recorded plate with its sighting count.
    List {
        #[arg(long, default_value = "logs")]
        output_dir: PathBuf,
    },
    /// Sightings of one plate, newest first.
    Show {
        plate: String,
        #[arg(long, default_value = "logs")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plate_sightings=info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            source,
            frame_skip,
            output_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(source) = source {
                config.source = source;
            }
            if let Some(frame_skip) = frame_skip {
                config.frame_skip = frame_skip;
            }
            if let Some(output_dir) = output_dir {
                config.output_dir = output_dir;
            }
            run(config)
        }
        Command::Recover { config, output_dir } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(output_dir) = output_dir {
                config.output_dir = output_dir;
            }
            recover(&config)
        }
        Command::List { output_dir } => list(&output_dir),
        Command::Show { plate, output_dir } => show(&output_dir, &plate),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn recover(config: &Config) -> Result<()> {
    let recovered = recover_leftovers(&config.output_dir, &config.video, config.fallback_fps)
        .context("recovering transient directories")?;
    if recovered.is_empty() {
        println!("nothing to recover in {}", config.output_dir.join("tmp").display());
        return Ok(());
    }

    let mut failed = 0;
    for recovery in &recovered {
        match &recovery.outcome {
            Ok(record) => println!(
                "{} -> {} ({})",
                recovery.vehicle, record.plate, record.record_id
            ),
            Err(e) => {
                failed += 1;
                println!("{} failed again: {}", recovery.vehicle, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} vehicles could not be recovered", recovered.len());
    }
    Ok(())
}

fn run(config: Config) -> Result<()> {
    let agent = match &config.profiling {
        Some(profiling) => {
            let agent = PyroscopeAgent::builder(profiling.url.as_str(), profiling.application.as_str())
                .backend(pprof_backend(PprofConfig::new().sample_rate(100)))
                .build()
                .context("building profiler")?;
            Some(agent.start().context("starting profiler")?)
        }
        None => None,
    };

    let leftovers = TransientStore::leftover_dirs(&config.output_dir.join("tmp"));
    if !leftovers.is_empty() {
        warn!(
            "{} transient directories kept by earlier failures, `recover` retries them: {:?}",
            leftovers.len(),
            leftovers
        );
    }

    let mut source = VideoSource::open(
        &config.source,
        config.frame_skip,
        config.fallback_fps,
        config.realtime,
    )
    .context("opening video source")?;

    let tracker = IouTracker::new(
        ObjectDetector::vehicle_detector(&config.models).context("loading vehicle model")?,
        &config.tracker,
    );
    let adapter = DetectionAdapter::new(
        Box::new(tracker),
        Box::new(ObjectDetector::plate_detector(&config.models).context("loading plate model")?),
        Box::new(TesseractOcr::new(&config.models).context("loading tesseract")?),
    );

    let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(StatusLogger)];
    if let Some(preview) = &config.preview {
        sinks.push(Box::new(RtpPreview::new(preview).context("starting preview")?));
    }

    let mut session = ProcessingSession::new(adapter, &config, source.write_fps())
        .context("opening processing session")?;
    let summary = session.run(&mut source, &mut sinks);
    info!(
        "{} frames processed, {} vehicles recorded",
        summary.frames,
        summary.records.len()
    );
    if let Some(reason) = &summary.interrupted {
        warn!("stream interrupted: {}", reason);
    }

    let metrics_path = config.output_dir.join("metrics.prom");
    fs::write(&metrics_path, metrics::gather_text())
        .with_context(|| format!("writing {}", metrics_path.display()))?;

    if let Some(agent) = agent {
        agent.stop().context("stopping profiler")?.shutdown();
    }
    Ok(())
}

fn list(output_dir: &Path) -> Result<()> {
    let index = PlateIndex::in_output_dir(output_dir).context("opening plate index")?;
    let summaries = index.summaries()?;
    if summaries.is_empty() {
        println!("no plates recorded in {}", index.path().display());
        return Ok(());
    }

    println!(
        "{:<12} {:>9}  {:<16}  {:<16}  {}",
        "PLATE", "SIGHTINGS", "FIRST SEEN", "LAST SEEN", "RISK"
    );
    for summary in summaries {
        println!(
            "{:<12} {:>9}  {:<16}  {:<16}  {}",
            summary.plate,
            summary.sightings,
            summary.first_seen.format("%m/%d/%Y %H:%M"),
            summary.last_seen.format("%m/%d/%Y %H:%M"),
            match summary.risk {
                Risk::High => "HIGH",
                Risk::Low => "low",
            }
        );
    }
    Ok(())
}

fn show(output_dir: &Path, plate: &str) -> Result<()> {
    let index = PlateIndex::in_output_dir(output_dir).context("opening plate index")?;
    let records = index.read(plate)?;
    if records.is_empty() {
        println!("{plate} has no recorded sightings");
        return Ok(());
    }

    println!("{plate}: {} sightings", records.len());
    for record in records {
        println!("{} {}  {}", record.date, record.time, record.record_id);
        for (label, path) in [
            ("video", &record.video_path),
            ("vehicle", &record.vehicle_still_path),
            ("plate", &record.plate_still_path),
        ] {
            match path {
                Some(path) => println!("  {label:<8} {}", output_dir.join(path).display()),
                None => println!("  {label:<8} -"),
            }
        }
    }
    Ok(())
}
