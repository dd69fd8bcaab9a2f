//! crashscan - screen one video for vehicle collisions
//!
//! Samples every Nth frame of a local video (or a `stub://` stream), asks the
//! configured classifier about each sample and prints the timestamps where a
//! collision was flagged.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crashscan::{
    build_classifier, frame::DEFAULT_JPEG_QUALITY, ClassificationResult, ClassifierKind,
    FileConfig, FileSource, Incident, IncidentReport, ProgressObserver,
    SamplingOptions, SamplingPipeline, ScanConfig,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "crashscan",
    about = "Screen a video for vehicle collisions using sampled frames"
)]
struct Args {
    /// Video file (.mp4, .avi, .mov) or stub:// stream
    #[arg(value_name = "PATH")]
    path: String,

    /// Config file (JSON, or TOML by extension)
    #[arg(long, value_name = "PATH", env = "CRASHSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Classify every Nth frame
    #[arg(long, value_name = "N")]
    stride: Option<u64>,

    /// Frame rate used when the container reports none
    #[arg(long, value_name = "FPS")]
    default_fps: Option<f64>,

    /// Classifier backend (openai|stub)
    #[arg(long, value_name = "NAME")]
    classifier: Option<String>,

    /// Write annotated JPEGs of flagged frames into this directory
    #[arg(long, value_name = "DIR")]
    snapshots: Option<PathBuf>,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        load_config(&args)?
    };
    let options = SamplingOptions::from_config(&cfg)?;
    let mut classifier = build_classifier(&cfg)?;
    let mut source = FileSource::new(FileConfig {
        path: args.path.clone(),
    })?;
    if let Some(dir) = &args.snapshots {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot directory {}", dir.display()))?;
    }

    let mut observer = CliObserver {
        progress: ui.scan(&format!("Scan {}", args.path)),
        snapshots: args.snapshots.clone(),
        snapshot_errors: 0,
    };
    let mut pipeline = SamplingPipeline::new(options);
    log::info!(
        "classifying every {} frame(s) with {} (default fps {})",
        pipeline.options().stride(),
        classifier.name(),
        pipeline.options().default_fps()
    );
    let result = pipeline.run(&mut source, &mut classifier, &mut observer);
    let snapshot_errors = observer.snapshot_errors;
    log::info!(
        "classified {} sampled frame(s)",
        observer.progress.classified_count()
    );
    drop(observer);

    if snapshot_errors > 0 {
        log::warn!("{} snapshot(s) could not be written", snapshot_errors);
    }

    match result {
        Ok(report) => {
            print_report(&report, args.json)?;
            Ok(())
        }
        Err(err) => {
            if let Some(partial) = err.partial() {
                if !partial.is_empty() {
                    eprintln!("incidents found before the failure:");
                    print_report(partial, args.json)?;
                }
            }
            Err(err.into())
        }
    }
}

fn load_config(args: &Args) -> Result<ScanConfig> {
    let mut cfg = ScanConfig::load_from(args.config.as_deref())?;
    if let Some(stride) = args.stride {
        cfg.sampling.stride = stride;
    }
    if let Some(fps) = args.default_fps {
        cfg.sampling.default_fps = fps;
    }
    if let Some(name) = args.classifier.as_deref() {
        cfg.classifier.kind = ClassifierKind::parse(name)?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_report(report: &IncidentReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if report.is_empty() {
        println!("No accidents were detected in the video.");
        return Ok(());
    }
    println!("Accidents were detected at the following timestamps:");
    for incident in report.incidents() {
        println!("  {}  (frame {})", incident.timestamp, incident.frame_index);
    }
    Ok(())
}

struct CliObserver {
    progress: ui::ScanProgress,
    snapshots: Option<PathBuf>,
    snapshot_errors: u64,
}

impl ProgressObserver for CliObserver {
    fn on_incident(&mut self, incident: &Incident, caption: &str) {
        self.progress.note(caption);
        if let Some(dir) = &self.snapshots {
            if let Err(err) = write_snapshot(dir, incident) {
                log::warn!("snapshot for frame {}: {:#}", incident.frame_index, err);
                self.snapshot_errors += 1;
            }
        }
    }

    fn on_classified(&mut self, frame_index: u64, result: &ClassificationResult) {
        self.progress.classified(frame_index);
        log::debug!("frame {} -> {:?}", frame_index, result.raw);
    }
}

fn write_snapshot(dir: &Path, incident: &Incident) -> Result<()> {
    let jpeg = incident
        .frame
        .annotated()
        .encode_jpeg(DEFAULT_JPEG_QUALITY)?;
    let path = dir.join(format!("incident-{:08}.jpg", incident.frame_index));
    std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
