//! Gesture camera binary.
//!
use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use common::PipelineConfig;
use env_logger::TimestampPrecision;
use gesture_cam::{sensors::open_camera, shutdown::cancel_on_signal, snapshot::SnapshotSurface};
use gesture_pipeline::{
    meter::{spawn_meter_logger, Meter},
    spawn_model_load, BufferLedger, CaptureScheduler, DisplayRefresh, FrameSource, ImageSurface,
    InferenceEngine, LabelTable, OnnxModelLoader, ReplaySource,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Path or URL of the ONNX model
    #[clap(long)]
    model: Option<String>,

    /// Video device to capture from
    #[clap(long)]
    device: Option<String>,

    /// Replay image files from this directory instead of using the camera
    #[clap(long)]
    frames_dir: Option<PathBuf>,

    /// Start over when the replayed frames run out
    #[clap(long)]
    loop_frames: bool,

    /// Minimum class probability of a detection
    #[clap(long)]
    threshold: Option<f32>,

    /// TrueType font for label text
    #[clap(long)]
    font: Option<PathBuf>,

    /// Write the composited output to this image file
    #[clap(long)]
    snapshot: Option<PathBuf>,

    /// Write a snapshot every n rendered frames
    #[clap(long, default_value = "30")]
    snapshot_every: u64,
}

impl Args {
    /// Configuration file (or defaults) with command line overrides applied.
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model.location = model.clone();
        }
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(threshold) = self.threshold {
            config.decision.threshold = threshold;
        }
        if let Some(font) = &self.font {
            config.overlay.font_path = Some(font.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let config = args.pipeline_config()?;

    let source: Box<dyn FrameSource> = match &args.frames_dir {
        Some(dir) => Box::new(
            ReplaySource::from_dir(dir, args.loop_frames)
                .with_context(|| format!("failed to read frames from {}", dir.display()))?,
        ),
        None => Box::new(open_camera(&config.capture)?),
    };

    let mut surface = SnapshotSurface::new(
        ImageSurface::from_config(&config.overlay)?,
        args.snapshot.clone(),
        args.snapshot_every,
    )?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), cancel.clone()));

    // The camera runs while the model loads, predictions start once it is ready
    let engine = Arc::new(InferenceEngine::new(
        OnnxModelLoader::new(&config.model),
        BufferLedger::new(),
    ));
    let model_load = spawn_model_load(
        Arc::clone(&engine),
        LabelTable::from_config(&config.decision),
        cancel.clone(),
    );

    let meter = Arc::new(Meter::new());
    spawn_meter_logger(Arc::clone(&meter), cancel.clone());

    let refresh = DisplayRefresh::new(config.capture.refresh_hz);
    let mut scheduler = CaptureScheduler::new(&config, source, refresh, engine).with_meter(meter);
    let stats = scheduler.run(&mut surface, &cancel).await;
    cancel.cancel();

    model_load.await??;
    let stats = stats?;
    log::info!(
        "Rendered {} of {} ticks, {} snapshots written",
        stats.rendered,
        stats.ticks,
        surface.written()
    );

    Ok(())
}
