//! Error types of the pipeline stages.
//!
use std::path::PathBuf;

use thiserror::Error;

/// The model asset could not be fetched or parsed.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file {0:?} not found")]
    NotFound(PathBuf),
    #[error("failed to fetch model from {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("no cache directory available for downloaded models")]
    NoCacheDir,
    #[error("model cache error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("model loading task failed: {0}")]
    Join(String),
}

/// A captured frame could not be turned into pixel data.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("captured frame is empty")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to decode jpeg frame: {0}")]
    Jpeg(String),
    #[error("decoded frame has a zero dimension ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
}

/// The model call was rejected or produced unusable output.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference requested before the model finished loading")]
    NotReady,
    #[error("model execution failed: {0}")]
    Execution(String),
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
    #[error("inference task failed: {0}")]
    Join(String),
}

/// The arg-max class index has no entry in the label table.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("class index {index} has no label (label table has {len} entries)")]
pub struct LabelIndexError {
    pub index: usize,
    pub len: usize,
}

/// Errors that stop the capture loop. Everything else stays within its tick.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    LabelIndex(#[from] LabelIndexError),
    #[error("model reports {classes} classes but the label table has {labels} entries")]
    LabelTableMismatch { classes: usize, labels: usize },
    #[error(transparent)]
    Config(#[from] common::ConfigError),
}
