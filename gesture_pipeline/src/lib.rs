//! Real-time gesture recognition on camera frames.
//!
//! Frames are pulled once per refresh, normalized into the model's input tensor, classified,
//! gated on confidence and drawn back onto an output surface together with the detected
//! gesture's box and label.
pub mod decision;
pub mod error;
pub mod ledger;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod preprocess;
pub mod scheduler;
pub mod sensors;
pub mod utils;

pub use decision::{decide, BoundingBox, Decision, Detection, LabelTable};
pub use error::{FrameDecodeError, InferenceError, LabelIndexError, ModelLoadError, PipelineError};
pub use ledger::{BufferLedger, Tracked};
pub use nn::{
    spawn_model_load, GestureModel, InferenceEngine, ModelLoader, ModelOutputs, OnnxModelLoader,
    RawPrediction,
};
pub use overlay::{ImageSurface, OverlayRenderer, Surface, SurfaceRect};
pub use scheduler::{
    CaptureScheduler, DisplayRefresh, ManualRefresh, RefreshHandle, RefreshSignal,
    SchedulerStats, TickOutcome,
};
pub use sensors::{CaptureFnSource, CapturedFrame, Frame, FrameSource, ReplaySource};
