//! Common code shared between `gesture_pipeline` and `gesture_cam`.
pub mod config;

pub use config::{
    CaptureConfig, ConfigError, DecisionConfig, ModelConfig, OverlayConfig, PipelineConfig,
};
