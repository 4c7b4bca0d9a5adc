//! Pipeline configuration.
//!
//! Every section is defaulted, so an empty TOML document yields the stock
//! configuration: a 224x224 MobileNet-normalized input, a 0.7 confidence
//! gate, five hand gestures and boxes expressed in a 1920x1080 frame.
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub decision: DecisionConfig,
    pub overlay: OverlayConfig,
    pub capture: CaptureConfig,
}

/// Model asset and input tensor layout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Filesystem path or `http(s)://` URL of the ONNX model.
    pub location: String,
    pub input_width: u32,
    pub input_height: u32,
    /// Per-channel mean, applied after scaling to `[0, 1]`.
    pub mean: [f32; 3],
    /// Per-channel standard deviation.
    pub std: [f32; 3],
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            location: "models/gesture.onnx".into(),
            input_width: 224,
            input_height: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionConfig {
    /// A detection is accepted only if its probability is strictly above this.
    pub threshold: f32,
    /// Class labels in the order of the model's probability output.
    pub labels: Vec<String>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            labels: vec![
                "Thumbs Up".into(),
                "Open palm".into(),
                "Closed fist".into(),
                "Peace sign".into(),
                "Pointing finger".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    /// Dimensions of the frame the model's boxes are expressed in.
    pub reference_width: u32,
    pub reference_height: u32,
    pub surface_width: u32,
    pub surface_height: u32,
    pub font_path: Option<PathBuf>,
    pub color: [u8; 3],
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            reference_width: 1920,
            reference_height: 1080,
            surface_width: 640,
            surface_height: 480,
            font_path: None,
            color: [0, 255, 0],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub device: String,
    pub format: String,
    /// Capture resolution, the camera's maximum if unset.
    pub resolution: Option<(u32, u32)>,
    /// Frame interval as `(numerator, denominator)`, the camera's fastest if unset.
    pub frame_rate: Option<(u32, u32)>,
    pub refresh_hz: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            format: "MJPG".into(),
            resolution: Some((640, 480)),
            frame_rate: None,
            refresh_hz: 60,
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.model.location.trim().is_empty() {
            return invalid("model location is empty".into());
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return invalid(format!(
                "model input size {}x{} has a zero dimension",
                self.model.input_width, self.model.input_height
            ));
        }
        if let Some(c) = self
            .model
            .std
            .iter()
            .position(|s| !s.is_finite() || *s == 0.0)
        {
            return invalid(format!("std of channel {c} must be finite and non-zero"));
        }
        if self.model.mean.iter().any(|m| !m.is_finite()) {
            return invalid("mean must be finite".into());
        }
        if !(0.0..=1.0).contains(&self.decision.threshold) {
            return invalid(format!(
                "threshold {} is outside [0, 1]",
                self.decision.threshold
            ));
        }
        if self.decision.labels.is_empty() {
            return invalid("label table is empty".into());
        }
        let overlay = &self.overlay;
        if overlay.reference_width == 0 || overlay.reference_height == 0 {
            return invalid("reference dimensions must be non-zero".into());
        }
        if overlay.surface_width == 0 || overlay.surface_height == 0 {
            return invalid("surface dimensions must be non-zero".into());
        }
        if self.capture.refresh_hz == 0 {
            return invalid("refresh rate must be non-zero".into());
        }

        Ok(())
    }
}
