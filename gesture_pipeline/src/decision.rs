//! Confidence-gated decisions.
//!
use std::fmt;

use common::DecisionConfig;

use crate::{
    error::{LabelIndexError, PipelineError},
    nn::RawPrediction,
};

/// Box as `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn rounded(self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
            width: self.width.round(),
            height: self.height.round(),
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x, y, width, height]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A confident detection. Its box is in the model's reference frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub class_index: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.1}%) at [{}, {}, {}, {}]",
            self.label,
            self.confidence * 100.0,
            self.bbox.x,
            self.bbox.y,
            self.bbox.width,
            self.bbox.height
        )
    }
}

/// `None` when nothing was detected with enough confidence.
pub type Decision = Option<Detection>;

/// Index-to-name mapping agreed with the model at training time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn from_config(config: &DecisionConfig) -> Self {
        Self::new(config.labels.clone())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&str, LabelIndexError> {
        self.labels
            .get(index)
            .map(String::as_str)
            .ok_or(LabelIndexError {
                index,
                len: self.labels.len(),
            })
    }

    /// Check the table against the length of the model's probability output.
    pub fn verify_class_count(&self, classes: usize) -> Result<(), PipelineError> {
        if classes != self.labels.len() {
            return Err(PipelineError::LabelTableMismatch {
                classes,
                labels: self.labels.len(),
            });
        }
        Ok(())
    }
}

/// Index and value of the largest probability. NaN entries never win; ties keep the first.
pub fn argmax(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .fold(None, |best, (index, p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((index, p)),
        })
}

/// Turn raw model outputs into a gated decision.
///
/// The arg-max class is accepted only if its probability is strictly above `threshold`. An
/// arg-max index without a label is an error regardless of its probability.
pub fn decide(
    raw: &RawPrediction,
    labels: &LabelTable,
    threshold: f32,
) -> Result<Decision, LabelIndexError> {
    let Some((class_index, confidence)) = argmax(raw.class_probs()) else {
        return Ok(None);
    };
    let label = labels.get(class_index)?;

    if confidence <= threshold {
        return Ok(None);
    }

    Ok(Some(Detection {
        label: label.to_owned(),
        class_index,
        confidence,
        bbox: BoundingBox::from(raw.bbox()).rounded(),
    }))
}
