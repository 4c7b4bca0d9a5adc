//! Frame decoding and tensor preparation.
//!
use common::ModelConfig;
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::{
    error::FrameDecodeError,
    ledger::{BufferLedger, Tracked},
    sensors::{CapturedFrame, Frame, FramePayload},
};

/// Decode a captured frame into RGB pixels.
pub fn decode_frame(captured: CapturedFrame) -> Result<Frame, FrameDecodeError> {
    let image = match captured.payload {
        FramePayload::Encoded(data) if data.is_empty() => return Err(FrameDecodeError::Empty),
        FramePayload::Encoded(data) => decode_bytes(&data)?,
        FramePayload::Pixels(image) => image,
    };

    if image.width() == 0 || image.height() == 0 {
        return Err(FrameDecodeError::ZeroDimension {
            width: image.width(),
            height: image.height(),
        });
    }

    Ok(Frame::new(image, captured.captured_at))
}

#[cfg(not(feature = "turbojpeg"))]
fn decode_bytes(data: &[u8]) -> Result<RgbImage, FrameDecodeError> {
    Ok(image::load_from_memory(data)?.to_rgb8())
}

#[cfg(feature = "turbojpeg")]
fn decode_bytes(data: &[u8]) -> Result<RgbImage, FrameDecodeError> {
    // JPEG start-of-image marker
    if data.starts_with(&[0xFF, 0xD8]) {
        return turbojpeg::decompress_image(data)
            .map_err(|err| FrameDecodeError::Jpeg(err.to_string()));
    }
    Ok(image::load_from_memory(data)?.to_rgb8())
}

/// Turns frames into normalized `[1, height, width, 3]` input tensors.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    mean: [f32; 3],
    std: [f32; 3],
    ledger: BufferLedger,
}

impl Preprocessor {
    pub fn new(config: &ModelConfig, ledger: BufferLedger) -> Self {
        Self {
            width: config.input_width,
            height: config.input_height,
            mean: config.mean,
            std: config.std,
            ledger,
        }
    }

    /// Shape of the produced tensors, NHWC.
    pub fn input_shape(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, 3]
    }

    /// Resize bilinearly, scale to `[0, 1]` and normalize per channel.
    ///
    /// The resized intermediate image is freed on return; only the tracked tensor escapes and
    /// the caller owns its release.
    pub fn run(&self, frame: &Frame) -> Tracked<Tensor> {
        let resized: RgbImage =
            image::imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);

        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, self.height as usize, self.width as usize, 3),
            |(_, y, x, c)| {
                (resized[(x as _, y as _)][c] as f32 / 255.0 - self.mean[c]) / self.std[c]
            },
        )
        .into();

        self.ledger.track(tensor)
    }

    /// Lowest and highest value channel `c` can take after normalization.
    pub fn channel_bounds(&self, c: usize) -> (f32, f32) {
        (
            (0.0 - self.mean[c]) / self.std[c],
            (1.0 - self.mean[c]) / self.std[c],
        )
    }
}
