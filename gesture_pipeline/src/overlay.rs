//! Drawing frames and decisions onto an output surface.
//!
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use common::OverlayConfig;
use image::{imageops::FilterType, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::{
    decision::{BoundingBox, Decision},
    sensors::Frame,
};

/// Height of label text in surface pixels.
const LABEL_SIZE: f32 = 16.0;

/// Rectangle in surface pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Drawable output of the pipeline.
pub trait Surface {
    fn dimensions(&self) -> (u32, u32);

    fn clear(&mut self);

    /// Draw `image` scaled to the full surface.
    fn draw_image(&mut self, image: &RgbImage);

    /// Draw the outline of `rect`.
    fn draw_rect(&mut self, rect: SurfaceRect, color: Rgb<u8>);

    /// Draw `text` with its top-left corner at `(x, y)`.
    fn draw_text(&mut self, x: f32, y: f32, text: &str, color: Rgb<u8>);

    /// Called once a repaint is complete.
    fn present(&mut self) {}
}

/// Scale a box from the model's reference frame into surface pixels.
pub fn to_surface_space(
    bbox: BoundingBox,
    surface: (u32, u32),
    reference: (u32, u32),
) -> SurfaceRect {
    let scale_x = surface.0 as f32 / reference.0 as f32;
    let scale_y = surface.1 as f32 / reference.1 as f32;

    SurfaceRect {
        x: bbox.x * scale_x,
        y: bbox.y * scale_y,
        width: bbox.width * scale_x,
        height: bbox.height * scale_y,
    }
}

/// Anchor of a label placed just above the top-left corner of `rect`.
fn label_anchor(rect: SurfaceRect) -> (f32, f32) {
    (rect.x.max(0.0), (rect.y - LABEL_SIZE - 2.0).max(0.0))
}

/// Repaints a surface with the current frame and decision.
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    reference: (u32, u32),
    color: Rgb<u8>,
    last_frame: Option<Frame>,
}

impl OverlayRenderer {
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            reference: (config.reference_width, config.reference_height),
            color: Rgb(config.color),
            last_frame: None,
        }
    }

    /// Fully repaint `surface`: the frame, then the decision's box and label if there is one.
    pub fn render<S: Surface + ?Sized>(&mut self, surface: &mut S, frame: &Frame, decision: &Decision) {
        surface.clear();
        surface.draw_image(frame.image());

        if let Some(detection) = decision {
            let rect = to_surface_space(detection.bbox, surface.dimensions(), self.reference);
            surface.draw_rect(rect, self.color);

            let (x, y) = label_anchor(rect);
            let text = format!("{} {:.0}%", detection.label, detection.confidence * 100.0);
            surface.draw_text(x, y, &text, self.color);
        }

        surface.present();
        self.last_frame = Some(frame.clone());
    }

    /// Repaint the last drawn frame without overlay. Returns `false` if nothing was drawn yet.
    pub fn redraw<S: Surface + ?Sized>(&self, surface: &mut S) -> bool {
        match &self.last_frame {
            Some(frame) => {
                surface.clear();
                surface.draw_image(frame.image());
                surface.present();
                true
            }
            None => false,
        }
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }
}

/// In-memory RGB surface drawn with `imageproc`.
pub struct ImageSurface {
    canvas: RgbImage,
    font: Option<Font<'static>>,
}

impl ImageSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbImage::new(width, height),
            font: None,
        }
    }

    pub fn from_config(config: &OverlayConfig) -> Result<Self> {
        let surface = Self::new(config.surface_width, config.surface_height);
        match &config.font_path {
            Some(path) => Ok(surface.with_font(load_font(path)?)),
            None => Ok(surface),
        }
    }

    pub fn with_font(mut self, font: Font<'static>) -> Self {
        self.font = Some(font);
        self
    }

    pub fn image(&self) -> &RgbImage {
        &self.canvas
    }
}

/// Load a TrueType font for label text.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
    let path = path.as_ref();
    let font_data =
        std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(font_data).ok_or_else(|| anyhow!("invalid font {}", path.display()))
}

impl Surface for ImageSurface {
    fn dimensions(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    fn clear(&mut self) {
        self.canvas.pixels_mut().for_each(|p| *p = Rgb([0, 0, 0]));
    }

    fn draw_image(&mut self, image: &RgbImage) {
        let (width, height) = self.canvas.dimensions();
        if image.dimensions() == (width, height) {
            self.canvas.copy_from_slice(image.as_raw());
        } else {
            self.canvas = image::imageops::resize(image, width, height, FilterType::Triangle);
        }
    }

    fn draw_rect(&mut self, rect: SurfaceRect, color: Rgb<u8>) {
        // `Rect` requires a non-zero size
        let rect = Rect::at(rect.x.round() as i32, rect.y.round() as i32).of_size(
            rect.width.round().max(1.0) as u32,
            rect.height.round().max(1.0) as u32,
        );
        draw_hollow_rect_mut(&mut self.canvas, rect, color);
    }

    fn draw_text(&mut self, x: f32, y: f32, text: &str, color: Rgb<u8>) {
        match &self.font {
            Some(font) => draw_text_mut(
                &mut self.canvas,
                color,
                x as i32,
                y as i32,
                Scale::uniform(LABEL_SIZE),
                font,
                text,
            ),
            None => log::debug!("No font loaded, skipping label {text:?}"),
        }
    }
}
