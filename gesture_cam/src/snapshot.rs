//! Snapshots of the composited output.
//!
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gesture_pipeline::overlay::{ImageSurface, Surface, SurfaceRect};
use image::{ImageFormat, Rgb, RgbImage};

/// Surface that writes every `every`-th completed repaint to an image file.
pub struct SnapshotSurface {
    inner: ImageSurface,
    target: Option<(PathBuf, ImageFormat)>,
    every: u64,
    presented: u64,
    written: u64,
}

impl SnapshotSurface {
    /// Wrap `inner`. Without a path this only counts repaints.
    pub fn new(inner: ImageSurface, path: Option<PathBuf>, every: u64) -> Result<Self> {
        let target = match path {
            Some(path) => {
                let format = ImageFormat::from_path(&path).with_context(|| {
                    format!("unsupported snapshot file type {}", path.display())
                })?;
                Some((path, format))
            }
            None => None,
        };

        Ok(Self {
            inner,
            target,
            every: every.max(1),
            presented: 0,
            written: 0,
        })
    }

    pub fn image(&self) -> &RgbImage {
        self.inner.image()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn write(&self, path: &Path, format: ImageFormat) -> Result<()> {
        // Written beside the target and renamed so readers never see a partial image
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        self.inner
            .image()
            .save_with_format(&partial, format)
            .with_context(|| format!("failed to write {}", partial.display()))?;
        std::fs::rename(&partial, path)?;
        Ok(())
    }
}

impl Surface for SnapshotSurface {
    fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    fn clear(&mut self) {
        self.inner.clear()
    }

    fn draw_image(&mut self, image: &RgbImage) {
        self.inner.draw_image(image)
    }

    fn draw_rect(&mut self, rect: SurfaceRect, color: Rgb<u8>) {
        self.inner.draw_rect(rect, color)
    }

    fn draw_text(&mut self, x: f32, y: f32, text: &str, color: Rgb<u8>) {
        self.inner.draw_text(x, y, text, color)
    }

    fn present(&mut self) {
        self.presented += 1;
        if self.presented % self.every != 0 {
            return;
        }
        if let Some((path, format)) = &self.target {
            match self.write(path, *format) {
                Ok(()) => self.written += 1,
                Err(err) => log::warn!("Snapshot failed: {err:#}"),
            }
        }
    }
}
