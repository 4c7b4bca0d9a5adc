//! Frame sources.
//!
//! The pipeline pulls one frame per tick through [`FrameSource::capture`]. A source answers with
//! a captured frame or with `None` when nothing is available yet, e.g. while a camera warms up.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use image::RgbImage;

/// Raw data handed out by a frame source.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Encoded image, e.g. an MJPG camera buffer or a PNG file.
    Encoded(Bytes),
    /// Already decoded RGB pixels.
    Pixels(RgbImage),
}

/// A frame as captured, before decoding.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub payload: FramePayload,
    pub captured_at: Instant,
}

impl CapturedFrame {
    pub fn encoded(data: impl Into<Bytes>) -> Self {
        Self {
            payload: FramePayload::Encoded(data.into()),
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(image: RgbImage) -> Self {
        Self {
            payload: FramePayload::Pixels(image),
            captured_at: Instant::now(),
        }
    }
}

/// Immutable RGB snapshot of one tick. Clones share the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: Instant) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// Pull-based access to a stream of frames.
pub trait FrameSource {
    /// Capture the next frame, `None` if none is available right now.
    fn capture(&mut self) -> Option<CapturedFrame>;

    /// Whether the source will never produce another frame.
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn capture(&mut self) -> Option<CapturedFrame> {
        (**self).capture()
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

pub type CaptureFn = Box<dyn FnMut() -> Option<CapturedFrame>>;

/// Frame source backed by a capture closure.
pub struct CaptureFnSource {
    capture_fn: CaptureFn,
}

impl CaptureFnSource {
    /// Create a new instance.
    pub fn new(capture_fn: CaptureFn) -> Self {
        Self { capture_fn }
    }
}

impl FrameSource for CaptureFnSource {
    fn capture(&mut self) -> Option<CapturedFrame> {
        (self.capture_fn)()
    }
}

/// Replays image files from a directory in file name order.
pub struct ReplaySource {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
}

const REPLAY_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

impl ReplaySource {
    pub fn from_dir(dir: impl AsRef<Path>, looping: bool) -> std::io::Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| REPLAY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        log::info!(
            "Replaying {} frames from {}",
            paths.len(),
            dir.as_ref().display()
        );

        Ok(Self {
            paths,
            next: 0,
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn capture(&mut self) -> Option<CapturedFrame> {
        if self.paths.is_empty() {
            return None;
        }
        if self.next >= self.paths.len() {
            if !self.looping {
                return None;
            }
            self.next = 0;
        }

        let path = &self.paths[self.next];
        self.next += 1;

        match fs::read(path) {
            Ok(data) => Some(CapturedFrame::encoded(data)),
            Err(err) => {
                log::warn!("Could not read frame {}: {err}", path.display());
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        !self.looping && self.next >= self.paths.len()
    }
}
