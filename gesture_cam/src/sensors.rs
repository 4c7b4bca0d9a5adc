//! Sensors module.
//!
use anyhow::Result;
use common::CaptureConfig;
use gesture_pipeline::sensors::CaptureFnSource;
use simple_error::simple_error;

#[cfg(feature = "camera")]
pub use camera::{get_capture_fn_linux, open_camera};

/// Check that `format` is a four character code such as `MJPG`.
pub fn fourcc(format: &str) -> Result<[u8; 4]> {
    format
        .as_bytes()
        .try_into()
        .map_err(|_| simple_error!("Format {:?} is not a four character code", format).into())
}

/// Open the configured camera.
#[cfg(not(feature = "camera"))]
pub fn open_camera(config: &CaptureConfig) -> Result<CaptureFnSource> {
    fourcc(&config.format)?;
    anyhow::bail!(
        "camera {} requested, but gesture_cam was built without the `camera` feature",
        config.device
    )
}

#[cfg(feature = "camera")]
mod camera {
    use bytes::Bytes;
    use gesture_pipeline::sensors::{CaptureFn, CapturedFrame};
    use rscam::{Camera, Config};

    use super::*;

    /// Open the configured camera.
    pub fn open_camera(config: &CaptureConfig) -> Result<CaptureFnSource> {
        let capture_fn = get_capture_fn_linux(
            &config.device,
            &config.format,
            config.resolution,
            config.frame_rate,
        )?;
        Ok(CaptureFnSource::new(capture_fn))
    }

    /// Get a capture function to a video device on a Linux machine.
    pub fn get_capture_fn_linux(
        device_name: &str,
        format: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<CaptureFn> {
        let format = fourcc(format)?;
        let mut cam = Camera::new(device_name)?;
        log_supported_formats(&cam, &format);

        log::info!("Using camera {}", device_name);

        let resolution = resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&cam, &format))?;

        let frame_rate = frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&cam, &format, resolution))?;

        log::info!(
            "Capturing {}x{} at {}/{} s per frame",
            resolution.0,
            resolution.1,
            frame_rate.0,
            frame_rate.1
        );

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format: &format,
            ..Default::default()
        })?;

        let callback = move || match cam.capture() {
            Ok(frame) => Some(CapturedFrame::encoded(Bytes::copy_from_slice(&frame[..]))),
            Err(err) => {
                log::debug!("No frame available: {err}");
                None
            }
        };
        Ok(Box::new(callback))
    }

    /// Get the maximum supported resolution for the given format.
    fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
        let resolution_info = cam.resolutions(format)?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Highest resolution in terms of number of pixels
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise {
                min: _,
                max,
                step: _,
            } => Some(max),
        }
        .ok_or_else(|| simple_error!("No resolution found").into())
    }

    /// Get the shortest supported frame interval for the given format and resolution.
    fn get_max_frame_rate(
        cam: &Camera,
        format: &[u8],
        resolution: (u32, u32),
    ) -> Result<(u32, u32)> {
        let interval_info = cam.intervals(format, resolution)?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        match interval_info {
            // Intervals are (numerator, denominator) seconds per frame
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                .filter(|(numerator, _)| *numerator > 0)
                .max_by(|a, b| {
                    let fps_a = a.1 as f32 / a.0 as f32;
                    let fps_b = b.1 as f32 / b.0 as f32;
                    fps_a.total_cmp(&fps_b)
                })
                .copied(),
            rscam::IntervalInfo::Stepwise {
                min,
                max: _,
                step: _,
            } => Some(min),
        }
        .ok_or_else(|| simple_error!("No frame rate found").into())
    }

    fn log_supported_formats(cam: &Camera, format: &[u8]) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!(
            "Supported formats: {:?}, using format {:?}",
            formats,
            String::from_utf8_lossy(format)
        );
    }

}
