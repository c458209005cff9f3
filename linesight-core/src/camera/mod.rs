//! Still-image capture to disk
//!
//! [`ImageCapture`] owns a [`CameraDevice`] exclusively. A capture holds the
//! device lock for its whole duration, so a second concurrent request fails
//! fast with [`InspectionError::CaptureBusy`] instead of queueing.

#[cfg(feature = "opencv")]
mod opencv;
mod simulated;

#[cfg(feature = "opencv")]
pub use self::opencv::OpenCvCamera;
pub use simulated::SimulatedCamera;

use crate::config::{CameraConfig, CaptureFormat};
use crate::error::{InspectionError, Result};
use crate::types::CapturedFrame;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, ImageEncoder, RgbImage};
use parking_lot::{Mutex, MutexGuard};
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A source of raw frames. Calls are blocking.
pub trait CameraDevice: Send {
    fn open(&mut self) -> Result<()>;

    /// Grab one frame at the device's native resolution
    fn grab(&mut self) -> Result<RgbImage>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn describe(&self) -> String;
}

/// Exclusive, blocking still capture
pub struct ImageCapture {
    device: Mutex<Box<dyn CameraDevice>>,
    config: CameraConfig,
    output_dir: PathBuf,
    sequence: AtomicU64,
    /// Close requested while a capture held the device
    release_pending: AtomicBool,
}

/// Holds the device for one capture; performs a deferred close on drop
struct CaptureGuard<'a> {
    device: MutexGuard<'a, Box<dyn CameraDevice>>,
    release_pending: &'a AtomicBool,
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if self.release_pending.swap(false, Ordering::SeqCst) {
            self.device.close();
            info!("Camera released after in-flight capture");
        }
    }
}

impl ImageCapture {
    pub fn new(device: Box<dyn CameraDevice>, config: CameraConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            device: Mutex::new(device),
            config,
            output_dir: output_dir.into(),
            sequence: AtomicU64::new(0),
            release_pending: AtomicBool::new(false),
        }
    }

    /// Open the device and make sure the output directory exists
    pub fn open(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            InspectionError::Capture(format!(
                "Cannot create image directory {}: {}",
                self.output_dir.display(),
                e
            ))
        })?;

        let mut device = self
            .device
            .try_lock_for(self.config.capture_timeout())
            .ok_or(InspectionError::CaptureBusy)?;
        self.release_pending.store(false, Ordering::SeqCst);
        if !device.is_open() {
            device.open()?;
            info!(
                "Camera {} opened, saving {}x{} {} stills to {}",
                device.describe(),
                self.config.image_width,
                self.config.image_height,
                self.config.capture_format.extension(),
                self.output_dir.display()
            );
        }
        Ok(())
    }

    /// Release the device, waiting at most the capture timeout for an
    /// in-flight capture; otherwise the release happens when it finishes.
    pub fn close(&self) {
        match self.device.try_lock_for(self.config.capture_timeout()) {
            Some(mut device) => {
                if device.is_open() {
                    device.close();
                    info!("Camera {} closed", device.describe());
                }
            }
            None => {
                warn!("Capture still in flight; camera will be released when it completes");
                self.release_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.try_lock().map(|d| d.is_open()).unwrap_or(true)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Grab a frame, scale it to the configured resolution and save it
    /// under a name no other capture can take.
    pub fn capture(&self) -> Result<CapturedFrame> {
        let device = self.device.try_lock().ok_or(InspectionError::CaptureBusy)?;
        let mut guard = CaptureGuard {
            device,
            release_pending: &self.release_pending,
        };

        if !guard.device.is_open() {
            return Err(InspectionError::Capture("Camera is not open".to_string()));
        }

        let raw = guard.device.grab()?;
        let captured_at = Utc::now();
        let (width, height) = (self.config.image_width, self.config.image_height);
        let pixels = if raw.dimensions() == (width, height) {
            raw
        } else {
            imageops::resize(&raw, width, height, FilterType::Triangle)
        };

        let encoded = encode(&pixels, self.config.capture_format, self.config.quality)?;
        let path = self.write_unique(&encoded, captured_at)?;
        debug!("Captured {} ({} bytes)", path.display(), encoded.len());

        Ok(CapturedFrame::new(path, self.config.capture_format, pixels, captured_at))
    }

    fn write_unique(&self, bytes: &[u8], at: chrono::DateTime<Utc>) -> Result<PathBuf> {
        let stamp = at.format("%Y%m%d_%H%M%S_%3f");
        let ext = self.config.capture_format.extension();
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            let path = self.output_dir.join(format!("{}_{:06}.{}", stamp, seq, ext));
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                // left over from a previous run with the same clock reading
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(InspectionError::Capture(format!(
                        "Failed to create {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            let mut writer = BufWriter::new(file);
            writer
                .write_all(bytes)
                .and_then(|_| writer.flush())
                .map_err(|e| InspectionError::Capture(format!("Failed to write {}: {}", path.display(), e)))?;
            return Ok(path);
        }
    }
}

impl Drop for ImageCapture {
    fn drop(&mut self) {
        let device = self.device.get_mut();
        if device.is_open() {
            device.close();
        }
    }
}

/// Encode pixels in the capture format
pub fn encode(pixels: &RgbImage, format: CaptureFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        CaptureFormat::Jpeg => {
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode(
                pixels.as_raw(),
                pixels.width(),
                pixels.height(),
                ColorType::Rgb8,
            )?;
        }
        CaptureFormat::Png => {
            PngEncoder::new(&mut buf).write_image(
                pixels.as_raw(),
                pixels.width(),
                pixels.height(),
                ColorType::Rgb8,
            )?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn config(format: CaptureFormat) -> CameraConfig {
        CameraConfig {
            image_width: 64,
            image_height: 48,
            capture_format: format,
            simulate: true,
            ..Default::default()
        }
    }

    fn capture_in(dir: &Path, format: CaptureFormat) -> ImageCapture {
        ImageCapture::new(Box::new(SimulatedCamera::new(160, 120)), config(format), dir)
    }

    #[test]
    fn test_capture_resizes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_in(dir.path(), CaptureFormat::Png);
        capture.open().unwrap();

        let frame = capture.capture().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert!(frame.path().starts_with(dir.path()));
        assert_eq!(frame.path().extension().unwrap(), "png");

        let decoded = image::open(frame.path()).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 48));
        assert_eq!(&decoded, frame.pixels());
    }

    #[test]
    fn test_capture_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_in(dir.path(), CaptureFormat::Jpeg);
        assert!(matches!(capture.capture(), Err(InspectionError::Capture(_))));

        capture.open().unwrap();
        assert!(capture.capture().is_ok());
        capture.close();
        assert!(!capture.is_open());
        assert!(capture.capture().is_err());
    }

    #[test]
    fn test_rapid_captures_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_in(dir.path(), CaptureFormat::Jpeg);
        capture.open().unwrap();

        let paths: HashSet<PathBuf> = (0..20)
            .map(|_| capture.capture().unwrap().path().to_path_buf())
            .collect();
        assert_eq!(paths.len(), 20);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 20);
    }

    #[test]
    fn test_concurrent_capture_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(capture_in(dir.path(), CaptureFormat::Jpeg));
        capture.open().unwrap();

        // hold the device the way an in-flight capture does
        let held = capture.device.lock();
        let err = capture.capture().unwrap_err();
        assert!(err.is_busy());
        drop(held);
        assert!(capture.capture().is_ok());
    }

    #[test]
    fn test_close_during_capture_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(CaptureFormat::Jpeg);
        cfg.capture_timeout_ms = 10;
        let capture = ImageCapture::new(Box::new(SimulatedCamera::new(64, 48)), cfg, dir.path());
        capture.open().unwrap();

        {
            let guard = CaptureGuard {
                device: capture.device.lock(),
                release_pending: &capture.release_pending,
            };
            capture.close();
            assert!(guard.device.is_open());
        }
        assert!(!capture.is_open());
    }

    #[test]
    fn test_jpeg_quality_affects_size() {
        let pixels = SimulatedCamera::new(128, 128).grab_pattern(3);
        let low = encode(&pixels, CaptureFormat::Jpeg, 10).unwrap();
        let high = encode(&pixels, CaptureFormat::Jpeg, 95).unwrap();
        assert!(low.len() < high.len());
    }
}
