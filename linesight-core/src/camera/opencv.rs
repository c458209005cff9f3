//! USB/V4L2 camera through OpenCV

use super::CameraDevice;
use crate::error::{InspectionError, Result};
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH},
};
use tracing::{info, warn};

pub struct OpenCvCamera {
    index: u32,
    /// Requested native resolution; the driver may pick the nearest mode
    resolution: (u32, u32),
    capture: Option<VideoCapture>,
}

impl OpenCvCamera {
    pub fn new(index: u32, resolution: (u32, u32)) -> Self {
        Self {
            index,
            resolution,
            capture: None,
        }
    }
}

fn camera_err(context: &str, e: opencv::Error) -> InspectionError {
    InspectionError::Capture(format!("{}: {}", context, e))
}

impl CameraDevice for OpenCvCamera {
    fn open(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let mut capture = VideoCapture::new(self.index as i32, CAP_ANY)
            .map_err(|e| camera_err(&format!("Failed to open camera {}", self.index), e))?;
        if !capture
            .is_opened()
            .map_err(|e| camera_err(&format!("Camera {} not opened", self.index), e))?
        {
            return Err(InspectionError::Capture(format!(
                "Camera {} failed to open",
                self.index
            )));
        }

        let (width, height) = self.resolution;
        if let Err(e) = capture
            .set(CAP_PROP_FRAME_WIDTH, width as f64)
            .and_then(|_| capture.set(CAP_PROP_FRAME_HEIGHT, height as f64))
        {
            warn!("Camera {} rejected {}x{}: {}", self.index, width, height, e);
        }

        info!("Camera {} opened", self.index);
        self.capture = Some(capture);
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| InspectionError::Capture("Camera is not open".to_string()))?;

        let mut frame = Mat::default();
        let grabbed = capture
            .read(&mut frame)
            .map_err(|e| camera_err("Failed to read frame", e))?;
        if !grabbed || frame.rows() == 0 || frame.cols() == 0 {
            return Err(InspectionError::Capture(format!(
                "Camera {} returned an empty frame",
                self.index
            )));
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(|e| camera_err("Failed to convert frame", e))?;

        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let bytes = rgb
            .data_bytes()
            .map_err(|e| camera_err("Frame data not accessible", e))?
            .to_vec();
        RgbImage::from_raw(width, height, bytes).ok_or_else(|| {
            InspectionError::Capture(format!("Frame buffer does not match {}x{} RGB", width, height))
        })
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("Failed to release camera {}: {}", self.index, e);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    fn describe(&self) -> String {
        format!("/dev/video{}", self.index)
    }
}
