use super::CameraDevice;
use crate::error::{InspectionError, Result};
use image::{Rgb, RgbImage};

/// Synthetic camera producing a moving test pattern
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    open: bool,
    frames: u64,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            open: false,
            frames: 0,
        }
    }

    /// Render frame `n` of the pattern: a diagonal gradient with a
    /// drifting bright bar and fine texture
    pub fn grab_pattern(&self, n: u64) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let bar = (n.wrapping_mul(7) % w as u64) as u32;
        RgbImage::from_fn(w, h, |x, y| {
            if x.abs_diff(bar) < 3 {
                return Rgb([240, 240, 240]);
            }
            let grain = ((x.wrapping_mul(31) ^ y.wrapping_mul(17)).wrapping_add(n as u32) % 32) as u8;
            Rgb([
                ((x * 255 / w) as u8).saturating_add(grain),
                ((y * 255 / h) as u8).saturating_sub(grain),
                (((x + y) * 127 / (w + h)) as u8).wrapping_add(grain),
            ])
        })
    }
}

impl CameraDevice for SimulatedCamera {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage> {
        if !self.open {
            return Err(InspectionError::Capture("Simulated camera is not open".to_string()));
        }
        self.frames += 1;
        Ok(self.grab_pattern(self.frames))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!("simulated {}x{}", self.width, self.height)
    }
}
