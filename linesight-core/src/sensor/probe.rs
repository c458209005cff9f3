//! Blocking hardware probes read through Linux sysfs

use crate::error::{InspectionError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One sample from a probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Raw value: line level for GPIO, volts for ADC
    pub value: f64,
    pub present: bool,
}

/// A blocking source of presence samples
pub trait SensorProbe: Send {
    fn sample(&mut self) -> Result<SensorReading>;

    fn describe(&self) -> String;
}

/// Re-read a sysfs attribute through an already open handle
fn read_attribute(file: &mut File, path: &Path) -> Result<String> {
    let mut buf = String::with_capacity(16);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut buf))
        .map_err(|e| InspectionError::Sensor(format!("Failed to read {}: {}", path.display(), e)))?;
    Ok(buf.trim().to_string())
}

/// Digital presence line exported through `/sys/class/gpio`
pub struct GpioProbe {
    pin: u32,
    active_low: bool,
    value_path: PathBuf,
    value: File,
}

impl GpioProbe {
    /// Open `gpio<pin>/value`, exporting the pin first when needed
    pub fn open(gpio_root: &Path, pin: u32, active_low: bool) -> Result<Self> {
        let pin_dir = gpio_root.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            debug!("Exporting GPIO {} via {}", pin, gpio_root.display());
            OpenOptions::new()
                .write(true)
                .open(gpio_root.join("export"))
                .and_then(|mut f| f.write_all(pin.to_string().as_bytes()))
                .map_err(|e| InspectionError::Sensor(format!("Failed to export GPIO {}: {}", pin, e)))?;
        }

        let value_path = pin_dir.join("value");
        let value = File::open(&value_path).map_err(|e| {
            InspectionError::Sensor(format!("GPIO {} not available at {}: {}", pin, value_path.display(), e))
        })?;
        info!("GPIO sensor opened on pin {} (active_low={})", pin, active_low);

        Ok(Self {
            pin,
            active_low,
            value_path,
            value,
        })
    }
}

impl SensorProbe for GpioProbe {
    fn sample(&mut self) -> Result<SensorReading> {
        let raw = read_attribute(&mut self.value, &self.value_path)?;
        let level = match raw.as_str() {
            "0" => 0.0,
            "1" => 1.0,
            other => {
                return Err(InspectionError::Sensor(format!(
                    "GPIO {} returned invalid level '{}'",
                    self.pin, other
                )))
            }
        };
        let high = level > 0.5;
        Ok(SensorReading {
            value: level,
            present: high != self.active_low,
        })
    }

    fn describe(&self) -> String {
        format!("gpio{}", self.pin)
    }
}

/// Analog distance sensor on an IIO ADC channel
pub struct AdcProbe {
    channel: u32,
    raw_path: PathBuf,
    raw: File,
    /// Millivolts per LSB, from `in_voltage<N>_scale`
    scale_mv: f64,
    threshold: f64,
    valid_range: (f64, f64),
}

impl AdcProbe {
    pub fn open(
        iio_device: &Path,
        channel: u32,
        threshold: f64,
        valid_range: (f64, f64),
    ) -> Result<Self> {
        let scale_path = iio_device.join(format!("in_voltage{}_scale", channel));
        let scale_mv = match std::fs::read_to_string(&scale_path) {
            Ok(text) => text.trim().parse::<f64>().map_err(|e| {
                InspectionError::Sensor(format!("Invalid ADC scale in {}: {}", scale_path.display(), e))
            })?,
            // Some drivers only expose a shared scale
            Err(_) => {
                let shared = iio_device.join("in_voltage_scale");
                let text = std::fs::read_to_string(&shared).map_err(|e| {
                    InspectionError::Sensor(format!("ADC scale not available at {}: {}", shared.display(), e))
                })?;
                text.trim().parse::<f64>().map_err(|e| {
                    InspectionError::Sensor(format!("Invalid ADC scale in {}: {}", shared.display(), e))
                })?
            }
        };

        let raw_path = iio_device.join(format!("in_voltage{}_raw", channel));
        let raw = File::open(&raw_path).map_err(|e| {
            InspectionError::Sensor(format!("ADC channel {} not available at {}: {}", channel, raw_path.display(), e))
        })?;
        info!(
            "ADC sensor opened on channel {} (threshold {:.2} V, scale {} mV/LSB)",
            channel, threshold, scale_mv
        );

        Ok(Self {
            channel,
            raw_path,
            raw,
            scale_mv,
            threshold,
            valid_range,
        })
    }
}

impl SensorProbe for AdcProbe {
    fn sample(&mut self) -> Result<SensorReading> {
        let text = read_attribute(&mut self.raw, &self.raw_path)?;
        let counts: f64 = text.parse().map_err(|_| {
            InspectionError::Sensor(format!("ADC channel {} returned '{}'", self.channel, text))
        })?;
        let volts = counts * self.scale_mv / 1000.0;

        let (min, max) = self.valid_range;
        if !volts.is_finite() || volts < min || volts > max {
            return Err(InspectionError::Sensor(format!(
                "ADC channel {} reading {:.3} V outside valid range [{:.2}, {:.2}]",
                self.channel, volts, min, max
            )));
        }

        Ok(SensorReading {
            value: volts,
            present: volts >= self.threshold,
        })
    }

    fn describe(&self) -> String {
        format!("adc{}", self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_active_low() {
        let dir = tempfile::tempdir().unwrap();
        let pin_dir = dir.path().join("gpio17");
        std::fs::create_dir_all(&pin_dir).unwrap();
        std::fs::write(pin_dir.join("value"), "1\n").unwrap();

        let mut probe = GpioProbe::open(dir.path(), 17, true).unwrap();
        let reading = probe.sample().unwrap();
        assert_eq!(reading.value, 1.0);
        assert!(!reading.present);

        std::fs::write(pin_dir.join("value"), "0\n").unwrap();
        assert!(probe.sample().unwrap().present);
        assert_eq!(probe.describe(), "gpio17");
    }

    #[test]
    fn test_gpio_invalid_level_is_fault() {
        let dir = tempfile::tempdir().unwrap();
        let pin_dir = dir.path().join("gpio4");
        std::fs::create_dir_all(&pin_dir).unwrap();
        std::fs::write(pin_dir.join("value"), "x").unwrap();

        let mut probe = GpioProbe::open(dir.path(), 4, false).unwrap();
        assert!(matches!(probe.sample(), Err(InspectionError::Sensor(_))));
    }

    #[test]
    fn test_gpio_missing_pin() {
        let dir = tempfile::tempdir().unwrap();
        // no export file either
        assert!(GpioProbe::open(dir.path(), 5, false).is_err());
    }

    #[test]
    fn test_adc_threshold_and_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in_voltage0_scale"), "0.805664062\n").unwrap();
        std::fs::write(dir.path().join("in_voltage0_raw"), "2500\n").unwrap();

        let mut probe = AdcProbe::open(dir.path(), 0, 1.5, (0.0, 3.3)).unwrap();
        let reading = probe.sample().unwrap();
        assert!((reading.value - 2.014).abs() < 0.01);
        assert!(reading.present);

        std::fs::write(dir.path().join("in_voltage0_raw"), "100\n").unwrap();
        assert!(!probe.sample().unwrap().present);

        // 5000 counts ~ 4.03 V, beyond a 3.3 V rail
        std::fs::write(dir.path().join("in_voltage0_raw"), "5000\n").unwrap();
        assert!(matches!(probe.sample(), Err(InspectionError::Sensor(_))));
    }

    #[test]
    fn test_adc_shared_scale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in_voltage_scale"), "1.0").unwrap();
        std::fs::write(dir.path().join("in_voltage2_raw"), "1200").unwrap();

        let mut probe = AdcProbe::open(dir.path(), 2, 1.0, (0.0, 3.3)).unwrap();
        assert!((probe.sample().unwrap().value - 1.2).abs() < 1e-9);
    }
}
