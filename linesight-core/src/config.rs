//! Configuration for the inspection appliance
//!
//! One file drives the whole appliance. Sections mirror the hardware they
//! configure: `camera`, `sensor`, `classification`, `collection`, `paths`
//! and `pipeline`. Every section has defaults so a partial file is valid.

use crate::error::{InspectionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level appliance configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InspectionConfig {
    pub camera: CameraConfig,
    pub sensor: SensorConfig,
    pub classification: ClassificationConfig,
    pub collection: CollectionConfig,
    pub paths: PathsConfig,
    pub pipeline: PipelineSettings,
}

/// Encoded format for captured stills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
}

impl CaptureFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureFormat::Jpeg => "jpg",
            CaptureFormat::Png => "png",
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Video device index (0 = /dev/video0)
    pub device_index: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub capture_format: CaptureFormat,
    /// JPEG quality (1-100), ignored for PNG
    pub quality: u8,
    /// Upper bound for one still capture
    pub capture_timeout_ms: u64,
    /// Use the synthetic camera instead of a device
    pub simulate: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            image_width: 224,
            image_height: 224,
            capture_format: CaptureFormat::Jpeg,
            quality: 90,
            capture_timeout_ms: 3000,
            simulate: false,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err("Camera resolution must be non-zero".to_string());
        }
        if self.image_width > 7680 || self.image_height > 4320 {
            return Err("Camera resolution too large (max 8K)".to_string());
        }
        if self.quality == 0 || self.quality > 100 {
            return Err("JPEG quality must be between 1 and 100".to_string());
        }
        if self.capture_timeout_ms == 0 {
            return Err("capture_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

/// Physical sensor wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Digital presence line on a GPIO pin
    Gpio,
    /// Analog distance sensor on an ADC channel
    Adc,
}

/// Proximity sensor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    /// Synthesize detections instead of reading hardware
    pub simulate: bool,
    pub kind: SensorKind,
    /// GPIO pin number, or ADC channel for `adc`
    pub channel: u32,
    /// Presence is signalled by a low line (typical IR obstacle modules)
    pub active_low: bool,
    /// Analog presence threshold in volts
    pub voltage_threshold: f64,
    /// Readings outside this range are sensor faults
    pub min_valid_volts: f64,
    pub max_valid_volts: f64,
    /// sysfs GPIO root
    pub gpio_root: PathBuf,
    /// IIO device directory for ADC sensors
    pub iio_device: PathBuf,
    /// Minimum time between two accepted detections
    pub cooldown_secs: f64,
    /// Consecutive present samples required before a detection is accepted
    pub debounce_samples: u32,
    pub poll_interval_ms: u64,
    /// Pause after a failed read before sampling again
    pub fault_backoff_ms: u64,
    /// Period of synthesized detections in simulation
    pub simulation_interval_secs: f64,
    /// Explicit detection offsets (seconds from start); overrides the interval
    pub simulation_script: Option<Vec<f64>>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            kind: SensorKind::Gpio,
            channel: 17,
            active_low: true,
            voltage_threshold: 1.5,
            min_valid_volts: 0.0,
            max_valid_volts: 3.3,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            iio_device: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            cooldown_secs: 2.0,
            debounce_samples: 2,
            poll_interval_ms: 20,
            fault_backoff_ms: 500,
            simulation_interval_secs: 3.0,
            simulation_script: None,
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.cooldown_secs.is_finite() || self.cooldown_secs < 0.0 {
            return Err("cooldown_secs must be a non-negative number".to_string());
        }
        if self.cooldown_secs > 3600.0 {
            return Err("cooldown_secs too large (max 3600)".to_string());
        }
        if self.debounce_samples == 0 {
            return Err("debounce_samples must be >= 1".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be > 0".to_string());
        }
        if self.kind == SensorKind::Adc {
            if self.min_valid_volts >= self.max_valid_volts {
                return Err("min_valid_volts must be below max_valid_volts".to_string());
            }
            if !(self.min_valid_volts..=self.max_valid_volts).contains(&self.voltage_threshold) {
                return Err("voltage_threshold must lie inside the valid voltage range".to_string());
            }
        }
        if self.simulate {
            match &self.simulation_script {
                Some(script) => {
                    if script.iter().any(|t| !t.is_finite() || *t < 0.0) {
                        return Err("simulation_script offsets must be non-negative".to_string());
                    }
                }
                None => {
                    if !self.simulation_interval_secs.is_finite() || self.simulation_interval_secs <= 0.0 {
                        return Err("simulation_interval_secs must be > 0".to_string());
                    }
                }
            }
        }
        Ok(())
    }

    /// Zero when `cooldown_secs` is not a usable duration
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_secs).unwrap_or(Duration::ZERO)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }
}

/// Input tensor layout expected by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Pixel normalization applied before inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// [0, 1]
    Unit,
    /// [-1, 1]
    Signed,
    /// ImageNet mean/std
    Imagenet,
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationConfig {
    pub model_path: PathBuf,
    /// Ordered labels; index i names output class i
    pub labels: Vec<String>,
    pub input_width: u32,
    pub input_height: u32,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    /// Results below this confidence are flagged `low_confidence`
    pub confidence_threshold: f32,
    pub inference_timeout_ms: u64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/pretrained/model.onnx"),
            labels: vec!["good".to_string(), "defective".to_string()],
            input_width: 224,
            input_height: 224,
            layout: TensorLayout::Nchw,
            normalization: Normalization::Unit,
            confidence_threshold: 0.7,
            inference_timeout_ms: 5000,
        }
    }
}

impl ClassificationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.labels.is_empty() {
            return Err("At least one label is required".to_string());
        }
        if self.labels.iter().any(|l| l.trim().is_empty()) {
            return Err("Labels cannot be empty".to_string());
        }
        for (i, label) in self.labels.iter().enumerate() {
            if self.labels[..i].contains(label) {
                return Err(format!("Duplicate label '{}'", label));
            }
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err("Model input size must be non-zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err("confidence_threshold must be between 0.0 and 1.0".to_string());
        }
        if self.inference_timeout_ms == 0 {
            return Err("inference_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

/// Data collection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectionConfig {
    /// Stop collecting after this many images (0 = unlimited)
    pub images_per_session: u32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            images_per_session: 100,
        }
    }
}

/// Output directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub captured_images: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            captured_images: PathBuf::from("data/captured_images"),
            results_dir: PathBuf::from("data/classification_results"),
        }
    }
}

impl PathsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.captured_images.as_os_str().is_empty() {
            return Err("paths.captured_images cannot be empty".to_string());
        }
        if self.results_dir.as_os_str().is_empty() {
            return Err("paths.results_dir cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Controller timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Wait between detection and capture while the item enters the frame
    pub trigger_delay_ms: u64,
    /// Upper bound for `stop()` to wait on in-flight work
    pub stop_timeout_ms: u64,
    /// Periodic results summary (0 = disabled)
    pub report_interval_secs: u64,
    /// Capacity of the status event channel
    pub event_buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            trigger_delay_ms: 0,
            stop_timeout_ms: 2000,
            report_interval_secs: 300,
            event_buffer: 256,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stop_timeout_ms == 0 {
            return Err("stop_timeout_ms must be > 0".to_string());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be > 0".to_string());
        }
        Ok(())
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

impl InspectionConfig {
    /// Load configuration from a JSON or TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            InspectionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text, trying JSON first and TOML second
    pub fn from_str(content: &str) -> Result<Self> {
        let json_err = match serde_json::from_str::<InspectionConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };
        match toml::from_str::<InspectionConfig>(content) {
            Ok(config) => Ok(config),
            Err(toml_err) => Err(InspectionError::Config(format!(
                "Unrecognized configuration (JSON: {}; TOML: {})",
                json_err, toml_err
            ))),
        }
    }

    /// Write configuration back to disk; `.toml` files are written as TOML, anything else as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;
        let text = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::to_string_pretty(self)
                .map_err(|e| InspectionError::Config(format!("Failed to encode TOML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| InspectionError::Config(format!("Failed to encode JSON: {}", e)))?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.camera
            .validate()
            .and_then(|_| self.sensor.validate())
            .and_then(|_| self.classification.validate())
            .and_then(|_| self.paths.validate())
            .and_then(|_| self.pipeline.validate())
            .map_err(InspectionError::Config)
    }

    /// Switch every hardware-facing section to its simulated variant
    pub fn simulated(mut self) -> Self {
        self.sensor.simulate = true;
        self.camera.simulate = true;
        self
    }
}
