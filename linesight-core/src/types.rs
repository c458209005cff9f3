//! Data passed between pipeline stages

use crate::config::CaptureFormat;
use crate::error::FaultKind;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A debounced "object present" event.
///
/// Deliberately not `Clone`: each event is consumed exactly once by the
/// controller.
#[derive(Debug)]
pub struct DetectionEvent {
    sequence: u64,
    timestamp: DateTime<Utc>,
    raw_reading: f64,
    debounced: bool,
}

impl DetectionEvent {
    pub fn new(sequence: u64, raw_reading: f64, debounced: bool) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            raw_reading,
            debounced,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw_reading(&self) -> f64 {
        self.raw_reading
    }

    pub fn debounced(&self) -> bool {
        self.debounced
    }
}

/// What a sensor monitor reports through its callback
#[derive(Debug)]
pub enum SensorSignal {
    Detected(DetectionEvent),
    /// Recoverable read failure; sampling continues after a backoff
    Fault(String),
}

/// One still frame, saved to disk and kept decoded for inference
#[derive(Debug)]
pub struct CapturedFrame {
    path: PathBuf,
    format: CaptureFormat,
    pixels: RgbImage,
    captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    pub fn new(path: PathBuf, format: CaptureFormat, pixels: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            path,
            format,
            pixels,
            captured_at,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Classifier verdict for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    /// In [0, 1]
    pub confidence: f32,
    #[serde(with = "duration_ms")]
    pub inference_latency: Duration,
}

/// Operating mode of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Idle,
    Collecting,
    Classifying,
}

impl PipelineMode {
    pub fn record_mode(&self) -> Option<RecordMode> {
        match self {
            PipelineMode::Idle => None,
            PipelineMode::Collecting => Some(RecordMode::Collect),
            PipelineMode::Classifying => Some(RecordMode::Classify),
        }
    }
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineMode::Idle => f.write_str("idle"),
            PipelineMode::Collecting => f.write_str("collecting"),
            PipelineMode::Classifying => f.write_str("classifying"),
        }
    }
}

/// Mode tag written with every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    Collect,
    Classify,
}

impl RecordMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordMode::Collect => "collect",
            RecordMode::Classify => "classify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(RecordMode::Collect),
            "classify" => Some(RecordMode::Classify),
            _ => None,
        }
    }
}

/// How a record came out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Ok,
    LowConfidence,
    /// Inference failed; the image is kept with this marker
    InferenceError(String),
}

impl RecordOutcome {
    pub fn to_field(&self) -> String {
        match self {
            RecordOutcome::Ok => "ok".to_string(),
            RecordOutcome::LowConfidence => "low_confidence".to_string(),
            RecordOutcome::InferenceError(msg) => format!("inference_error:{}", msg),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(RecordOutcome::Ok),
            "low_confidence" => Some(RecordOutcome::LowConfidence),
            other => other
                .strip_prefix("inference_error:")
                .map(|msg| RecordOutcome::InferenceError(msg.to_string())),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RecordOutcome::InferenceError(_))
    }
}

/// One row of the results store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub record_id: u64,
    pub timestamp: DateTime<Utc>,
    pub mode: RecordMode,
    /// Captured image the record refers to
    pub frame_reference: PathBuf,
    /// Copy kept with the results (classify mode)
    pub archived_image: Option<PathBuf>,
    pub result: Option<ClassificationResult>,
    pub outcome: RecordOutcome,
}

impl ResultRecord {
    pub fn label(&self) -> Option<&str> {
        self.result.as_ref().map(|r| r.label.as_str())
    }

    pub fn confidence(&self) -> Option<f32> {
        self.result.as_ref().map(|r| r.confidence)
    }

    /// Image the store points at: the archived copy when there is one
    pub fn image_reference(&self) -> &Path {
        self.archived_image.as_deref().unwrap_or(&self.frame_reference)
    }
}

/// Live statistics shown by the interface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub events_detected: u64,
    /// Detections that arrived while the previous one was still in flight
    pub events_dropped: u64,
    pub frames_captured: u64,
    pub records_written: u64,
    pub faults: HashMap<FaultKind, u64>,
}

impl PipelineCounters {
    pub fn fault_count(&self, kind: FaultKind) -> u64 {
        self.faults.get(&kind).copied().unwrap_or(0)
    }
}

/// Process-wide pipeline status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub mode: PipelineMode,
    pub running: bool,
    pub last_error: Option<String>,
    pub counters: PipelineCounters,
    pub last_record: Option<ResultRecord>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Idle,
            running: false,
            last_error: None,
            counters: PipelineCounters::default(),
            last_record: None,
        }
    }
}

impl PipelineState {
    /// One-line status string for operators
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} | detected {} | captured {} | recorded {} | dropped {}",
            self.mode,
            self.counters.events_detected,
            self.counters.frames_captured,
            self.counters.records_written,
            self.counters.events_dropped,
        );
        if let Some(record) = &self.last_record {
            if let Some(result) = &record.result {
                line.push_str(&format!(
                    " | last: {} ({:.1}%)",
                    result.label,
                    result.confidence * 100.0
                ));
            }
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" | last error: {}", err));
        }
        line
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        Duration::try_from_secs_f64(ms.max(0.0) / 1000.0).map_err(serde::de::Error::custom)
    }
}
