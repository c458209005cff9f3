//! Error types for linesight-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised anywhere in the detection → capture → inference → record pipeline
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("Sensor fault: {0}")]
    Sensor(String),

    #[error("Camera busy: a capture is already in flight")]
    CaptureBusy,

    #[error("Capture fault: {0}")]
    Capture(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Model not ready: no model has been loaded")]
    NotReady,

    #[error("Inference fault: {0}")]
    Inference(String),

    #[error("Storage fault: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, InspectionError>;

/// Fault taxonomy surfaced to the interface layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Sensor,
    Capture,
    ModelLoad,
    Inference,
    Storage,
    Config,
    State,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Sensor => "sensor",
            FaultKind::Capture => "capture",
            FaultKind::ModelLoad => "model_load",
            FaultKind::Inference => "inference",
            FaultKind::Storage => "storage",
            FaultKind::Config => "config",
            FaultKind::State => "state",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InspectionError {
    /// Classify this error into the pipeline fault taxonomy
    pub fn kind(&self) -> FaultKind {
        match self {
            InspectionError::Sensor(_) => FaultKind::Sensor,
            InspectionError::CaptureBusy | InspectionError::Capture(_) => FaultKind::Capture,
            InspectionError::ModelLoad(_) => FaultKind::ModelLoad,
            InspectionError::NotReady | InspectionError::Inference(_) => FaultKind::Inference,
            InspectionError::Storage(_) | InspectionError::Io(_) => FaultKind::Storage,
            InspectionError::Image(_) => FaultKind::Capture,
            InspectionError::Config(_) => FaultKind::Config,
            InspectionError::InvalidState(_) => FaultKind::State,
            // Timeouts are reported by the stage that armed them, which rewraps them.
            InspectionError::Timeout(_) => FaultKind::Capture,
        }
    }

    /// Whether the pipeline keeps running after this fault.
    ///
    /// Model load errors refuse to enter classification mode and storage
    /// faults stop the pipeline (after the recorder's retry); everything else
    /// drops the affected event and carries on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.kind(),
            FaultKind::ModelLoad | FaultKind::Storage | FaultKind::Config
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, InspectionError::CaptureBusy)
    }
}
