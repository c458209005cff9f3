//! linesight-core: detection → capture → classify → record pipeline for
//! an edge quality-inspection station.
//!
//! A proximity sensor reports items passing on the line; each accepted
//! detection captures a still which is either stored for later labelling
//! (collection mode) or classified on-device (classification mode). Every
//! outcome lands in an append-only results store.

pub mod camera;
pub mod config;
pub mod error;
pub mod hardware;
pub mod inference;
pub mod pipeline;
pub mod recorder;
pub mod sensor;
pub mod types;

pub use camera::{CameraDevice, ImageCapture, SimulatedCamera};
pub use config::InspectionConfig;
pub use error::{FaultKind, InspectionError, Result};
pub use hardware::{HardwareFactory, SystemHardware};
pub use inference::{InferenceEngine, InputSpec, ModelBackend, ModelLoader};
pub use pipeline::{PipelineController, PipelineEvent};
pub use recorder::{FileStore, ResultRecorder, ResultSummary, StoreFile, StoreOpener};
pub use sensor::{SensorMonitor, SimulatedSensor};
pub use types::*;
