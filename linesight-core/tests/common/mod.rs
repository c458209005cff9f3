//! Fakes shared by the pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use linesight_core::camera::{CameraDevice, SimulatedCamera};
use linesight_core::inference::{InputSpec, ModelBackend, ModelLoader};
use linesight_core::sensor::{SensorMonitor, SimulatedSensor, SimulationPattern};
use linesight_core::{
    FileStore, HardwareFactory, InspectionConfig, InspectionError, PipelineController, PipelineState, Result,
    StoreFile, StoreOpener,
};
use image::RgbImage;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Camera that fails on chosen grab numbers (1-based)
pub struct FlakyCamera {
    inner: SimulatedCamera,
    grabs: u64,
    failing: HashSet<u64>,
}

impl FlakyCamera {
    pub fn failing_on(grabs: &[u64]) -> Self {
        Self {
            inner: SimulatedCamera::new(64, 48),
            grabs: 0,
            failing: grabs.iter().copied().collect(),
        }
    }
}

impl CameraDevice for FlakyCamera {
    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn grab(&mut self) -> Result<RgbImage> {
        self.grabs += 1;
        if self.failing.contains(&self.grabs) {
            return Err(InspectionError::Capture(format!("injected failure on grab {}", self.grabs)));
        }
        self.inner.grab()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}

/// Model that always produces the same scores, after `delay`
pub struct FixedModelLoader {
    pub scores: Vec<f32>,
    pub delay: Duration,
}

struct FixedBackend {
    scores: Vec<f32>,
    delay: Duration,
}

impl ModelBackend for FixedBackend {
    fn output_classes(&self) -> usize {
        self.scores.len()
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        assert!(!input.is_empty());
        std::thread::sleep(self.delay);
        Ok(self.scores.clone())
    }
}

impl ModelLoader for FixedModelLoader {
    fn load(&self, bytes: &[u8], _spec: &InputSpec) -> Result<Box<dyn ModelBackend>> {
        if bytes.is_empty() {
            return Err(InspectionError::ModelLoad("empty model file".to_string()));
        }
        Ok(Box::new(FixedBackend {
            scores: self.scores.clone(),
            delay: self.delay,
        }))
    }
}

/// Results store on a disk that fills up: every append after the first
/// `healthy_appends` writes half its bytes and fails
pub struct FillingStore {
    healthy_appends: usize,
    appends: Arc<AtomicUsize>,
}

impl FillingStore {
    pub fn after(healthy_appends: usize) -> Self {
        Self {
            healthy_appends,
            appends: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct FillingFile {
    inner: Box<dyn StoreFile>,
    healthy_appends: usize,
    appends: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreFile for FillingFile {
    async fn committed_len(&mut self) -> std::io::Result<u64> {
        self.inner.committed_len().await
    }

    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.appends.fetch_add(1, Ordering::SeqCst) >= self.healthy_appends {
            self.inner.append(&bytes[..bytes.len() / 2]).await?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"));
        }
        self.inner.append(bytes).await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.inner.sync().await
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.inner.truncate(len).await
    }
}

#[async_trait]
impl StoreOpener for FillingStore {
    async fn open_append(&self, path: &Path) -> std::io::Result<Box<dyn StoreFile>> {
        Ok(Box::new(FillingFile {
            inner: FileStore.open_append(path).await?,
            healthy_appends: self.healthy_appends,
            appends: self.appends.clone(),
        }))
    }
}

/// Hardware with a scripted sensor, a flaky camera and a fixed model
pub struct FakeHardware {
    pub script: Vec<Duration>,
    pub cooldown: Duration,
    pub failing_grabs: Vec<u64>,
    pub scores: Vec<f32>,
    pub infer_delay: Duration,
    /// Appends the results store accepts before the disk is full
    pub store_capacity: Option<usize>,
}

impl FakeHardware {
    pub fn scripted(offsets_ms: &[u64], cooldown_ms: u64) -> Self {
        Self {
            script: offsets_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            cooldown: Duration::from_millis(cooldown_ms),
            failing_grabs: Vec::new(),
            scores: vec![0.9, 0.1],
            infer_delay: Duration::ZERO,
            store_capacity: None,
        }
    }

    pub fn with_failing_grabs(mut self, grabs: &[u64]) -> Self {
        self.failing_grabs = grabs.to_vec();
        self
    }

    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = scores;
        self
    }

    pub fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    pub fn with_store_full_after(mut self, appends: usize) -> Self {
        self.store_capacity = Some(appends);
        self
    }
}

impl HardwareFactory for FakeHardware {
    fn sensor(&self, _config: &InspectionConfig) -> Result<Box<dyn SensorMonitor>> {
        Ok(Box::new(SimulatedSensor::new(
            SimulationPattern::Scripted(self.script.clone()),
            self.cooldown,
        )))
    }

    fn camera(&self, _config: &InspectionConfig) -> Result<Box<dyn CameraDevice>> {
        Ok(Box::new(FlakyCamera::failing_on(&self.failing_grabs)))
    }

    fn model_loader(&self, _config: &InspectionConfig) -> Result<Arc<dyn ModelLoader>> {
        Ok(Arc::new(FixedModelLoader {
            scores: self.scores.clone(),
            delay: self.infer_delay,
        }))
    }

    fn results_store(&self, _config: &InspectionConfig) -> Arc<dyn StoreOpener> {
        match self.store_capacity {
            Some(appends) => Arc::new(FillingStore::after(appends)),
            None => Arc::new(FileStore),
        }
    }
}

/// Simulated configuration writing everything under `dir`
pub fn test_config(dir: &Path) -> InspectionConfig {
    let mut config = InspectionConfig::default().simulated();
    config.camera.image_width = 32;
    config.camera.image_height = 24;
    config.paths.captured_images = dir.join("captured");
    config.paths.results_dir = dir.join("results");
    config.classification.model_path = dir.join("model.onnx");
    config.classification.input_width = 8;
    config.classification.input_height = 8;
    config.collection.images_per_session = 0;
    config.pipeline.report_interval_secs = 0;
    config.pipeline.stop_timeout_ms = 1000;
    config
}

pub fn write_model(config: &InspectionConfig) {
    std::fs::write(&config.classification.model_path, b"fake model").unwrap();
}

pub fn controller(config: InspectionConfig, hardware: FakeHardware) -> PipelineController {
    PipelineController::new(config, Arc::new(hardware)).unwrap()
}

/// Poll the controller until `done` holds or `timeout` elapses
pub async fn wait_for(
    controller: &PipelineController,
    timeout: Duration,
    done: impl Fn(&PipelineState) -> bool,
) -> PipelineState {
    let deadline = Instant::now() + timeout;
    loop {
        let state = controller.status();
        if done(&state) || Instant::now() >= deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
