//! Image classification
//!
//! [`InferenceEngine`] owns at most one loaded model. Model formats plug in
//! through [`ModelLoader`]; the ONNX Runtime backend is the default.

#[cfg(feature = "onnx")]
mod onnx;
pub mod preprocess;

#[cfg(feature = "onnx")]
pub use onnx::OnnxLoader;

use crate::config::{ClassificationConfig, Normalization, TensorLayout};
use crate::error::{InspectionError, Result};
use crate::types::{CapturedFrame, ClassificationResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Shape and encoding of the model input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub layout: TensorLayout,
    pub normalization: Normalization,
}

impl InputSpec {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        Self {
            width: config.input_width,
            height: config.input_height,
            layout: config.layout,
            normalization: config.normalization,
        }
    }

    /// Batch-of-one tensor shape
    pub fn shape(&self) -> Vec<usize> {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.layout {
            TensorLayout::Nchw => vec![1, 3, h, w],
            TensorLayout::Nhwc => vec![1, h, w, 3],
        }
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A loaded model ready to run
#[cfg_attr(test, mockall::automock)]
pub trait ModelBackend: Send {
    /// Number of scores the model produces per input
    fn output_classes(&self) -> usize;

    /// Run one preprocessed input; returns raw scores
    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>>;
}

/// Turns model bytes into a [`ModelBackend`]
#[cfg_attr(test, mockall::automock)]
pub trait ModelLoader: Send + Sync {
    fn load(&self, bytes: &[u8], spec: &InputSpec) -> Result<Box<dyn ModelBackend>>;
}

struct LoadedModel {
    backend: Box<dyn ModelBackend>,
    labels: Vec<String>,
    path: PathBuf,
}

/// Classifier with an explicit load/unload lifecycle.
///
/// Methods block; callers on the async runtime go through
/// `spawn_blocking`.
pub struct InferenceEngine {
    spec: InputSpec,
    loader: Arc<dyn ModelLoader>,
    model: Mutex<Option<LoadedModel>>,
}

impl InferenceEngine {
    pub fn new(config: &ClassificationConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            spec: InputSpec::from_config(config),
            loader,
            model: Mutex::new(None),
        }
    }

    pub fn input_spec(&self) -> &InputSpec {
        &self.spec
    }

    /// Load the model at `path`; `labels[i]` names output class `i`.
    ///
    /// Replaces any previously loaded model only on success.
    pub fn load(&self, path: &Path, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Err(InspectionError::ModelLoad("No class labels configured".to_string()));
        }
        if !path.is_file() {
            return Err(InspectionError::ModelLoad(format!(
                "No model found at {}. Place a trained classifier there: input {}x{} RGB ({:?}), {} outputs ({}).",
                path.display(),
                self.spec.width,
                self.spec.height,
                self.spec.layout,
                labels.len(),
                labels.join(", ")
            )));
        }

        let bytes = std::fs::read(path).map_err(|e| {
            InspectionError::ModelLoad(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let backend = self.loader.load(&bytes, &self.spec).map_err(|e| match e {
            InspectionError::ModelLoad(_) => e,
            other => InspectionError::ModelLoad(other.to_string()),
        })?;

        let classes = backend.output_classes();
        if classes != labels.len() {
            return Err(InspectionError::ModelLoad(format!(
                "Model at {} produces {} classes but {} labels are configured",
                path.display(),
                classes,
                labels.len()
            )));
        }

        info!(
            "Loaded model {} ({} classes: {})",
            path.display(),
            classes,
            labels.join(", ")
        );
        *self.model.lock() = Some(LoadedModel {
            backend,
            labels: labels.to_vec(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Release the loaded model
    pub fn unload(&self) {
        if let Some(model) = self.model.lock().take() {
            info!("Unloaded model {}", model.path.display());
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().is_some()
    }

    pub fn labels(&self) -> Option<Vec<String>> {
        self.model.lock().as_ref().map(|m| m.labels.clone())
    }

    pub fn classify(&self, frame: &CapturedFrame) -> Result<ClassificationResult> {
        let mut guard = self.model.lock();
        let model = guard.as_mut().ok_or(InspectionError::NotReady)?;

        let started = Instant::now();
        let input = preprocess::to_tensor(frame.pixels(), &self.spec);
        let scores = model.backend.infer(&input)?;
        if scores.len() != model.labels.len() {
            return Err(InspectionError::Inference(format!(
                "Model returned {} scores for {} labels",
                scores.len(),
                model.labels.len()
            )));
        }

        let (index, confidence) = preprocess::top_class(&scores)?;
        let inference_latency = started.elapsed();
        let label = model.labels[index].clone();
        debug!(
            "{} -> {} ({:.3}) in {:?}",
            frame.path().display(),
            label,
            confidence,
            inference_latency
        );

        Ok(ClassificationResult {
            label,
            confidence,
            inference_latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureFormat;
    use chrono::Utc;
    use image::RgbImage;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn frame() -> CapturedFrame {
        CapturedFrame::new(
            PathBuf::from("frame.jpg"),
            CaptureFormat::Jpeg,
            RgbImage::new(8, 8),
            Utc::now(),
        )
    }

    fn config() -> ClassificationConfig {
        ClassificationConfig {
            input_width: 4,
            input_height: 4,
            ..Default::default()
        }
    }

    fn model_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"model").unwrap();
        file
    }

    fn loader_returning(classes: usize, scores: Vec<f32>) -> MockModelLoader {
        let mut loader = MockModelLoader::new();
        loader.expect_load().returning(move |bytes, spec| {
            assert_eq!(bytes, b"model");
            assert_eq!(spec.len(), 48);
            let mut backend = MockModelBackend::new();
            backend.expect_output_classes().return_const(classes);
            let scores = scores.clone();
            backend.expect_infer().returning(move |input| {
                assert_eq!(input.len(), 48);
                Ok(scores.clone())
            });
            Ok(Box::new(backend))
        });
        loader
    }

    #[test]
    fn test_classify_before_load_is_not_ready() {
        let engine = InferenceEngine::new(&config(), Arc::new(MockModelLoader::new()));
        assert!(matches!(engine.classify(&frame()), Err(InspectionError::NotReady)));
    }

    #[test]
    fn test_missing_model_mentions_expected_shape() {
        let engine = InferenceEngine::new(&config(), Arc::new(MockModelLoader::new()));
        let err = engine
            .load(Path::new("/nonexistent/model.onnx"), &labels(&["good", "bad"]))
            .unwrap_err();
        match err {
            InspectionError::ModelLoad(msg) => {
                assert!(msg.contains("/nonexistent/model.onnx"));
                assert!(msg.contains("4x4"));
                assert!(msg.contains("good, bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_class_count_mismatch_is_rejected() {
        let file = model_file();
        let engine = InferenceEngine::new(&config(), Arc::new(loader_returning(3, vec![0.1, 0.2, 0.7])));
        let err = engine.load(file.path(), &labels(&["good", "bad"])).unwrap_err();
        assert!(matches!(err, InspectionError::ModelLoad(ref m) if m.contains("3 classes")));
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_classify_picks_top_label() {
        let file = model_file();
        let engine = InferenceEngine::new(&config(), Arc::new(loader_returning(3, vec![0.1, 2.5, 0.3])));
        engine.load(file.path(), &labels(&["good", "scratch", "dent"])).unwrap();

        let result = engine.classify(&frame()).unwrap();
        assert_eq!(result.label, "scratch");
        assert!(result.confidence > 0.5 && result.confidence <= 1.0);

        engine.unload();
        assert!(matches!(engine.classify(&frame()), Err(InspectionError::NotReady)));
    }

    #[test]
    fn test_non_finite_output_is_inference_fault() {
        let file = model_file();
        let engine = InferenceEngine::new(&config(), Arc::new(loader_returning(2, vec![f32::NAN, 1.0])));
        engine.load(file.path(), &labels(&["good", "bad"])).unwrap();
        assert!(matches!(engine.classify(&frame()), Err(InspectionError::Inference(_))));
        // engine stays usable
        assert!(engine.is_loaded());
    }

    #[test]
    fn test_loader_failure_becomes_model_load_error() {
        let file = model_file();
        let mut loader = MockModelLoader::new();
        loader
            .expect_load()
            .returning(|_, _| Err(InspectionError::Inference("bad graph".into())));
        let engine = InferenceEngine::new(&config(), Arc::new(loader));
        let err = engine.load(file.path(), &labels(&["a"])).unwrap_err();
        assert!(matches!(err, InspectionError::ModelLoad(ref m) if m.contains("bad graph")));
    }

    #[test]
    fn test_input_spec_shapes() {
        let mut spec = InputSpec::from_config(&config());
        assert_eq!(spec.shape(), vec![1, 3, 4, 4]);
        spec.layout = TensorLayout::Nhwc;
        spec.width = 6;
        assert_eq!(spec.shape(), vec![1, 4, 6, 3]);
        assert_eq!(spec.len(), 72);
    }
}
