//! ONNX Runtime backend

use super::{InputSpec, ModelBackend, ModelLoader};
use crate::error::{InspectionError, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info};

/// Loads `.onnx` classifiers with graph optimizations enabled
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
    fn load(&self, bytes: &[u8], spec: &InputSpec) -> Result<Box<dyn ModelBackend>> {
        let session = Session::builder()
            .map_err(|e| InspectionError::ModelLoad(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| InspectionError::ModelLoad(format!("Failed to set optimization level: {}", e)))?
            .commit_from_memory(bytes)
            .map_err(|e| InspectionError::ModelLoad(format!("Failed to parse model: {}", e)))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| InspectionError::ModelLoad("Model declares no outputs".to_string()))?;

        let mut backend = OnnxBackend {
            session,
            output_name,
            shape: spec.shape(),
            classes: 0,
        };

        // Dry run on a blank input to learn the class count
        let probe = backend
            .run(&vec![0.0; spec.len()])
            .map_err(|e| InspectionError::ModelLoad(format!("Model rejected a {:?} input: {}", spec.shape(), e)))?;
        backend.classes = probe.len();
        info!(
            "ONNX model ready: input {:?}, output '{}' with {} classes",
            backend.shape, backend.output_name, backend.classes
        );

        Ok(Box::new(backend))
    }
}

struct OnnxBackend {
    session: Session,
    output_name: String,
    shape: Vec<usize>,
    classes: usize,
}

impl OnnxBackend {
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let tensor = Tensor::from_array((self.shape.clone(), input.to_vec().into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| InspectionError::Inference(format!("Failed to build input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| InspectionError::Inference(format!("ONNX inference failed: {}", e)))?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            InspectionError::Inference(format!("Missing output tensor '{}'", self.output_name))
        })?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| InspectionError::Inference(format!("Failed to extract scores: {}", e)))?;
        debug!("ONNX output shape {:?}", shape);

        Ok(data.to_vec())
    }
}

impl ModelBackend for OnnxBackend {
    fn output_classes(&self) -> usize {
        self.classes
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.run(input)
    }
}
