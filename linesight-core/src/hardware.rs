//! Construction of the hardware the pipeline drives

use crate::camera::{CameraDevice, SimulatedCamera};
use crate::config::InspectionConfig;
use crate::error::Result;
use crate::inference::ModelLoader;
use crate::recorder::{FileStore, StoreOpener};
use crate::sensor::{self, SensorMonitor};
use std::sync::Arc;

/// Builds fresh hardware and storage handles each time a mode is entered
pub trait HardwareFactory: Send + Sync {
    fn sensor(&self, config: &InspectionConfig) -> Result<Box<dyn SensorMonitor>>;

    fn camera(&self, config: &InspectionConfig) -> Result<Box<dyn CameraDevice>>;

    fn model_loader(&self, config: &InspectionConfig) -> Result<Arc<dyn ModelLoader>>;

    /// Files the results store is written through
    fn results_store(&self, _config: &InspectionConfig) -> Arc<dyn StoreOpener> {
        Arc::new(FileStore)
    }
}

/// Real devices, or their simulated stand-ins when configured
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHardware;

impl HardwareFactory for SystemHardware {
    fn sensor(&self, config: &InspectionConfig) -> Result<Box<dyn SensorMonitor>> {
        Ok(sensor::from_config(&config.sensor))
    }

    fn camera(&self, config: &InspectionConfig) -> Result<Box<dyn CameraDevice>> {
        let camera = &config.camera;
        if camera.simulate {
            return Ok(Box::new(SimulatedCamera::new(640, 480)));
        }

        #[cfg(feature = "opencv")]
        {
            Ok(Box::new(crate::camera::OpenCvCamera::new(
                camera.device_index,
                (camera.image_width, camera.image_height),
            )))
        }

        #[cfg(not(feature = "opencv"))]
        {
            Err(crate::error::InspectionError::Capture(format!(
                "Camera {} requested but this build has no camera backend; rebuild with the `opencv` feature or set camera.simulate",
                camera.device_index
            )))
        }
    }

    fn model_loader(&self, _config: &InspectionConfig) -> Result<Arc<dyn ModelLoader>> {
        #[cfg(feature = "onnx")]
        {
            Ok(Arc::new(crate::inference::OnnxLoader))
        }

        #[cfg(not(feature = "onnx"))]
        {
            Err(crate::error::InspectionError::ModelLoad(
                "This build has no model backend; rebuild with the `onnx` feature".to_string(),
            ))
        }
    }
}
