//! Proximity sensing: turns raw presence samples into detection events
//!
//! Every sensor variant implements [`SensorMonitor`] and feeds its samples
//! through a [`CooldownGate`], so real and simulated sensors are
//! interchangeable behind the same callback contract.

mod gate;
mod polled;
mod probe;
mod simulated;

pub use gate::CooldownGate;
pub use polled::PolledSensor;
pub use probe::{AdcProbe, GpioProbe, SensorProbe, SensorReading};
pub use simulated::{SimulatedSensor, SimulationPattern};

use crate::config::SensorConfig;
use crate::error::Result;
use crate::types::SensorSignal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Receives detections and recoverable faults from a running sensor
pub type DetectionCallback = Arc<dyn Fn(SensorSignal) + Send + Sync>;

/// Capability shared by real and simulated sensors
#[async_trait]
pub trait SensorMonitor: Send + Sync {
    /// Human-readable sensor description for logs
    fn name(&self) -> &str;

    /// Begin continuous sampling; `on_detect` is invoked from the sampling task
    async fn start(&self, on_detect: DetectionCallback) -> Result<()>;

    /// Halt sampling and release the underlying I/O handle. Idempotent.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Build the sensor variant selected by configuration
pub fn from_config(config: &SensorConfig) -> Box<dyn SensorMonitor> {
    if config.simulate {
        Box::new(SimulatedSensor::from_config(config))
    } else {
        Box::new(PolledSensor::from_config(config))
    }
}

/// Handle on a spawned sampling loop
struct SamplingTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SamplingTask {
    fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(body(rx));
        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it, aborting after `timeout`
    async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("Sampling task did not stop within {:?}, aborting", timeout);
            handle.abort();
        }
    }
}

/// Sleep that ends early when shutdown is signalled; returns false on shutdown
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}
