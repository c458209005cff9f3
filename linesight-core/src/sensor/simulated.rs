//! Synthetic sensor for running without hardware

use super::gate::CooldownGate;
use super::{sleep_or_shutdown, DetectionCallback, SamplingTask, SensorMonitor};
use crate::config::SensorConfig;
use crate::error::{InspectionError, Result};
use crate::types::{DetectionEvent, SensorSignal};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// When synthetic detections fire
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationPattern {
    /// One detection every period, the first after one period
    Interval(Duration),
    /// Detections at fixed offsets from start
    Scripted(Vec<Duration>),
}

/// Emits detections on a schedule, subject to the same cooldown as hardware
pub struct SimulatedSensor {
    pattern: SimulationPattern,
    cooldown: Duration,
    task: tokio::sync::Mutex<Option<SamplingTask>>,
    running: Arc<AtomicBool>,
}

impl SimulatedSensor {
    pub fn new(pattern: SimulationPattern, cooldown: Duration) -> Self {
        Self {
            pattern,
            cooldown,
            task: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        let pattern = match &config.simulation_script {
            Some(offsets) => SimulationPattern::Scripted(
                offsets
                    .iter()
                    .map(|s| Duration::try_from_secs_f64(*s).unwrap_or(Duration::ZERO))
                    .collect(),
            ),
            None => SimulationPattern::Interval(
                Duration::try_from_secs_f64(config.simulation_interval_secs)
                    .unwrap_or(Duration::ZERO)
                    .max(Duration::from_millis(1)),
            ),
        };
        Self::new(pattern, config.cooldown())
    }

    pub fn pattern(&self) -> &SimulationPattern {
        &self.pattern
    }
}

#[async_trait]
impl SensorMonitor for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn start(&self, on_detect: DetectionCallback) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(InspectionError::InvalidState(
                "Simulated sensor is already running".to_string(),
            ));
        }

        info!("Simulated sensor started ({:?})", self.pattern);
        let pattern = self.pattern.clone();
        let gate = CooldownGate::new(self.cooldown, 1);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        *task = Some(SamplingTask::spawn(move |shutdown| {
            emit_loop(pattern, gate, on_detect, running, shutdown)
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.shutdown(STOP_TIMEOUT).await;
            self.running.store(false, Ordering::SeqCst);
            info!("Simulated sensor stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Emitter {
    gate: CooldownGate,
    on_detect: DetectionCallback,
    sequence: u64,
}

impl Emitter {
    fn fire(&mut self) {
        if self.gate.observe(true, Instant::now()) {
            self.sequence += 1;
            (self.on_detect)(SensorSignal::Detected(DetectionEvent::new(self.sequence, 1.0, false)));
        } else {
            debug!("Simulated detection suppressed by cooldown");
        }
    }
}

async fn emit_loop(
    pattern: SimulationPattern,
    gate: CooldownGate,
    on_detect: DetectionCallback,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut emitter = Emitter {
        gate,
        on_detect,
        sequence: 0,
    };
    let start = Instant::now();

    match pattern {
        SimulationPattern::Scripted(mut offsets) => {
            offsets.sort();
            for offset in offsets {
                let wait = (start + offset).saturating_duration_since(Instant::now());
                if !sleep_or_shutdown(wait, &mut shutdown).await {
                    break;
                }
                emitter.fire();
            }
            // script exhausted; idle until stopped
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        }
        SimulationPattern::Interval(period) => {
            let mut ticker = tokio::time::interval_at(start + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => emitter.fire(),
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}
