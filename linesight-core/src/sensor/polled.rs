//! Hardware sensor sampled on a fixed poll interval

use super::gate::CooldownGate;
use super::probe::{AdcProbe, GpioProbe, SensorProbe};
use super::{sleep_or_shutdown, DetectionCallback, SamplingTask, SensorMonitor};
use crate::config::{SensorConfig, SensorKind};
use crate::error::{InspectionError, Result};
use crate::types::{DetectionEvent, SensorSignal};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Opens the probe when sampling starts; runs on a blocking thread
pub type ProbeOpener = Arc<dyn Fn() -> Result<Box<dyn SensorProbe>> + Send + Sync>;

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct PollSettings {
    cooldown: Duration,
    debounce_samples: u32,
    poll_interval: Duration,
    fault_backoff: Duration,
}

/// Sensor backed by a [`SensorProbe`], sampled from a tokio task.
///
/// Each sample is read on the blocking pool; the probe handle lives only as
/// long as the sampling task, so `stop` releases the device.
pub struct PolledSensor {
    name: String,
    opener: ProbeOpener,
    settings: PollSettings,
    task: tokio::sync::Mutex<Option<SamplingTask>>,
    running: Arc<AtomicBool>,
}

impl PolledSensor {
    pub fn new(name: impl Into<String>, config: &SensorConfig, opener: ProbeOpener) -> Self {
        Self {
            name: name.into(),
            opener,
            settings: PollSettings {
                cooldown: config.cooldown(),
                debounce_samples: config.debounce_samples,
                poll_interval: config.poll_interval(),
                fault_backoff: config.fault_backoff(),
            },
            task: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// GPIO or ADC sensor as wired in `config`
    pub fn from_config(config: &SensorConfig) -> Self {
        let (name, opener): (String, ProbeOpener) = match config.kind {
            SensorKind::Gpio => {
                let root = config.gpio_root.clone();
                let pin = config.channel;
                let active_low = config.active_low;
                (
                    format!("gpio{}", pin),
                    Arc::new(move || {
                        GpioProbe::open(&root, pin, active_low).map(|p| Box::new(p) as Box<dyn SensorProbe>)
                    }),
                )
            }
            SensorKind::Adc => {
                let device = config.iio_device.clone();
                let channel = config.channel;
                let threshold = config.voltage_threshold;
                let range = (config.min_valid_volts, config.max_valid_volts);
                (
                    format!("adc{}", channel),
                    Arc::new(move || {
                        AdcProbe::open(&device, channel, threshold, range)
                            .map(|p| Box::new(p) as Box<dyn SensorProbe>)
                    }),
                )
            }
        };
        Self::new(name, config, opener)
    }
}

#[async_trait]
impl SensorMonitor for PolledSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, on_detect: DetectionCallback) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(InspectionError::InvalidState(format!(
                "Sensor {} is already running",
                self.name
            )));
        }

        let opener = self.opener.clone();
        let probe = tokio::task::spawn_blocking(move || opener())
            .await
            .map_err(|e| InspectionError::Sensor(format!("Probe open task failed: {}", e)))??;
        info!("Sensor {} started ({})", self.name, probe.describe());

        let settings = self.settings;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        *task = Some(SamplingTask::spawn(move |shutdown| {
            sample_loop(probe, settings, on_detect, running, shutdown)
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.shutdown(STOP_TIMEOUT).await;
            self.running.store(false, Ordering::SeqCst);
            info!("Sensor {} stopped", self.name);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn sample_loop(
    probe: Box<dyn SensorProbe>,
    settings: PollSettings,
    on_detect: DetectionCallback,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let probe = Arc::new(Mutex::new(probe));
    let mut gate = CooldownGate::new(settings.cooldown, settings.debounce_samples);
    let debounced = settings.debounce_samples > 1;
    let mut sequence = 0u64;

    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let handle = probe.clone();
        let sample = tokio::task::spawn_blocking(move || handle.lock().sample())
            .await
            .unwrap_or_else(|e| Err(InspectionError::Sensor(format!("Sample task failed: {}", e))));

        match sample {
            Ok(reading) => {
                if gate.observe(reading.present, Instant::now()) {
                    sequence += 1;
                    debug!("Detection #{} (reading {:.3})", sequence, reading.value);
                    on_detect(SensorSignal::Detected(DetectionEvent::new(
                        sequence,
                        reading.value,
                        debounced,
                    )));
                }
            }
            Err(e) => {
                gate.break_streak();
                warn!("Sensor read failed: {}", e);
                on_detect(SensorSignal::Fault(e.to_string()));
                if !sleep_or_shutdown(settings.fault_backoff, &mut shutdown).await {
                    break;
                }
                ticker.reset();
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Sampling loop exited after {} detections", sequence);
}
