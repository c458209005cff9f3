//! Detection → capture → inference → record orchestration
//!
//! The controller owns the mode state machine. Entering a running mode
//! acquires the results store, the model (classify mode), the camera and the
//! sensor, in that order; entering Idle releases them in reverse. Detections
//! are handled one at a time by a worker task: a detection arriving while
//! the previous one is still in flight is dropped and logged.

use crate::camera::ImageCapture;
use crate::config::InspectionConfig;
use crate::error::{FaultKind, InspectionError, Result};
use crate::hardware::HardwareFactory;
use crate::inference::InferenceEngine;
use crate::recorder::{ResultRecorder, ResultSummary, RESULTS_FILE};
use crate::sensor::{DetectionCallback, SensorMonitor};
use crate::types::{
    CapturedFrame, DetectionEvent, PipelineMode, PipelineState, RecordMode, RecordOutcome, ResultRecord,
    SensorSignal,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Status updates for interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ModeChanged { mode: PipelineMode },
    Detected { sequence: u64, raw_reading: f64 },
    EventDropped { sequence: u64, reason: String },
    Recorded(ResultRecord),
    Fault { kind: FaultKind, message: String },
    Report(ResultSummary),
}

/// What the worker does after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn mode_name(mode: PipelineMode) -> &'static str {
    match mode {
        PipelineMode::Idle => "idle",
        PipelineMode::Collecting => "collection",
        PipelineMode::Classifying => "classification",
    }
}

/// Hardware and tasks owned while a mode is active
struct RunningPipeline {
    generation: u64,
    mode: PipelineMode,
    sensor: Box<dyn SensorMonitor>,
    capture: Arc<ImageCapture>,
    engine: Option<Arc<InferenceEngine>>,
    recorder: Arc<ResultRecorder>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

struct Inner {
    config: InspectionConfig,
    hardware: Arc<dyn HardwareFactory>,
    state: RwLock<PipelineState>,
    events: broadcast::Sender<PipelineEvent>,
    /// Held for the whole of each mode transition
    running: Mutex<Option<RunningPipeline>>,
    generation: AtomicU64,
}

/// Owns the pipeline mode and the hardware of the active mode
#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<Inner>,
}

impl PipelineController {
    /// Fails with a config error when `config` does not validate
    pub fn new(config: InspectionConfig, hardware: Arc<dyn HardwareFactory>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.pipeline.event_buffer.max(1));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                hardware,
                state: RwLock::new(PipelineState::default()),
                events,
                running: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.inner.config
    }

    /// Snapshot of the current state
    pub fn status(&self) -> PipelineState {
        self.inner.state.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub async fn start_collecting(&self) -> Result<()> {
        self.start(PipelineMode::Collecting).await
    }

    /// Fails with a model load error, leaving the pipeline Idle, when the
    /// configured model is missing or does not match the label set.
    pub async fn start_classifying(&self) -> Result<()> {
        self.start(PipelineMode::Classifying).await
    }

    /// Return to Idle and release all hardware. A no-op when already Idle.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        match running.take() {
            Some(pipeline) => self.inner.teardown(pipeline).await,
            None => debug!("Stop requested while idle"),
        }
        Ok(())
    }

    /// Summary of the results store; reads the file without blocking the writer
    pub async fn report(&self) -> Result<ResultSummary> {
        let path = self.inner.config.paths.results_dir.join(RESULTS_FILE);
        let records = tokio::task::spawn_blocking(move || ResultRecorder::read_records(path))
            .await
            .map_err(|e| InspectionError::Storage(format!("Report task failed: {}", e)))??;
        Ok(ResultSummary::from_records(&records))
    }

    /// Start a fresh results file, keeping the old one beside it. Returns
    /// the archived file, or `None` when there were no rows to archive.
    pub async fn rotate(&self) -> Result<Option<PathBuf>> {
        let running = self.inner.running.lock().await;
        if let Some(pipeline) = running.as_ref() {
            return pipeline.recorder.rotate().await;
        }

        let config = &self.inner.config;
        let dir = &config.paths.results_dir;
        if !tokio::fs::try_exists(dir.join(RESULTS_FILE)).await.unwrap_or(false) {
            debug!("No results store in {}; nothing to rotate", dir.display());
            return Ok(None);
        }
        ResultRecorder::open_with(dir, self.inner.hardware.results_store(config))
            .await?
            .rotate()
            .await
    }

    async fn start(&self, mode: PipelineMode) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if let Some(current) = running.as_ref() {
            if current.mode == mode {
                debug!("{} mode already running", mode_name(mode));
                return Ok(());
            }
            let err = InspectionError::InvalidState(format!(
                "{} mode is running; stop {} mode first",
                mode_name(current.mode),
                mode_name(current.mode)
            ));
            warn!("{}", err);
            return Err(err);
        }

        // cleared up front: the first detection may fault before acquire returns
        self.inner.update(|s| s.last_error = None);
        match self.inner.clone().acquire(mode).await {
            Ok(pipeline) => {
                *running = Some(pipeline);
                self.inner.update(|s| {
                    s.mode = mode;
                    s.running = true;
                });
                self.inner.emit(PipelineEvent::ModeChanged { mode });
                info!(mode = %mode, "Pipeline started");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start {} mode: {}", mode_name(mode), e);
                self.inner.record_fault(&e);
                Err(e)
            }
        }
    }
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut PipelineState)) {
        f(&mut *self.state.write());
    }

    fn emit(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn record_fault(&self, err: &InspectionError) {
        let kind = err.kind();
        let message = err.to_string();
        self.update(|s| {
            s.last_error = Some(message.clone());
            *s.counters.faults.entry(kind).or_default() += 1;
        });
        self.emit(PipelineEvent::Fault { kind, message });
    }

    /// Acquire every resource the mode needs; anything already acquired is
    /// dropped (and so released) if a later step fails.
    async fn acquire(self: Arc<Self>, mode: PipelineMode) -> Result<RunningPipeline> {
        let config = &self.config;
        let record_mode = mode
            .record_mode()
            .ok_or_else(|| InspectionError::InvalidState("Idle is not a running mode".to_string()))?;
        let recorder = Arc::new(
            ResultRecorder::open_with(&config.paths.results_dir, self.hardware.results_store(config)).await?,
        );

        let engine = if mode == PipelineMode::Classifying {
            let loader = self.hardware.model_loader(config)?;
            let engine = Arc::new(InferenceEngine::new(&config.classification, loader));
            let loading = engine.clone();
            let path = config.classification.model_path.clone();
            let labels = config.classification.labels.clone();
            tokio::task::spawn_blocking(move || loading.load(&path, &labels))
                .await
                .map_err(|e| InspectionError::ModelLoad(format!("Model load task failed: {}", e)))??;
            Some(engine)
        } else {
            None
        };

        let device = self.hardware.camera(config)?;
        let capture = Arc::new(ImageCapture::new(
            device,
            config.camera.clone(),
            &config.paths.captured_images,
        ));
        let opening = capture.clone();
        tokio::task::spawn_blocking(move || opening.open())
            .await
            .map_err(|e| InspectionError::Capture(format!("Camera open task failed: {}", e)))??;

        let sensor = self.hardware.sensor(config)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let context = WorkerContext {
            generation,
            mode,
            record_mode,
            capture: capture.clone(),
            engine: engine.clone(),
            recorder: recorder.clone(),
            in_flight: in_flight.clone(),
            session_records: 0,
        };
        let worker = tokio::spawn(run_worker(self.clone(), context, rx, shutdown_rx));

        let callback = detection_callback(self.clone(), tx, in_flight);
        if let Err(e) = sensor.start(callback).await {
            let _ = shutdown.send(true);
            let _ = worker.await;
            capture.close();
            return Err(e);
        }
        info!("Sensor {} armed for {} mode", sensor.name(), mode_name(mode));

        Ok(RunningPipeline {
            generation,
            mode,
            sensor,
            capture,
            engine,
            recorder,
            shutdown,
            worker,
        })
    }

    /// Release everything in reverse acquisition order
    async fn teardown(&self, pipeline: RunningPipeline) {
        let RunningPipeline {
            mode,
            sensor,
            capture,
            engine,
            shutdown,
            mut worker,
            ..
        } = pipeline;
        let stop_timeout = self.config.pipeline.stop_timeout();

        if let Err(e) = sensor.stop().await {
            warn!("Sensor did not stop cleanly: {}", e);
        }

        let _ = shutdown.send(true);
        if tokio::time::timeout(stop_timeout, &mut worker).await.is_err() {
            warn!("In-flight event did not finish within {:?}; cancelling it", stop_timeout);
            worker.abort();
        }

        let closing = tokio::task::spawn_blocking(move || capture.close());
        if tokio::time::timeout(stop_timeout, closing).await.is_err() {
            warn!("Camera release is taking longer than {:?}", stop_timeout);
        }

        if let Some(engine) = engine {
            let unloading = tokio::task::spawn_blocking(move || engine.unload());
            if tokio::time::timeout(stop_timeout, unloading).await.is_err() {
                warn!("Model release deferred until the running inference completes");
            }
        }

        self.update(|s| {
            s.mode = PipelineMode::Idle;
            s.running = false;
        });
        self.emit(PipelineEvent::ModeChanged {
            mode: PipelineMode::Idle,
        });
        info!("Pipeline stopped ({} mode released)", mode_name(mode));
    }

    /// Stop on the worker's behalf, unless a newer run has replaced it
    async fn stop_generation(self: Arc<Self>, generation: u64) {
        let mut running = self.running.lock().await;
        if running.as_ref().map(|p| p.generation) == Some(generation) {
            if let Some(pipeline) = running.take() {
                self.teardown(pipeline).await;
            }
        }
    }
}

fn detection_callback(
    inner: Arc<Inner>,
    tx: mpsc::Sender<DetectionEvent>,
    in_flight: Arc<AtomicBool>,
) -> DetectionCallback {
    Arc::new(move |signal| match signal {
        SensorSignal::Detected(event) => {
            let sequence = event.sequence();
            inner.update(|s| s.counters.events_detected += 1);
            inner.emit(PipelineEvent::Detected {
                sequence,
                raw_reading: event.raw_reading(),
            });

            if in_flight.swap(true, Ordering::SeqCst) {
                warn!(sequence, "Detection dropped: previous item still being processed");
                inner.update(|s| s.counters.events_dropped += 1);
                inner.emit(PipelineEvent::EventDropped {
                    sequence,
                    reason: "previous item still in flight".to_string(),
                });
                return;
            }
            if tx.try_send(event).is_err() {
                in_flight.store(false, Ordering::SeqCst);
                debug!(sequence, "Worker has shut down; detection discarded");
            }
        }
        SensorSignal::Fault(message) => {
            inner.record_fault(&InspectionError::Sensor(message));
        }
    })
}

struct WorkerContext {
    generation: u64,
    mode: PipelineMode,
    record_mode: RecordMode,
    capture: Arc<ImageCapture>,
    engine: Option<Arc<InferenceEngine>>,
    recorder: Arc<ResultRecorder>,
    in_flight: Arc<AtomicBool>,
    /// Records written since this mode was entered
    session_records: u64,
}

async fn run_worker(
    inner: Arc<Inner>,
    mut ctx: WorkerContext,
    mut events: mpsc::Receiver<DetectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut report = inner.config.pipeline.report_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    loop {
        let report_tick = async {
            match report.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let flow = process_event(&inner, &mut ctx, event).await;
                ctx.in_flight.store(false, Ordering::SeqCst);
                if flow == Flow::Stop {
                    tokio::spawn(inner.clone().stop_generation(ctx.generation));
                    break;
                }
            }
            _ = report_tick => emit_report(&inner, &ctx.recorder).await,
        }
    }
    debug!("Pipeline worker exited");
}

async fn emit_report(inner: &Inner, recorder: &ResultRecorder) {
    match recorder.summarize().await {
        Ok(summary) => {
            info!("Results so far: {}", summary);
            inner.emit(PipelineEvent::Report(summary));
        }
        Err(e) => warn!("Periodic report failed: {}", e),
    }
}

/// Run a blocking stage on the blocking pool, bounded by `timeout`.
/// A panicked stage is reported through `fault`. A stage that outlives
/// its timeout keeps running; whatever it eventually produces goes to `late`.
async fn run_blocking<T, F>(
    timeout: Duration,
    stage: &str,
    fault: fn(String) -> InspectionError,
    late: fn(T),
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(fault(format!("{} task failed: {}", stage, e))),
        Err(_) => {
            tokio::spawn(async move {
                if let Ok(Ok(value)) = task.await {
                    late(value);
                }
            });
            Err(InspectionError::Timeout(format!("{} exceeded {:?}", stage, timeout)))
        }
    }
}

/// Remove the image of a capture that finished after its detection was dropped
fn discard_late_frame(frame: CapturedFrame) {
    match std::fs::remove_file(frame.path()) {
        Ok(()) => debug!("Removed late capture {}", frame.path().display()),
        Err(e) => warn!("Cannot remove late capture {}: {}", frame.path().display(), e),
    }
}

async fn process_event(inner: &Inner, ctx: &mut WorkerContext, event: DetectionEvent) -> Flow {
    let config = &inner.config;
    let sequence = event.sequence();
    debug!(sequence, debounced = event.debounced(), "Processing detection");

    let delay = config.pipeline.trigger_delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let capture = ctx.capture.clone();
    let captured = run_blocking(
        config.camera.capture_timeout(),
        "Capture",
        InspectionError::Capture,
        discard_late_frame,
        move || capture.capture(),
    )
    .await;
    let frame = match captured {
        Ok(frame) => Arc::new(frame),
        Err(e) => {
            warn!(sequence, "Capture failed, detection dropped: {}", e);
            inner.record_fault(&e);
            inner.emit(PipelineEvent::EventDropped {
                sequence,
                reason: e.to_string(),
            });
            return Flow::Continue;
        }
    };
    inner.update(|s| s.counters.frames_captured += 1);

    let record_id = ctx.recorder.next_record_id();
    let mut record = ResultRecord {
        record_id,
        timestamp: frame.captured_at(),
        mode: ctx.record_mode,
        frame_reference: frame.path().to_path_buf(),
        archived_image: None,
        result: None,
        outcome: RecordOutcome::Ok,
    };

    if let Some(engine) = ctx.engine.clone() {
        classify_into(inner, &mut record, engine, frame.clone(), &ctx.recorder).await;
    }

    let recorder = ctx.recorder.clone();
    if let Err(e) = write_with_retry(|| recorder.record(&record), |first| inner.record_fault(first)).await {
        error!(record_id, "Record write failed twice; stopping pipeline: {}", e);
        inner.record_fault(&e);
        return Flow::Stop;
    }

    info!(
        record_id,
        mode = record.mode.as_str(),
        image = %record.image_reference().display(),
        label = record.label().unwrap_or(""),
        "Recorded item"
    );
    inner.update(|s| {
        s.counters.records_written += 1;
        s.last_record = Some(record.clone());
    });
    inner.emit(PipelineEvent::Recorded(record));
    ctx.session_records += 1;

    let limit = config.collection.images_per_session as u64;
    if ctx.mode == PipelineMode::Collecting && limit > 0 && ctx.session_records >= limit {
        info!("Collected {} images; session complete", ctx.session_records);
        return Flow::Stop;
    }
    Flow::Continue
}

/// One write plus a single retry. The first error goes to `on_failure`
/// before the retry; the second is returned.
async fn write_with_retry<F, Fut>(mut write: F, on_failure: impl FnOnce(&InspectionError)) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    match write().await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("Results write failed, retrying once: {}", first);
            on_failure(&first);
            write().await
        }
    }
}

/// Attach the classification (or the inference error marker) to `record`
async fn classify_into(
    inner: &Inner,
    record: &mut ResultRecord,
    engine: Arc<InferenceEngine>,
    frame: Arc<CapturedFrame>,
    recorder: &ResultRecorder,
) {
    let classification = &inner.config.classification;
    let input = frame.clone();
    let outcome = run_blocking(
        classification.inference_timeout(),
        "Inference",
        InspectionError::Inference,
        drop,
        move || engine.classify(&input),
    )
    .await;

    match outcome {
        Ok(result) => {
            if result.confidence < classification.confidence_threshold {
                record.outcome = RecordOutcome::LowConfidence;
            }
            match recorder.archive_image(&frame, record.record_id, &result.label).await {
                Ok(path) => record.archived_image = Some(path),
                Err(e) => {
                    warn!(record_id = record.record_id, "Image not archived: {}", e);
                    inner.record_fault(&e);
                }
            }
            record.result = Some(result);
        }
        Err(e) => {
            let e = match e {
                InspectionError::Timeout(msg) => InspectionError::Inference(msg),
                other => other,
            };
            warn!(record_id = record.record_id, "Classification failed; keeping image: {}", e);
            inner.record_fault(&e);
            record.outcome = RecordOutcome::InferenceError(e.to_string());
        }
    }
}
