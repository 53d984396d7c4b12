//! Pipeline orchestrator
//!
//! Keeps the registry of runs and drives each one through
//! `Idle -> Loaded -> Encoding -> Completed | Errored`. The resources of an
//! encoding run (opened source, encoding session, progress tracker) belong to
//! its drive task and are released on every exit path before the terminal
//! event goes out. `cancel` and `reset` return any run to `Idle` and only
//! return once those resources are gone; a cancelled run keeps its input
//! locked until then, so concurrent cancels all wait for the same teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::domain::model::*;
use crate::domain::rules::{estimate_output_size, BitratePolicy};
use crate::engine::progress::ProgressTracker;
use crate::engine::session::EncodingSession;
use crate::error::{ErrorReport, PipelineError, PipelineResult};
use crate::ports::{EncoderBackend, MediaSource, SourceHandle};
use crate::utils::{format_seconds, format_size};

/// Event stream of one encoding run.
///
/// Ends with exactly one [`RunEvent::Result`], unless the run is cancelled, in
/// which case the stream simply closes.
pub struct RunEvents {
    run_id: RunId,
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl RunEvents {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Skip ahead to the terminal result; `None` if the run was cancelled
    pub async fn wait_for_result(&mut self) -> Option<ResultEvent> {
        while let Some(event) = self.rx.recv().await {
            if let RunEvent::Result(result) = event {
                return Some(result);
            }
        }
        None
    }
}

struct ActiveRun {
    // taken by the first cancel
    cancel_tx: Option<oneshot::Sender<()>>,
    cancel_requested: bool,
    // true once the drive task has released everything and settled the run
    settled: watch::Receiver<bool>,
}

struct PipelineRun {
    state: PipelineState,
    input: Option<MediaInput>,
    preset: Option<QualityPreset>,
    artifact: Option<Arc<Artifact>>,
    error: Option<ErrorReport>,
    active: Option<ActiveRun>,
    // bumped on every start
    generation: u64,
}

impl PipelineRun {
    fn loaded(input: MediaInput) -> Self {
        Self {
            state: PipelineState::Loaded,
            input: Some(input),
            preset: None,
            artifact: None,
            error: None,
            active: None,
            generation: 0,
        }
    }

    fn clear(&mut self) {
        self.state = PipelineState::Idle;
        self.input = None;
        self.preset = None;
        self.artifact = None;
        self.error = None;
    }
}

#[derive(Default)]
struct Registry {
    runs: HashMap<RunId, PipelineRun>,
    // at most one encoding run per input
    active_inputs: HashMap<InputId, RunId>,
}

impl Registry {
    fn run(&self, run_id: RunId) -> PipelineResult<&PipelineRun> {
        self.runs
            .get(&run_id)
            .ok_or(PipelineError::UnknownRun { run_id })
    }

    fn run_mut(&mut self, run_id: RunId) -> PipelineResult<&mut PipelineRun> {
        self.runs
            .get_mut(&run_id)
            .ok_or(PipelineError::UnknownRun { run_id })
    }
}

struct PipelineInner {
    config: PipelineConfig,
    source: Arc<dyn MediaSource>,
    encoder: Arc<dyn EncoderBackend>,
    registry: Mutex<Registry>,
}

impl PipelineInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Entry point: submit inputs, start compression runs, observe and cancel them.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn MediaSource>,
        encoder: Arc<dyn EncoderBackend>,
    ) -> PipelineResult<Self> {
        config.validate().map_err(|e| PipelineError::Config {
            message: format!("{:#}", e),
        })?;
        info!(
            "Pipeline ready: {} ({}), cadence {:?}, metadata timeout {:?}",
            config.container.media_type(),
            config.video_codec.name(),
            config.progress_cadence(),
            config.metadata_timeout()
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                source,
                encoder,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Register raw input bytes as a new run in `Loaded`
    pub fn submit_input(&self, bytes: impl Into<Vec<u8>>, declared_size: u64) -> RunId {
        self.submit_media(MediaInput::new(bytes, declared_size))
    }

    /// Register an existing input as a new run in `Loaded`.
    ///
    /// Several runs may share one input, but only one of them can encode at a time.
    pub fn submit_media(&self, input: MediaInput) -> RunId {
        let run_id = RunId::new();
        info!(
            %run_id,
            "Input {} loaded: {}",
            input.id(),
            format_size(input.size_bytes())
        );
        self.inner
            .registry()
            .runs
            .insert(run_id, PipelineRun::loaded(input));
        run_id
    }

    /// Attach a new input to an idle (or still loaded) run
    pub fn select_input(&self, run_id: RunId, input: MediaInput) -> PipelineResult<()> {
        let mut registry = self.inner.registry();
        let run = registry.run_mut(run_id)?;
        match run.state {
            PipelineState::Idle | PipelineState::Loaded => {
                run.clear();
                debug!(%run_id, "Input {} selected", input.id());
                run.input = Some(input);
                run.state = PipelineState::Loaded;
                Ok(())
            }
            state => Err(PipelineError::InvalidState {
                run_id,
                state,
                operation: "select input",
            }),
        }
    }

    /// Move a loaded run to `Encoding` and return its event stream.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// `RunAlreadyActive` when this run is already encoding (or still being
    /// cancelled) or another run is encoding the same input.
    pub fn start_compression(
        &self,
        run_id: RunId,
        preset: QualityPreset,
    ) -> PipelineResult<RunEvents> {
        let runtime = Handle::try_current().map_err(|e| PipelineError::Config {
            message: format!("start_compression needs a tokio runtime: {}", e),
        })?;
        let mut registry = self.inner.registry();

        let input = {
            let run = registry.run(run_id)?;
            match (run.state, run.input.as_ref()) {
                (PipelineState::Loaded, Some(input)) => input.clone(),
                (PipelineState::Encoding, _) => {
                    return Err(PipelineError::RunAlreadyActive { run_id });
                }
                (state, _) => {
                    return Err(PipelineError::InvalidState {
                        run_id,
                        state,
                        operation: "start compression",
                    });
                }
            }
        };
        if let Some(&holder) = registry.active_inputs.get(&input.id()) {
            warn!(%run_id, "Input {} is already being encoded by {}", input.id(), holder);
            return Err(PipelineError::RunAlreadyActive { run_id: holder });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (settled_tx, settled_rx) = watch::channel(false);

        let run = registry.run_mut(run_id)?;
        run.generation += 1;
        run.state = PipelineState::Encoding;
        run.preset = Some(preset);
        run.artifact = None;
        run.error = None;

        run.active = Some(ActiveRun {
            cancel_tx: Some(cancel_tx),
            cancel_requested: false,
            settled: settled_rx,
        });
        registry.active_inputs.insert(input.id(), run_id);
        drop(registry);

        runtime.spawn(
            drive_run(
                Arc::clone(&self.inner),
                run_id,
                input,
                preset,
                events_tx,
                cancel_rx,
                settled_tx,
            )
            .instrument(info_span!("run", %run_id)),
        );

        Ok(RunEvents {
            run_id,
            rx: events_rx,
        })
    }

    /// Return a run to `Idle` from any state.
    ///
    /// An encoding run is aborted first; when this returns its session is
    /// aborted and its source closed. No result event is sent for it.
    /// Overlapping cancels of one run all return after the same teardown.
    pub async fn cancel(&self, run_id: RunId) -> PipelineResult<()> {
        let (mut settled, generation) = {
            let mut registry = self.inner.registry();
            let run = registry.run_mut(run_id)?;
            let Some(active) = run.active.as_mut() else {
                run.clear();
                debug!(%run_id, "Run reset to idle");
                return Ok(());
            };
            active.cancel_requested = true;
            match active.cancel_tx.take() {
                Some(cancel_tx) => {
                    info!(%run_id, "Cancelling run");
                    let _ = cancel_tx.send(());
                }
                None => debug!(%run_id, "Run already cancelling; waiting for teardown"),
            }
            (active.settled.clone(), run.generation)
        };

        if settled.wait_for(|done| *done).await.is_err() {
            // the drive task died without settling the run
            warn!(%run_id, "Run task ended abnormally during cancel");
            let mut registry = self.inner.registry();
            registry.active_inputs.retain(|_, holder| *holder != run_id);
            if let Some(run) = registry.runs.get_mut(&run_id) {
                if run.generation == generation && run.active.is_some() {
                    run.active = None;
                    run.clear();
                }
            }
        }
        Ok(())
    }

    /// Same as [`Pipeline::cancel`]
    pub async fn reset(&self, run_id: RunId) -> PipelineResult<()> {
        self.cancel(run_id).await
    }

    pub fn state(&self, run_id: RunId) -> PipelineResult<PipelineState> {
        Ok(self.inner.registry().run(run_id)?.state)
    }

    /// Artifact of a completed run
    pub fn artifact(&self, run_id: RunId) -> PipelineResult<Option<Arc<Artifact>>> {
        Ok(self.inner.registry().run(run_id)?.artifact.clone())
    }

    /// Declared size of the run's input, for comparison with the artifact
    pub fn original_size(&self, run_id: RunId) -> PipelineResult<Option<u64>> {
        Ok(self
            .inner
            .registry()
            .run(run_id)?
            .input
            .as_ref()
            .map(MediaInput::size_bytes))
    }

    pub fn preset(&self, run_id: RunId) -> PipelineResult<Option<QualityPreset>> {
        Ok(self.inner.registry().run(run_id)?.preset)
    }

    /// Failure of an errored run
    pub fn last_error(&self, run_id: RunId) -> PipelineResult<Option<ErrorReport>> {
        Ok(self.inner.registry().run(run_id)?.error.clone())
    }

    /// Number of runs currently encoding
    pub fn active_runs(&self) -> usize {
        self.inner.registry().active_inputs.len()
    }

    /// Forget a run that is not encoding
    pub fn release(&self, run_id: RunId) -> PipelineResult<()> {
        let mut registry = self.inner.registry();
        let state = registry.run(run_id)?.state;
        if state == PipelineState::Encoding {
            return Err(PipelineError::InvalidState {
                run_id,
                state,
                operation: "release",
            });
        }
        registry.runs.remove(&run_id);
        debug!(%run_id, "Run released");
        Ok(())
    }
}

/// Resources held by an encoding run
#[derive(Default)]
struct RunResources {
    source: Option<Arc<dyn SourceHandle>>,
    session: Option<EncodingSession>,
    tracker: Option<ProgressTracker>,
}

impl RunResources {
    /// Stop sampling, abort the session, close the source. Safe after success.
    async fn release(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.stop().await;
        }
        if let Some(mut session) = self.session.take() {
            session.abort().await;
        }
        if let Some(source) = self.source.take() {
            source.close();
        }
    }
}

async fn drive_run(
    inner: Arc<PipelineInner>,
    run_id: RunId,
    input: MediaInput,
    preset: QualityPreset,
    events: mpsc::UnboundedSender<RunEvent>,
    cancel_rx: oneshot::Receiver<()>,
    settled: watch::Sender<bool>,
) {
    let bitrate = BitratePolicy::resolve(preset);
    info!("Compression started: preset {}, target {}", preset, bitrate);

    let mut resources = RunResources::default();
    let outcome = tokio::select! {
        biased;
        _ = cancel_rx => None,
        result = run_stages(&inner, &input, bitrate, &events, &mut resources) => Some(result),
    };
    resources.release().await;

    let result_event = {
        let mut registry = inner.registry();
        // the input stays locked until the run has settled
        registry.active_inputs.remove(&input.id());
        let Some(run) = registry.runs.get_mut(&run_id) else {
            debug!("Run released before it settled");
            settled.send_replace(true);
            return;
        };
        let cancel_requested = run
            .active
            .take()
            .map_or(true, |active| active.cancel_requested);

        match outcome {
            Some(result) if !cancel_requested => Some(publish(run, &input, result)),
            _ => {
                run.clear();
                info!("Run cancelled; resources released");
                None
            }
        }
    };
    settled.send_replace(true);

    if let Some(result_event) = result_event {
        let _ = events.send(RunEvent::Result(result_event));
    }
}

/// Record the terminal state of a finished run
fn publish(run: &mut PipelineRun, input: &MediaInput, result: PipelineResult<Artifact>) -> ResultEvent {
    match result {
        Ok(artifact) => {
            let original = input.size_bytes();
            info!(
                "Run completed: {} -> {} in {} chunks ({} saved)",
                format_size(original),
                format_size(artifact.size_bytes()),
                artifact.chunk_count(),
                format_size(artifact.size_saved(original).max(0) as u64)
            );
            let artifact = Arc::new(artifact);
            run.state = PipelineState::Completed;
            run.artifact = Some(Arc::clone(&artifact));
            ResultEvent::Completed { artifact }
        }
        Err(e) => {
            error!("Run failed: {}", e);
            let reason = ErrorReport::from(&e);
            run.state = PipelineState::Errored;
            run.error = Some(reason.clone());
            ResultEvent::Errored { reason }
        }
    }
}

/// Open, wait for metadata, capture, play to the end and finalize.
///
/// Every resource acquired is parked in `resources` before the next step, so
/// the caller can release them whichever way this future ends.
async fn run_stages(
    inner: &PipelineInner,
    input: &MediaInput,
    bitrate: BitrateTarget,
    events: &mpsc::UnboundedSender<RunEvent>,
    resources: &mut RunResources,
) -> PipelineResult<Artifact> {
    let config = &inner.config;

    let source: Arc<dyn SourceHandle> = Arc::from(inner.source.open(input).await?);
    resources.source = Some(Arc::clone(&source));

    let timeout = config.metadata_timeout();
    let duration = match tokio::time::timeout(timeout, source.await_ready()).await {
        Ok(ready) => ready?,
        Err(_) => return Err(PipelineError::MetadataTimeout { waited: timeout }),
    };
    match duration {
        Some(secs) => info!(
            "Source ready: {}, expected output about {}",
            format_seconds(secs),
            format_size(estimate_output_size(bitrate, secs))
        ),
        None => warn!("Source duration unknown; progress will carry no estimate"),
    }

    // capture attaches before playback so the first frame is encoded
    let chunk_events = events.clone();
    let session = resources.session.insert(EncodingSession::start(
        source.as_ref(),
        inner.encoder.as_ref(),
        config.encoder_settings(bitrate),
        move |index: u64, chunk: &EncodedChunk| {
            let _ = chunk_events.send(RunEvent::Chunk {
                index,
                size_bytes: chunk.len(),
            });
        },
    )?);

    let ended = source.on_ended();
    source.start_playback()?;

    let progress_events = events.clone();
    let tracker = resources.tracker.insert(ProgressTracker::start(
        source.clock(),
        config.progress_cadence(),
        move |event: &ProgressEvent| {
            let _ = progress_events.send(RunEvent::Progress(event.clone()));
        },
    ));

    if !ended.wait().await {
        return Err(PipelineError::load("source closed before playback ended"));
    }
    debug!("Playback ended at {:.2}s", source.current_position());

    tracker.finish().await;
    session.finalize().await
}
