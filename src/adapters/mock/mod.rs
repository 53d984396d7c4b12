// Mock adapters - Deterministic in-process source and encoder
//
// The mock source "decodes" a small descriptor (see `MockMedia`) and plays it
// on the tokio clock, so runs complete instantly under a paused test clock.
// The mock encoder emits an EBML-looking header followed by payload sized to
// the target bitrate. Both track open handles in `MockStats` for leak checks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::domain::model::*;
use crate::domain::rules::{AUDIO_BITRATE, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::engine::clock::{ClockReader, PlaybackClock};
use crate::error::{PipelineError, PipelineResult};
use crate::ports::*;

const MOCK_MAGIC: &[u8; 4] = b"VSMK";
const MOCK_VERSION: u8 = 1;
const DESCRIPTOR_LEN: usize = 4 + 1 + 8 + 8 + 8 + 2 + 2 + 1;

/// EBML magic every Matroska-family file starts with
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

// bounds that keep a descriptor's frame count reasonable
const MAX_FRAME_RATE: f64 = 1000.0;
const MAX_LENGTH_SECS: f64 = 24.0 * 3600.0;

/// Media the mock source can decode
#[derive(Debug, Clone, PartialEq)]
pub struct MockMedia {
    /// How long playback actually runs
    pub length_secs: f64,
    /// Duration reported in metadata; `None` for an indeterminate source
    pub reported_duration: Option<f64>,
    pub frame_rate: f64,
    pub width: u16,
    pub height: u16,
    pub has_audio: bool,
}

impl MockMedia {
    /// Video-only media whose metadata reports its true length
    pub fn new(length_secs: f64) -> Self {
        Self {
            length_secs,
            reported_duration: Some(length_secs),
            frame_rate: 30.0,
            width: 160,
            height: 90,
            has_audio: false,
        }
    }

    pub fn with_unknown_duration(mut self) -> Self {
        self.reported_duration = None;
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.has_audio = true;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Serialize into input bytes the mock source accepts
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DESCRIPTOR_LEN);
        bytes.extend_from_slice(MOCK_MAGIC);
        bytes.push(MOCK_VERSION);
        bytes.extend_from_slice(&self.length_secs.to_le_bytes());
        bytes.extend_from_slice(&self.reported_duration.unwrap_or(f64::NAN).to_le_bytes());
        bytes.extend_from_slice(&self.frame_rate.to_le_bytes());
        bytes.extend_from_slice(&self.width.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.push(u8::from(self.has_audio));
        bytes
    }

    /// Input wrapping this descriptor
    pub fn to_input(&self) -> MediaInput {
        MediaInput::from_bytes(self.to_bytes())
    }

    /// Decode a descriptor; anything else is a load error
    pub fn parse(bytes: &[u8]) -> PipelineResult<Self> {
        if bytes.len() < DESCRIPTOR_LEN || &bytes[..4] != MOCK_MAGIC {
            return Err(PipelineError::load("unrecognized media format"));
        }
        if bytes[4] != MOCK_VERSION {
            return Err(PipelineError::load(format!(
                "unsupported descriptor version {}",
                bytes[4]
            )));
        }

        let f64_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            f64::from_le_bytes(raw)
        };
        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

        let length_secs = f64_at(5);
        let reported = f64_at(13);
        let frame_rate = f64_at(21);
        let media = Self {
            length_secs,
            reported_duration: reported.is_finite().then_some(reported),
            frame_rate,
            width: u16_at(29),
            height: u16_at(31),
            has_audio: bytes[33] != 0,
        };

        if !length_secs.is_finite() || !(0.0..=MAX_LENGTH_SECS).contains(&length_secs) {
            return Err(PipelineError::load("corrupt stream length"));
        }
        if !frame_rate.is_finite() || frame_rate <= 0.0 || frame_rate > MAX_FRAME_RATE {
            return Err(PipelineError::load("corrupt frame rate"));
        }
        if media.width == 0 || media.height == 0 {
            return Err(PipelineError::load("video dimensions cannot be zero"));
        }
        Ok(media)
    }

    fn frame_period(&self) -> f64 {
        1.0 / self.frame_rate
    }

    fn video_frame(&self, index: u64, pts: f64) -> MediaFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let luma = w * h;
        let chroma = ((w + 1) / 2) * ((h + 1) / 2);
        MediaFrame {
            kind: FrameKind::Video {
                width: self.width as u32,
                height: self.height as u32,
            },
            pts,
            data: vec![(index % 256) as u8; luma + 2 * chroma],
        }
    }

    fn audio_frame(&self, pts: f64) -> MediaFrame {
        let samples = (AUDIO_SAMPLE_RATE as f64 * self.frame_period()).round() as usize;
        MediaFrame {
            kind: FrameKind::Audio {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
            },
            pts,
            data: vec![0u8; samples * AUDIO_CHANNELS as usize * 4],
        }
    }
}

/// Counters of live mock resources
#[derive(Debug, Default)]
pub struct MockStats {
    open_sources: AtomicUsize,
    open_sessions: AtomicUsize,
    sources_opened: AtomicUsize,
    sessions_started: AtomicUsize,
}

impl MockStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn sources_opened(&self) -> usize {
        self.sources_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }
}

/// Mock source behaviour
#[derive(Debug, Clone)]
pub struct MockSourceConfig {
    /// Delay before metadata becomes available
    pub ready_delay: Duration,
    /// Metadata never arrives
    pub never_ready: bool,
    /// `capture` always fails
    pub capture_unavailable: bool,
    pub pacing: Pacing,
}

impl Default for MockSourceConfig {
    fn default() -> Self {
        Self {
            ready_delay: Duration::from_millis(20),
            never_ready: false,
            capture_unavailable: false,
            pacing: Pacing::Realtime,
        }
    }
}

/// Source adapter over [`MockMedia`] descriptors
pub struct MockSource {
    config: MockSourceConfig,
    stats: Arc<MockStats>,
}

impl MockSource {
    pub fn new(config: MockSourceConfig) -> Self {
        Self::with_stats(config, MockStats::new())
    }

    pub fn with_stats(config: MockSourceConfig, stats: Arc<MockStats>) -> Self {
        Self { config, stats }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn open(&self, input: &MediaInput) -> PipelineResult<Box<dyn SourceHandle>> {
        let media = MockMedia::parse(input.bytes())?;
        self.stats.open_sources.fetch_add(1, Ordering::SeqCst);
        self.stats.sources_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Mock source opened: {:.2}s at {} fps",
            media.length_secs, media.frame_rate
        );

        Ok(Box::new(MockSourceHandle {
            media,
            config: self.config.clone(),
            clock: PlaybackClock::new(),
            capture: Mutex::new(None),
            capture_audio: AtomicBool::new(false),
            captured: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockSourceHandle {
    media: MockMedia,
    config: MockSourceConfig,
    clock: PlaybackClock,
    capture: Mutex<Option<FrameSender>>,
    capture_audio: AtomicBool,
    captured: AtomicBool,
    playing: AtomicBool,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<MockStats>,
}

#[async_trait]
impl SourceHandle for MockSourceHandle {
    async fn await_ready(&self) -> PipelineResult<Option<f64>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::load("source closed"));
        }
        if self.config.never_ready {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.config.ready_delay).await;
        self.clock.mark_ready(self.media.reported_duration);
        Ok(self.clock.reader().duration())
    }

    fn start_playback(&self) -> PipelineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::load("source closed"));
        }
        if self.playing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let frames = self.capture.lock().ok().and_then(|mut slot| slot.take());
        let task = tokio::spawn(drive_playback(
            self.media.clone(),
            self.clock.clone(),
            frames,
            self.capture_audio.load(Ordering::SeqCst),
            self.config.pacing,
        ));
        if let Ok(mut driver) = self.driver.lock() {
            *driver = Some(task);
        }
        Ok(())
    }

    fn clock(&self) -> ClockReader {
        self.clock.reader()
    }

    fn capture(&self, include_audio: bool) -> PipelineResult<FrameReceiver> {
        if self.config.capture_unavailable {
            return Err(PipelineError::capture("live capture not supported by this source"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::capture("source closed"));
        }
        if self.playing.load(Ordering::SeqCst) {
            return Err(PipelineError::capture("playback already started"));
        }
        if self.captured.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::capture("source already captured"));
        }

        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER_FRAMES);
        self.capture_audio
            .store(include_audio && self.media.has_audio, Ordering::SeqCst);
        if let Ok(mut slot) = self.capture.lock() {
            *slot = Some(tx);
        }
        Ok(rx)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(task) = driver.take() {
                task.abort();
            }
        }
        if let Ok(mut slot) = self.capture.lock() {
            slot.take();
        }
        self.stats.open_sources.fetch_sub(1, Ordering::SeqCst);
        debug!("Mock source closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MockSourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive_playback(
    media: MockMedia,
    clock: PlaybackClock,
    mut frames: Option<FrameSender>,
    include_audio: bool,
    pacing: Pacing,
) {
    let period = media.frame_period();
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(period));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let total_frames = (media.length_secs * media.frame_rate - 1e-9).ceil().max(0.0) as u64;
    let mut next_frame: u64 = 0;

    loop {
        let position = match pacing {
            Pacing::Realtime => {
                ticker.tick().await;
                started.elapsed().as_secs_f64().min(media.length_secs)
            }
            Pacing::Unthrottled => {
                tokio::task::yield_now().await;
                if next_frame >= total_frames {
                    media.length_secs
                } else {
                    next_frame as f64 * period
                }
            }
        };

        while next_frame < total_frames {
            let pts = next_frame as f64 * period;
            if pts > position {
                break;
            }
            if let Some(tx) = frames.as_ref() {
                let mut delivered = tx.send(media.video_frame(next_frame, pts)).await.is_ok();
                if delivered && include_audio {
                    delivered = tx.send(media.audio_frame(pts)).await.is_ok();
                }
                if !delivered {
                    trace!("Capture dropped; continuing playback without it");
                    frames = None;
                }
            }
            next_frame += 1;
        }

        clock.advance_to(position);
        if position >= media.length_secs {
            break;
        }
    }

    // end of stream closes the capture before the ended notification
    drop(frames);
    clock.mark_ended();
    debug!("Mock playback ended after {} frames", next_frame);
}

/// Mock encoder behaviour
#[derive(Debug, Clone, Default)]
pub struct MockEncoderConfig {
    /// Refuse to start, as a platform without the codec would
    pub unsupported: bool,
    /// Emit an error after this many chunks
    pub fail_after_chunks: Option<usize>,
}

/// Encoder backend producing bitrate-sized placeholder output
pub struct MockEncoder {
    config: MockEncoderConfig,
    stats: Arc<MockStats>,
}

impl MockEncoder {
    pub fn new(config: MockEncoderConfig) -> Self {
        Self::with_stats(config, MockStats::new())
    }

    pub fn with_stats(config: MockEncoderConfig, stats: Arc<MockStats>) -> Self {
        Self { config, stats }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    /// Header the mock encoder writes at the start of every output
    pub fn header(settings: &EncoderSettings) -> Vec<u8> {
        let mut header = EBML_MAGIC.to_vec();
        header.extend_from_slice(settings.container.muxer_name().as_bytes());
        header.push(b'/');
        header.extend_from_slice(settings.video_codec.name().as_bytes());
        header
    }
}

impl EncoderBackend for MockEncoder {
    fn start(
        &self,
        settings: &EncoderSettings,
        frames: FrameReceiver,
    ) -> PipelineResult<Box<dyn EncoderHandle>> {
        if self.config.unsupported {
            return Err(PipelineError::capture(format!(
                "no encoder for {}",
                settings.mime_with_codecs()
            )));
        }

        self.stats.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.stats.sessions_started.fetch_add(1, Ordering::SeqCst);

        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_encoder(
            settings.clone(),
            frames,
            chunk_tx,
            stop_rx,
            self.config.fail_after_chunks,
        ));

        Ok(Box::new(MockEncoderHandle {
            chunks: chunk_rx,
            stop_tx: Some(stop_tx),
            task,
            stats: Arc::clone(&self.stats),
            released: false,
        }))
    }
}

async fn run_encoder(
    settings: EncoderSettings,
    mut frames: FrameReceiver,
    chunks: mpsc::Sender<PipelineResult<EncodedChunk>>,
    mut stop_rx: oneshot::Receiver<()>,
    fail_after_chunks: Option<usize>,
) {
    let timeslice = settings.timeslice.as_secs_f64();
    let audio_bitrate = AUDIO_BITRATE;
    let mut pending = MockEncoder::header(&settings);
    let mut slice_start = 0.0;
    let mut video_written: u64 = 0;
    let mut audio_written: u64 = 0;
    let mut emitted = 0usize;
    let mut stopping = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop_rx, if !stopping => {
                // no new frames; what is already captured still gets encoded
                frames.close();
                stopping = true;
                continue;
            }
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        match frame.kind {
            FrameKind::Video { .. } => {
                let budget = settings.bitrate.bytes_for(frame.pts);
                let payload = budget.saturating_sub(video_written);
                let fill = frame.data.first().copied().unwrap_or(0);
                pending.extend(std::iter::repeat(fill).take(payload as usize));
                video_written = budget.max(video_written);
            }
            FrameKind::Audio { .. } if settings.include_audio => {
                let budget = audio_bitrate.bytes_for(frame.pts);
                let payload = budget.saturating_sub(audio_written);
                pending.extend(std::iter::repeat(0xA0).take(payload as usize));
                audio_written = budget.max(audio_written);
            }
            FrameKind::Audio { .. } => {}
        }

        if frame.pts - slice_start >= timeslice && !pending.is_empty() {
            if fail_after_chunks.is_some_and(|limit| emitted >= limit) {
                let _ = chunks
                    .send(Err(PipelineError::finalize("mock encoder failure")))
                    .await;
                return;
            }
            let chunk = EncodedChunk::new(std::mem::take(&mut pending));
            if chunks.send(Ok(chunk)).await.is_err() {
                return;
            }
            emitted += 1;
            slice_start = frame.pts;
        }
    }

    if !pending.is_empty() {
        let _ = chunks.send(Ok(EncodedChunk::new(pending))).await;
    }
}

struct MockEncoderHandle {
    chunks: mpsc::Receiver<PipelineResult<EncodedChunk>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    stats: Arc<MockStats>,
    released: bool,
}

impl MockEncoderHandle {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EncoderHandle for MockEncoderHandle {
    async fn next_chunk(&mut self) -> Option<PipelineResult<EncodedChunk>> {
        let chunk = self.chunks.recv().await;
        if chunk.is_none() {
            self.release();
        }
        chunk
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    fn abort(&mut self) {
        self.stop_tx.take();
        self.task.abort();
        self.chunks.close();
        self.release();
    }
}

impl Drop for MockEncoderHandle {
    fn drop(&mut self) {
        self.abort();
    }
}
