//! Integration tests for encoding sessions and progress tracking

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vidshrink::adapters::{
    MockEncoder, MockEncoderConfig, MockMedia, MockSource, MockSourceConfig, MockStats,
};
use vidshrink::config::PipelineConfig;
use vidshrink::domain::model::*;
use vidshrink::engine::{EncodingSession, ProgressTracker, SessionState};
use vidshrink::error::{ErrorKind, PipelineError, PipelineResult};
use vidshrink::ports::*;
use vidshrink::BitratePolicy;

// Test utilities

/// Encoder that never produces output and finishes as soon as it is stopped
struct SilentEncoder;

struct SilentHandle {
    _frames: FrameReceiver,
    stopped: bool,
}

impl EncoderBackend for SilentEncoder {
    fn start(
        &self,
        _settings: &EncoderSettings,
        frames: FrameReceiver,
    ) -> PipelineResult<Box<dyn EncoderHandle>> {
        Ok(Box::new(SilentHandle {
            _frames: frames,
            stopped: false,
        }))
    }
}

#[async_trait]
impl EncoderHandle for SilentHandle {
    async fn next_chunk(&mut self) -> Option<PipelineResult<EncodedChunk>> {
        if self.stopped {
            return None;
        }
        std::future::pending().await
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn abort(&mut self) {
        self.stopped = true;
    }
}

fn settings(preset: QualityPreset) -> EncoderSettings {
    PipelineConfig::default().encoder_settings(BitratePolicy::resolve(preset))
}

fn mock_source(pacing: Pacing, stats: &Arc<MockStats>) -> MockSource {
    MockSource::with_stats(
        MockSourceConfig {
            pacing,
            ..Default::default()
        },
        Arc::clone(stats),
    )
}

async fn open_ready(source: &MockSource, media: &MockMedia) -> Box<dyn SourceHandle> {
    let handle = source.open(&media.to_input()).await.unwrap();
    handle.await_ready().await.unwrap();
    handle
}

type SeenChunks = Arc<Mutex<Vec<(u64, Vec<u8>)>>>;

fn recording_observer() -> (SeenChunks, impl Fn(u64, &EncodedChunk) + Send + Sync + 'static) {
    let seen: SeenChunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer = move |index: u64, chunk: &EncodedChunk| {
        sink.lock().unwrap().push((index, chunk.as_bytes().to_vec()));
    };
    (seen, observer)
}

// Encoding session tests

#[tokio::test(start_paused = true)]
async fn test_artifact_is_concatenation_of_chunks() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Realtime, &stats);
    let encoder = MockEncoder::with_stats(MockEncoderConfig::default(), Arc::clone(&stats));
    let handle = open_ready(&source, &MockMedia::new(3.0)).await;

    let (seen, observer) = recording_observer();
    let mut session = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::Medium),
        observer,
    )
    .unwrap();
    let ended = handle.on_ended();
    handle.start_playback().unwrap();
    assert!(ended.wait().await);

    let artifact = session.finalize().await.unwrap();
    assert_eq!(session.state(), SessionState::Finalized);

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 3);
    assert!(seen.iter().enumerate().all(|(i, (index, _))| *index == i as u64));
    let concatenated: Vec<u8> = seen.iter().flat_map(|(_, bytes)| bytes.clone()).collect();
    assert_eq!(artifact.bytes(), concatenated.as_slice());
    assert_eq!(artifact.chunk_count(), seen.len());
    assert_eq!(session.chunk_count(), seen.len() as u64);
    assert_eq!(artifact.media_type(), "video/webm");
    assert_eq!(artifact.file_name(), "compressed.webm");
    assert!(artifact.bytes().starts_with(&vidshrink::adapters::mock::EBML_MAGIC));

    handle.close();
    assert_eq!(stats.open_sessions(), 0);
    assert_eq!(stats.open_sources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_chunks_yield_empty_artifact() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Unthrottled, &stats);
    let handle = open_ready(&source, &MockMedia::new(1.0)).await;

    let mut session = EncodingSession::start(
        handle.as_ref(),
        &SilentEncoder,
        settings(QualityPreset::Low),
        |_: u64, _: &EncodedChunk| {},
    )
    .unwrap();

    let artifact = session.finalize().await.unwrap();
    assert_eq!(artifact.size_bytes(), 0);
    assert_eq!(artifact.chunk_count(), 0);
    assert!(artifact.bytes().is_empty());
    assert_eq!(artifact.media_type(), "video/webm");
}

#[tokio::test(start_paused = true)]
async fn test_finalize_only_succeeds_once() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Unthrottled, &stats);
    let encoder = MockEncoder::with_stats(MockEncoderConfig::default(), Arc::clone(&stats));
    let handle = open_ready(&source, &MockMedia::new(1.0)).await;

    let mut session = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::High),
        |_: u64, _: &EncodedChunk| {},
    )
    .unwrap();
    let ended = handle.on_ended();
    handle.start_playback().unwrap();
    ended.wait().await;

    assert!(session.finalize().await.is_ok());
    let second = session.finalize().await.unwrap_err();
    assert_eq!(second.kind(), ErrorKind::FinalizeError);
}

#[tokio::test(start_paused = true)]
async fn test_abort_is_idempotent_and_blocks_finalize() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Realtime, &stats);
    let encoder = MockEncoder::with_stats(MockEncoderConfig::default(), Arc::clone(&stats));
    let handle = open_ready(&source, &MockMedia::new(5.0)).await;

    let mut session = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::Low),
        |_: u64, _: &EncodedChunk| {},
    )
    .unwrap();
    handle.start_playback().unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    session.abort().await;
    session.abort().await;
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(stats.open_sessions(), 0);
    assert!(matches!(
        session.finalize().await,
        Err(PipelineError::Finalize { .. })
    ));

    handle.close();
    assert_eq!(stats.open_sources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_encoder_failure_surfaces_as_finalize_error() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Unthrottled, &stats);
    let encoder = MockEncoder::with_stats(
        MockEncoderConfig {
            fail_after_chunks: Some(1),
            ..Default::default()
        },
        Arc::clone(&stats),
    );
    let handle = open_ready(&source, &MockMedia::new(4.0)).await;

    let mut session = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::Medium),
        |_: u64, _: &EncodedChunk| {},
    )
    .unwrap();
    let ended = handle.on_ended();
    handle.start_playback().unwrap();
    ended.wait().await;

    let err = session.finalize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FinalizeError);
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn test_session_requires_capture() {
    let stats = MockStats::new();
    let source = MockSource::with_stats(
        MockSourceConfig {
            capture_unavailable: true,
            ..Default::default()
        },
        Arc::clone(&stats),
    );
    let encoder = MockEncoder::with_stats(MockEncoderConfig::default(), Arc::clone(&stats));
    let handle = source.open(&MockMedia::new(1.0).to_input()).await.unwrap();

    let result = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::Low),
        |_: u64, _: &EncodedChunk| {},
    );
    assert_eq!(
        result.err().map(|e| e.kind()),
        Some(ErrorKind::CaptureUnavailable)
    );
    assert_eq!(stats.sessions_started(), 0);
}

#[tokio::test]
async fn test_unsupported_encoder_is_capture_unavailable() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Realtime, &stats);
    let encoder = MockEncoder::new(MockEncoderConfig {
        unsupported: true,
        ..Default::default()
    });
    let handle = source.open(&MockMedia::new(1.0).to_input()).await.unwrap();

    let result = EncodingSession::start(
        handle.as_ref(),
        &encoder,
        settings(QualityPreset::Low),
        |_: u64, _: &EncodedChunk| {},
    );
    assert!(matches!(
        result,
        Err(PipelineError::CaptureUnavailable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_higher_preset_produces_more_bytes() {
    let mut sizes = Vec::new();
    for preset in QualityPreset::ALL {
        let stats = MockStats::new();
        let source = mock_source(Pacing::Unthrottled, &stats);
        let encoder = MockEncoder::with_stats(MockEncoderConfig::default(), Arc::clone(&stats));
        let handle = open_ready(&source, &MockMedia::new(2.0)).await;

        let mut session = EncodingSession::start(
            handle.as_ref(),
            &encoder,
            settings(preset),
            |_: u64, _: &EncodedChunk| {},
        )
        .unwrap();
        let ended = handle.on_ended();
        handle.start_playback().unwrap();
        ended.wait().await;
        sizes.push((preset, session.finalize().await.unwrap().size_bytes()));
    }

    sizes.sort_by_key(|(preset, _)| *preset);
    assert!(sizes.windows(2).all(|w| w[0].1 < w[1].1), "{:?}", sizes);
}

// Progress tracker tests

#[tokio::test(start_paused = true)]
async fn test_tracker_follows_mock_playback_to_completion() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Realtime, &stats);
    let handle = open_ready(&source, &MockMedia::new(3.0)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let ended = handle.on_ended();
    handle.start_playback().unwrap();
    let mut tracker = ProgressTracker::start(
        handle.clock(),
        Duration::from_millis(300),
        move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()),
    );

    ended.wait().await;
    let last = tracker.finish().await.unwrap();
    assert_eq!(last.percent, Some(100));
    assert_eq!(last.remaining, RemainingTime::Seconds(0.0));

    let events = seen.lock().unwrap();
    // 0.0 through 2.7 s, plus the final sample
    assert!((10..=12).contains(&events.len()), "{} samples", events.len());
    assert!(events
        .windows(2)
        .all(|w| w[0].percent <= w[1].percent));
    assert!(events.windows(2).all(|w| {
        w[0].remaining.seconds().unwrap() >= w[1].remaining.seconds().unwrap()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_tracker_reports_unknown_for_indeterminate_source() {
    let stats = MockStats::new();
    let source = mock_source(Pacing::Realtime, &stats);
    let handle = open_ready(&source, &MockMedia::new(1.0).with_unknown_duration()).await;
    assert_eq!(handle.duration(), None);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let ended = handle.on_ended();
    handle.start_playback().unwrap();
    let mut tracker = ProgressTracker::start(
        handle.clock(),
        Duration::from_millis(300),
        move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()),
    );
    ended.wait().await;
    tracker.finish().await;

    let events = seen.lock().unwrap();
    assert!(!events.is_empty());
    assert!(events
        .iter()
        .all(|e| e.percent.is_none() && e.remaining == RemainingTime::Unknown));
    assert!(events.last().unwrap().position_secs >= 0.9);
}
