//! FFmpeg source: stages the input bytes in a temp file, inspects them, and
//! decodes video into planar YUV 4:2:0 frames on a blocking thread. When the
//! capture asks for audio, the best audio stream is decoded alongside and
//! resampled to interleaved f32 stereo at 48 kHz.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling::Context as ResampleCtx;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ensure_initialized, seconds};
use crate::domain::model::*;
use crate::domain::rules::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::engine::clock::{ClockReader, PlaybackClock};
use crate::error::{PipelineError, PipelineResult};
use crate::ports::*;

/// Source adapter decoding inputs with libavformat/libavcodec
pub struct LibavSource {
    pacing: Pacing,
}

impl LibavSource {
    pub fn new(pacing: Pacing) -> PipelineResult<Self> {
        ensure_initialized()?;
        Ok(Self { pacing })
    }
}

#[async_trait]
impl MediaSource for LibavSource {
    async fn open(&self, input: &MediaInput) -> PipelineResult<Box<dyn SourceHandle>> {
        let input = input.clone();
        let inspected = tokio::task::spawn_blocking(move || inspect(&input))
            .await
            .map_err(|e| PipelineError::load(format!("Inspect task failed: {}", e)))??;

        info!(
            "Input inspected: {}x{}, duration {}, audio: {}",
            inspected.width,
            inspected.height,
            inspected
                .duration
                .map(|d| format!("{:.2}s", d))
                .unwrap_or_else(|| "unknown".to_string()),
            inspected.has_audio
        );

        Ok(Box::new(LibavSourceHandle {
            file: Mutex::new(Some(Arc::new(inspected.file))),
            duration: inspected.duration,
            has_audio: inspected.has_audio,
            pacing: self.pacing,
            clock: PlaybackClock::new(),
            capture: Mutex::new(None),
            capture_audio: AtomicBool::new(false),
            captured: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            decoder: Mutex::new(None),
        }))
    }
}

struct Inspected {
    file: NamedTempFile,
    duration: Option<f64>,
    width: u32,
    height: u32,
    has_audio: bool,
}

fn inspect(input: &MediaInput) -> PipelineResult<Inspected> {
    let mut file = tempfile::Builder::new()
        .prefix("vidshrink-src-")
        .tempfile()
        .map_err(|e| PipelineError::load(format!("Failed to stage input: {}", e)))?;
    file.write_all(input.bytes())
        .and_then(|_| file.flush())
        .map_err(|e| PipelineError::load(format!("Failed to stage input: {}", e)))?;

    let path = file.path().to_path_buf();
    let ictx = ffmpeg::format::input(&path)
        .map_err(|e| PipelineError::load(format!("Failed to open input: {}", e)))?;

    let stream = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or_else(|| PipelineError::load("No video stream found in input"))?;
    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .and_then(|context| context.decoder().video())
        .map_err(|e| PipelineError::load(format!("Failed to create video decoder: {}", e)))?;

    let raw_duration = ictx.duration();
    let duration = (raw_duration > 0)
        .then(|| raw_duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64);
    let has_audio = ictx.streams().best(MediaType::Audio).is_some();

    Ok(Inspected {
        width: decoder.width(),
        height: decoder.height(),
        duration,
        has_audio,
        file,
    })
}

struct LibavSourceHandle {
    // the decode thread keeps its own reference while it runs
    file: Mutex<Option<Arc<NamedTempFile>>>,
    duration: Option<f64>,
    has_audio: bool,
    pacing: Pacing,
    clock: PlaybackClock,
    capture: Mutex<Option<FrameSender>>,
    capture_audio: AtomicBool,
    captured: AtomicBool,
    playing: AtomicBool,
    closed: Arc<AtomicBool>,
    decoder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SourceHandle for LibavSourceHandle {
    async fn await_ready(&self) -> PipelineResult<Option<f64>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::load("source closed"));
        }
        // probing already read the metadata
        self.clock.mark_ready(self.duration);
        Ok(self.clock.reader().duration())
    }

    fn start_playback(&self) -> PipelineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::load("source closed"));
        }
        if self.playing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let file = self
            .file
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| PipelineError::load("staged input missing"))?;
        let frames = self.capture.lock().ok().and_then(|mut slot| slot.take());
        let with_audio = frames.is_some() && self.capture_audio.load(Ordering::SeqCst);
        let clock = self.clock.clone();
        let closed = Arc::clone(&self.closed);
        let pacing = self.pacing;

        let task = tokio::task::spawn_blocking(move || {
            match decode(file.path(), frames, with_audio, &clock, pacing, &closed) {
                Ok(count) => debug!("Decoded {} frames", count),
                // a mid-stream decode failure ends playback early
                Err(e) => warn!("Decoding stopped early: {}", e),
            }
            clock.mark_ended();
        });
        if let Ok(mut decoder) = self.decoder.lock() {
            *decoder = Some(task);
        }
        Ok(())
    }

    fn clock(&self) -> ClockReader {
        self.clock.reader()
    }

    fn capture(&self, include_audio: bool) -> PipelineResult<FrameReceiver> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::capture("source closed"));
        }
        if self.playing.load(Ordering::SeqCst) {
            return Err(PipelineError::capture("playback already started"));
        }
        if self.captured.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::capture("source already captured"));
        }
        if include_audio && !self.has_audio {
            debug!("Input has no audio stream; capturing video only");
        }
        self.capture_audio
            .store(include_audio && self.has_audio, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER_FRAMES);
        if let Ok(mut slot) = self.capture.lock() {
            *slot = Some(tx);
        }
        Ok(rx)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.capture.lock() {
            slot.take();
        }
        if let Ok(mut file) = self.file.lock() {
            file.take();
        }
        // the decode thread observes `closed` at the next frame
        if let Ok(mut decoder) = self.decoder.lock() {
            decoder.take();
        }
        debug!("libav source closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LibavSourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct FrameEmitter<'a> {
    frames: Option<FrameSender>,
    scaler: Option<ScaleCtx>,
    clock: &'a PlaybackClock,
    closed: &'a AtomicBool,
    pacing: Pacing,
    time_base: ffmpeg::Rational,
    started: Instant,
    last_pts: f64,
    delivered: u64,
}

impl FrameEmitter<'_> {
    /// Returns `false` once the source has been closed
    fn emit(&mut self, decoded: &VideoFrame) -> Result<bool, ffmpeg::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let pts = decoded
            .timestamp()
            .or_else(|| decoded.pts())
            .map(|ts| seconds(ts, self.time_base))
            .unwrap_or(self.last_pts)
            .max(self.last_pts);
        self.last_pts = pts;
        self.pace(pts);

        if self.frames.is_some() {
            let (width, height) = (decoded.width(), decoded.height());
            if self.scaler.is_none() {
                self.scaler = Some(ScaleCtx::get(
                    decoded.format(),
                    width,
                    height,
                    Pixel::YUV420P,
                    width,
                    height,
                    ScaleFlags::BILINEAR,
                )?);
            }
            let mut yuv = VideoFrame::empty();
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(decoded, &mut yuv)?;
            }
            self.send(MediaFrame {
                kind: FrameKind::Video { width, height },
                pts,
                data: pack_planes(&yuv),
            });
        }

        self.clock.advance_to(pts);
        self.delivered += 1;
        Ok(true)
    }

    /// Audio rides along with video; only video moves the clock
    fn emit_audio(
        &mut self,
        decoded: &AudioFrame,
        track: &mut AudioTrack,
    ) -> Result<bool, ffmpeg::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.frames.is_none() {
            return Ok(true);
        }

        let pts = decoded
            .timestamp()
            .or_else(|| decoded.pts())
            .map(|ts| seconds(ts, track.time_base))
            .unwrap_or(track.next_pts)
            .max(0.0);
        let data = track.resample(decoded)?;
        if data.is_empty() {
            return Ok(true);
        }
        let samples = data.len() / (4 * AUDIO_CHANNELS as usize);
        track.next_pts = pts + samples as f64 / AUDIO_SAMPLE_RATE as f64;

        self.pace(pts);
        self.send(MediaFrame {
            kind: FrameKind::Audio {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
            },
            pts,
            data,
        });
        self.delivered += 1;
        Ok(true)
    }

    fn pace(&self, pts: f64) {
        if self.pacing == Pacing::Realtime {
            let due = Duration::from_secs_f64(pts.max(0.0));
            let elapsed = self.started.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }
    }

    fn send(&mut self, frame: MediaFrame) {
        let dropped = self
            .frames
            .as_ref()
            .is_some_and(|tx| tx.blocking_send(frame).is_err());
        if dropped {
            debug!("Capture receiver gone; continuing playback without it");
            self.frames = None;
        }
    }
}

/// Decoder state for the captured audio stream
struct AudioTrack {
    index: usize,
    time_base: ffmpeg::Rational,
    decoder: ffmpeg::decoder::Audio,
    // built from the first decoded frame, whose format is authoritative
    resampler: Option<ResampleCtx>,
    next_pts: f64,
}

impl AudioTrack {
    fn open(ictx: &ffmpeg::format::context::Input) -> Result<Option<Self>, ffmpeg::Error> {
        let Some(stream) = ictx.streams().best(MediaType::Audio) else {
            return Ok(None);
        };
        let decoder = codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .audio()?;
        debug!(
            "Audio stream {}: {} Hz, {} channels",
            stream.index(),
            decoder.rate(),
            decoder.channels()
        );
        Ok(Some(Self {
            index: stream.index(),
            time_base: stream.time_base(),
            decoder,
            resampler: None,
            next_pts: 0.0,
        }))
    }

    /// Interleaved f32 stereo bytes at the capture rate
    fn resample(&mut self, decoded: &AudioFrame) -> Result<Vec<u8>, ffmpeg::Error> {
        if self.resampler.is_none() {
            let layout = if decoded.channels() >= 2 {
                decoded.channel_layout()
            } else {
                ChannelLayout::MONO
            };
            self.resampler = Some(ResampleCtx::get(
                decoded.format(),
                layout,
                decoded.rate(),
                Sample::F32(SampleType::Packed),
                ChannelLayout::STEREO,
                AUDIO_SAMPLE_RATE,
            )?);
        }

        let mut packed = AudioFrame::empty();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(decoded, &mut packed)?;
        }
        let len = packed.samples() * AUDIO_CHANNELS as usize * 4;
        Ok(packed.data(0).get(..len).map(<[u8]>::to_vec).unwrap_or_default())
    }

    fn drain(&mut self, emitter: &mut FrameEmitter<'_>) -> Result<bool, ffmpeg::Error> {
        let mut decoded = AudioFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if !emitter.emit_audio(&decoded, self)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn decode(
    path: &Path,
    frames: Option<FrameSender>,
    with_audio: bool,
    clock: &PlaybackClock,
    pacing: Pacing,
    closed: &AtomicBool,
) -> Result<u64, ffmpeg::Error> {
    let path: PathBuf = path.to_path_buf();
    let mut ictx = ffmpeg::format::input(&path)?;
    let stream = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or(ffmpeg::Error::StreamNotFound)?;
    let stream_index = stream.index();
    let time_base = stream.time_base();
    let mut decoder = codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .video()?;
    let mut audio = if with_audio {
        AudioTrack::open(&ictx)?
    } else {
        None
    };

    let mut emitter = FrameEmitter {
        frames,
        scaler: None,
        clock,
        closed,
        pacing,
        time_base,
        started: Instant::now(),
        last_pts: 0.0,
        delivered: 0,
    };

    let mut decoded = VideoFrame::empty();
    for (stream, packet) in ictx.packets() {
        if let Some(track) = audio.as_mut().filter(|track| track.index == stream.index()) {
            if let Err(e) = track.decoder.send_packet(&packet) {
                debug!("Skipping undecodable audio packet: {}", e);
                continue;
            }
            if !track.drain(&mut emitter)? {
                return Ok(emitter.delivered);
            }
            continue;
        }
        if stream.index() != stream_index {
            continue;
        }
        if let Err(e) = decoder.send_packet(&packet) {
            debug!("Skipping undecodable packet: {}", e);
            continue;
        }
        while decoder.receive_frame(&mut decoded).is_ok() {
            if !emitter.emit(&decoded)? {
                return Ok(emitter.delivered);
            }
        }
    }

    decoder.send_eof()?;
    while decoder.receive_frame(&mut decoded).is_ok() {
        if !emitter.emit(&decoded)? {
            return Ok(emitter.delivered);
        }
    }
    if let Some(track) = audio.as_mut() {
        track.decoder.send_eof()?;
        track.drain(&mut emitter)?;
    }
    Ok(emitter.delivered)
}

/// Copy the three planes of a YUV 4:2:0 frame without row padding
pub(super) fn pack_planes(frame: &VideoFrame) -> Vec<u8> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let planes = [
        (width, height),
        ((width + 1) / 2, (height + 1) / 2),
        ((width + 1) / 2, (height + 1) / 2),
    ];

    let mut packed = Vec::with_capacity(planes.iter().map(|(w, h)| w * h).sum());
    for (index, (plane_width, rows)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let data = frame.data(index);
        for row in 0..rows {
            let start = row * stride;
            packed.extend_from_slice(&data[start..start + plane_width]);
        }
    }
    packed
}
