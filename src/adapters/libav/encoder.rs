//! FFmpeg encoder: VP8/VP9 (plus Opus or Vorbis audio when asked) into a
//! live-mode WebM/Matroska file whose newly written bytes are forwarded as
//! chunks once per timeslice.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::resampling::Context as ResampleCtx;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::{Dictionary, Packet, Rational};
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ensure_initialized, read_f32, write_f32};
use crate::domain::model::*;
use crate::domain::rules::{AUDIO_BITRATE, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::error::{PipelineError, PipelineResult};
use crate::ports::*;

type ChunkSender = mpsc::Sender<PipelineResult<EncodedChunk>>;

// how much video may arrive before the header is written without audio
const AUDIO_WAIT_SECS: f64 = 1.0;

/// Encoder backend using libvpx through libavcodec
pub struct LibavEncoder {
    threads: usize,
}

impl LibavEncoder {
    pub fn new() -> PipelineResult<Self> {
        ensure_initialized()?;
        Ok(Self {
            threads: num_cpus::get().clamp(1, 8),
        })
    }
}

fn codec_id(codec: VideoCodec) -> codec::Id {
    match codec {
        VideoCodec::Vp9 => codec::Id::VP9,
        VideoCodec::Vp8 => codec::Id::VP8,
    }
}

/// Audio encoder available in this FFmpeg build
#[derive(Debug, Clone, Copy)]
pub(super) struct AudioCodec {
    name: &'static str,
    format: Sample,
}

/// Opus first, Vorbis when libopus is missing
pub(super) fn find_audio_codec() -> Option<AudioCodec> {
    [
        AudioCodec {
            name: "libopus",
            format: Sample::F32(SampleType::Packed),
        },
        AudioCodec {
            name: "libvorbis",
            format: Sample::F32(SampleType::Planar),
        },
    ]
    .into_iter()
    .find(|codec| ffmpeg::encoder::find_by_name(codec.name).is_some())
}

fn av_error(context: &'static str) -> impl FnOnce(ffmpeg::Error) -> PipelineError {
    move |e| PipelineError::finalize(format!("{}: {}", context, e))
}

impl EncoderBackend for LibavEncoder {
    fn start(
        &self,
        settings: &EncoderSettings,
        frames: FrameReceiver,
    ) -> PipelineResult<Box<dyn EncoderHandle>> {
        let id = codec_id(settings.video_codec);
        if ffmpeg::encoder::find(id).is_none() {
            return Err(PipelineError::capture(format!(
                "No {} encoder in this FFmpeg build",
                settings.video_codec.name()
            )));
        }
        let audio = if settings.include_audio {
            let found = find_audio_codec();
            if found.is_none() {
                warn!("No Opus or Vorbis encoder in this FFmpeg build; output is video only");
            }
            found
        } else {
            None
        };

        let runtime = Handle::try_current()
            .map_err(|e| PipelineError::capture(format!("No async runtime: {}", e)))?;
        let output = tempfile::Builder::new()
            .prefix("vidshrink-out-")
            .suffix(&format!(".{}", settings.container.extension()))
            .tempfile()
            .map_err(|e| PipelineError::capture(format!("Failed to create output file: {}", e)))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let aborted = Arc::new(AtomicBool::new(false));

        let job = EncodeJob {
            settings: settings.clone(),
            codec: id,
            audio,
            threads: self.threads,
            output,
            aborted: Arc::clone(&aborted),
        };
        tokio::task::spawn_blocking(move || job.run(runtime, frames, stop_rx, chunk_tx));

        info!(
            "libav encoder started: {} at {}, {} threads, audio: {}",
            settings.mime_with_codecs(),
            settings.bitrate,
            self.threads,
            audio.map_or("none", |codec| codec.name)
        );
        Ok(Box::new(LibavEncoderHandle {
            chunks: chunk_rx,
            stop_tx: Some(stop_tx),
            aborted,
        }))
    }
}

enum Next {
    Stop,
    Frame(Option<MediaFrame>),
}

struct EncodeJob {
    settings: EncoderSettings,
    codec: codec::Id,
    audio: Option<AudioCodec>,
    threads: usize,
    // removed from disk when the job ends
    output: NamedTempFile,
    aborted: Arc<AtomicBool>,
}

impl EncodeJob {
    fn run(
        self,
        runtime: Handle,
        mut frames: FrameReceiver,
        mut stop_rx: oneshot::Receiver<()>,
        chunks: ChunkSender,
    ) {
        if let Err(e) = self.encode(&runtime, &mut frames, &mut stop_rx, &chunks) {
            if !self.aborted.load(Ordering::SeqCst) {
                warn!("libav encoding failed: {}", e);
                let _ = chunks.blocking_send(Err(e));
            }
        }
    }

    fn encode(
        &self,
        runtime: &Handle,
        frames: &mut FrameReceiver,
        stop_rx: &mut oneshot::Receiver<()>,
        chunks: &ChunkSender,
    ) -> PipelineResult<()> {
        let path = self.output.path().to_path_buf();
        let mut tail = OutputTail::new(File::open(&path)?);
        let mut octx = ffmpeg::format::output_as(&path, self.settings.container.muxer_name())
            .map_err(av_error("Failed to create output"))?;

        let timeslice = self.settings.timeslice.as_secs_f64();
        let mut tracks: Option<Tracks> = None;
        // frames held back until the header can be written
        let mut pending: Vec<MediaFrame> = Vec::new();
        let mut slice_start = 0.0;
        let mut stopping = false;

        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Ok(());
            }

            let next = runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = &mut *stop_rx, if !stopping => Next::Stop,
                    frame = frames.recv() => Next::Frame(frame),
                }
            });
            let frame = match next {
                Next::Stop => {
                    // frames already captured still get encoded
                    frames.close();
                    stopping = true;
                    continue;
                }
                Next::Frame(Some(frame)) => frame,
                Next::Frame(None) => break,
            };
            if !frame.is_video() && self.audio.is_none() {
                continue;
            }

            let pts = frame.pts;
            match tracks.as_mut() {
                Some(tracks) => tracks.encode(&mut octx, &frame)?,
                None => {
                    pending.push(frame);
                    tracks = self.open_tracks(&mut octx, &mut pending, false)?;
                }
            }

            if pts - slice_start >= timeslice && tracks.is_some() {
                if !tail.forward(chunks)? {
                    return Ok(());
                }
                slice_start = pts;
            }
        }

        if tracks.is_none() {
            tracks = self.open_tracks(&mut octx, &mut pending, true)?;
        }
        match tracks.as_mut() {
            Some(tracks) => {
                tracks.finish(&mut octx)?;
                octx.write_trailer().map_err(av_error("Failed to write trailer"))?;
                debug!(
                    "libav encoder flushed {} video and {} audio frames",
                    tracks.video.frames,
                    tracks.audio.as_ref().map_or(0, |audio| audio.frames)
                );
            }
            None => debug!("No video frames captured; output stays empty"),
        }
        // closing the muxer flushes its IO buffer to disk
        drop(octx);
        tail.forward(chunks)?;
        Ok(())
    }

    /// Open the encoders and write the header once the first video frame is
    /// in and the audio track is known (or given up on). Replays `pending`.
    fn open_tracks(
        &self,
        octx: &mut ffmpeg::format::context::Output,
        pending: &mut Vec<MediaFrame>,
        force: bool,
    ) -> PipelineResult<Option<Tracks>> {
        let Some((first_pts, width, height)) = pending.iter().find_map(|frame| match frame.kind {
            FrameKind::Video { width, height } => Some((frame.pts, width, height)),
            FrameKind::Audio { .. } => None,
        }) else {
            return Ok(None);
        };

        let audio = match self.audio {
            Some(codec) if pending.iter().any(|frame| !frame.is_video()) => Some(codec),
            Some(_) => {
                let waited = pending.last().map_or(0.0, |frame| frame.pts) - first_pts;
                if !force && waited < AUDIO_WAIT_SECS {
                    return Ok(None);
                }
                debug!("No audio arrived with the opening video; output is video only");
                None
            }
            None => None,
        };

        let mut tracks = Tracks::open(
            octx,
            self.codec,
            audio,
            &self.settings,
            self.threads,
            width,
            height,
        )?;
        for frame in pending.drain(..) {
            tracks.encode(octx, &frame)?;
        }
        Ok(Some(tracks))
    }
}

/// Encoders feeding the output, in stream order
struct Tracks {
    video: VideoEncoder,
    audio: Option<AudioEncoder>,
}

impl Tracks {
    fn open(
        octx: &mut ffmpeg::format::context::Output,
        id: codec::Id,
        audio: Option<AudioCodec>,
        settings: &EncoderSettings,
        threads: usize,
        width: u32,
        height: u32,
    ) -> PipelineResult<Self> {
        let mut video = VideoEncoder::open(octx, id, settings, threads, width, height)?;
        let mut audio = audio
            .map(|codec| AudioEncoder::open(octx, codec))
            .transpose()?;

        // live mode: clusters are written once and never rewritten
        let mut header_options = Dictionary::new();
        header_options.set("live", "1");
        octx.write_header_with(header_options)
            .map_err(av_error("Failed to write output header"))?;

        // the muxer may pick its own time bases while writing the header
        video.stream_time_base = stream_time_base(octx, video.stream_index, video.time_base);
        if let Some(audio) = audio.as_mut() {
            audio.stream_time_base = stream_time_base(octx, audio.stream_index, audio.time_base);
        }
        Ok(Self { video, audio })
    }

    fn encode(
        &mut self,
        octx: &mut ffmpeg::format::context::Output,
        frame: &MediaFrame,
    ) -> PipelineResult<()> {
        match frame.kind {
            FrameKind::Video { width, height } => self.video.encode(octx, frame, width, height),
            FrameKind::Audio {
                sample_rate,
                channels,
            } => match self.audio.as_mut() {
                Some(audio) => audio.encode(octx, frame, sample_rate, channels),
                None => Ok(()),
            },
        }
    }

    fn finish(&mut self, octx: &mut ffmpeg::format::context::Output) -> PipelineResult<()> {
        self.video.finish(octx)?;
        if let Some(audio) = self.audio.as_mut() {
            audio.finish(octx)?;
        }
        Ok(())
    }
}

fn stream_time_base(
    octx: &ffmpeg::format::context::Output,
    index: usize,
    fallback: Rational,
) -> Rational {
    octx.stream(index).map(|s| s.time_base()).unwrap_or(fallback)
}

/// Send every ready packet to the muxer
fn write_packets(
    encoder: &mut ffmpeg::encoder::Encoder,
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    time_base: Rational,
    stream_time_base: Rational,
) -> PipelineResult<()> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(time_base, stream_time_base);
        packet
            .write_interleaved(octx)
            .map_err(av_error("Failed to write encoded packet"))?;
    }
    Ok(())
}

struct VideoEncoder {
    encoder: ffmpeg::encoder::Video,
    stream_index: usize,
    time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    last_pts: i64,
    frames: u64,
}

impl VideoEncoder {
    fn open(
        octx: &mut ffmpeg::format::context::Output,
        id: codec::Id,
        settings: &EncoderSettings,
        threads: usize,
        width: u32,
        height: u32,
    ) -> PipelineResult<Self> {
        let codec = ffmpeg::encoder::find(id)
            .ok_or_else(|| PipelineError::capture(format!("{:?} encoder not found", id)))?;
        // millisecond ticks
        let time_base = Rational::new(1, 1000);

        let (encoder, stream_index) = {
            let mut ost = octx.add_stream(codec).map_err(av_error("Failed to add video stream"))?;
            ost.set_time_base(time_base);

            let mut context = codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .map_err(av_error("Failed to create video encoder"))?;
            context.set_width(width);
            context.set_height(height);
            context.set_format(Pixel::YUV420P);
            context.set_time_base(time_base);
            context.set_bit_rate(settings.bitrate.bits_per_second() as usize);

            let mut options = Dictionary::new();
            options.set("deadline", "realtime");
            options.set("cpu-used", "8");
            options.set("threads", &threads.to_string());
            if id == codec::Id::VP9 {
                options.set("row-mt", "1");
            }
            let encoder = context
                .open_as_with(codec, options)
                .map_err(av_error("Failed to open video encoder"))?;
            ost.set_parameters(&encoder);
            (encoder, ost.index())
        };

        debug!("Video encoder opened: {}x{} {:?}", width, height, id);
        Ok(Self {
            encoder,
            stream_index,
            time_base,
            stream_time_base: time_base,
            width,
            height,
            last_pts: -1,
            frames: 0,
        })
    }

    fn encode(
        &mut self,
        octx: &mut ffmpeg::format::context::Output,
        frame: &MediaFrame,
        width: u32,
        height: u32,
    ) -> PipelineResult<()> {
        if (width, height) != (self.width, self.height) {
            debug!("Dropping {}x{} frame; encoder is {}x{}", width, height, self.width, self.height);
            return Ok(());
        }

        let mut video = VideoFrame::new(Pixel::YUV420P, width, height);
        unpack_planes(&frame.data, &mut video);
        let pts = ((frame.pts * 1000.0).round() as i64).max(self.last_pts + 1);
        self.last_pts = pts;
        video.set_pts(Some(pts));

        self.encoder
            .send_frame(&video)
            .map_err(av_error("Failed to send frame to encoder"))?;
        self.frames += 1;
        self.drain(octx)
    }

    fn finish(&mut self, octx: &mut ffmpeg::format::context::Output) -> PipelineResult<()> {
        self.encoder
            .send_eof()
            .map_err(av_error("Failed to flush video encoder"))?;
        self.drain(octx)
    }

    fn drain(&mut self, octx: &mut ffmpeg::format::context::Output) -> PipelineResult<()> {
        write_packets(
            &mut self.encoder,
            octx,
            self.stream_index,
            self.time_base,
            self.stream_time_base,
        )
    }
}

/// Opus/Vorbis stereo at 48 kHz, fed through a sample FIFO so every frame
/// carries exactly `frame_size` samples
struct AudioEncoder {
    encoder: ffmpeg::encoder::Audio,
    format: Sample,
    stream_index: usize,
    time_base: Rational,
    stream_time_base: Rational,
    frame_size: usize,
    // only for frames that are not already 48 kHz stereo
    resampler: Option<(u32, u16, ResampleCtx)>,
    // interleaved stereo samples
    fifo: Vec<f32>,
    next_pts: Option<i64>,
    frames: u64,
}

impl AudioEncoder {
    fn open(
        octx: &mut ffmpeg::format::context::Output,
        audio: AudioCodec,
    ) -> PipelineResult<Self> {
        let codec = ffmpeg::encoder::find_by_name(audio.name)
            .ok_or_else(|| PipelineError::capture(format!("{} encoder not found", audio.name)))?;
        let time_base = Rational::new(1, AUDIO_SAMPLE_RATE as i32);

        let mut ost = octx.add_stream(codec).map_err(av_error("Failed to add audio stream"))?;
        ost.set_time_base(time_base);

        let mut context = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(av_error("Failed to create audio encoder"))?;
        context.set_rate(AUDIO_SAMPLE_RATE as i32);
        context.set_channel_layout(ChannelLayout::STEREO);
        context.set_format(audio.format);
        context.set_bit_rate(AUDIO_BITRATE.bits_per_second() as usize);
        context.set_time_base(time_base);
        let encoder = context
            .open_as(codec)
            .map_err(av_error("Failed to open audio encoder"))?;
        ost.set_parameters(&encoder);
        let stream_index = ost.index();

        let frame_size = match encoder.frame_size() {
            0 => 1024,
            size => size as usize,
        };
        debug!("Audio encoder opened: {} ({} samples per frame)", audio.name, frame_size);
        Ok(Self {
            encoder,
            format: audio.format,
            stream_index,
            time_base,
            stream_time_base: time_base,
            frame_size,
            resampler: None,
            fifo: Vec::new(),
            next_pts: None,
            frames: 0,
        })
    }

    fn encode(
        &mut self,
        octx: &mut ffmpeg::format::context::Output,
        frame: &MediaFrame,
        sample_rate: u32,
        channels: u16,
    ) -> PipelineResult<()> {
        if channels == 0 || channels > 2 || sample_rate == 0 {
            debug!("Dropping {} Hz {}-channel audio frame", sample_rate, channels);
            return Ok(());
        }
        if self.next_pts.is_none() {
            self.next_pts = Some((frame.pts * AUDIO_SAMPLE_RATE as f64).round() as i64);
        }

        let samples = read_f32(&frame.data);
        if (sample_rate, channels) == (AUDIO_SAMPLE_RATE, AUDIO_CHANNELS) {
            self.fifo.extend(samples);
        } else {
            let converted = self.resample(&samples, sample_rate, channels)?;
            self.fifo.extend(converted);
        }
        self.send_frames(octx, false)
    }

    fn resample(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> PipelineResult<Vec<f32>> {
        let layout = if channels >= 2 {
            ChannelLayout::STEREO
        } else {
            ChannelLayout::MONO
        };
        let reusable = matches!(
            &self.resampler,
            Some((rate, count, _)) if (*rate, *count) == (sample_rate, channels)
        );
        if !reusable {
            let resampler = ResampleCtx::get(
                Sample::F32(SampleType::Packed),
                layout,
                sample_rate,
                Sample::F32(SampleType::Packed),
                ChannelLayout::STEREO,
                AUDIO_SAMPLE_RATE,
            )
            .map_err(av_error("Failed to create audio resampler"))?;
            self.resampler = Some((sample_rate, channels, resampler));
        }

        let count = samples.len() / channels as usize;
        let mut input = AudioFrame::new(Sample::F32(SampleType::Packed), count, layout);
        input.set_rate(sample_rate);
        write_f32(input.data_mut(0), samples);

        let mut output = AudioFrame::empty();
        if let Some((_, _, resampler)) = self.resampler.as_mut() {
            resampler
                .run(&input, &mut output)
                .map_err(av_error("Failed to resample audio"))?;
        }
        let len = output.samples() * AUDIO_CHANNELS as usize;
        let mut converted = read_f32(output.data(0));
        converted.truncate(len);
        Ok(converted)
    }

    /// Encode whole frames from the FIFO; `flush` pads out the last one
    fn send_frames(
        &mut self,
        octx: &mut ffmpeg::format::context::Output,
        flush: bool,
    ) -> PipelineResult<()> {
        let channels = AUDIO_CHANNELS as usize;
        let per_frame = self.frame_size * channels;

        while self.fifo.len() >= per_frame || (flush && !self.fifo.is_empty()) {
            let take = per_frame.min(self.fifo.len());
            let mut block: Vec<f32> = self.fifo.drain(..take).collect();
            block.resize(per_frame, 0.0);

            let mut out = AudioFrame::new(self.format, self.frame_size, ChannelLayout::STEREO);
            out.set_rate(AUDIO_SAMPLE_RATE);
            let pts = self.next_pts.unwrap_or(0);
            out.set_pts(Some(pts));
            self.next_pts = Some(pts + self.frame_size as i64);

            if self.format.is_planar() {
                for channel in 0..channels {
                    let plane: Vec<f32> =
                        block.iter().skip(channel).step_by(channels).copied().collect();
                    write_f32(out.data_mut(channel), &plane);
                }
            } else {
                write_f32(out.data_mut(0), &block);
            }

            self.encoder
                .send_frame(&out)
                .map_err(av_error("Failed to send audio frame to encoder"))?;
            self.frames += 1;
            self.drain(octx)?;
        }
        Ok(())
    }

    fn finish(&mut self, octx: &mut ffmpeg::format::context::Output) -> PipelineResult<()> {
        self.send_frames(octx, true)?;
        self.encoder
            .send_eof()
            .map_err(av_error("Failed to flush audio encoder"))?;
        self.drain(octx)
    }

    fn drain(&mut self, octx: &mut ffmpeg::format::context::Output) -> PipelineResult<()> {
        write_packets(
            &mut self.encoder,
            octx,
            self.stream_index,
            self.time_base,
            self.stream_time_base,
        )
    }
}

/// Copy packed planes into a frame's padded planes
pub(super) fn unpack_planes(data: &[u8], frame: &mut VideoFrame) {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let planes = [
        (width, height),
        ((width + 1) / 2, (height + 1) / 2),
        ((width + 1) / 2, (height + 1) / 2),
    ];

    let mut offset = 0;
    for (index, (plane_width, rows)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let plane = frame.data_mut(index);
        for row in 0..rows {
            let Some(src) = data.get(offset..offset + plane_width) else {
                return;
            };
            plane[row * stride..row * stride + plane_width].copy_from_slice(src);
            offset += plane_width;
        }
    }
}

/// Reads bytes the muxer has appended since the last forward
pub(super) struct OutputTail {
    file: File,
    forwarded: u64,
}

impl OutputTail {
    pub(super) fn new(file: File) -> Self {
        Self { file, forwarded: 0 }
    }

    /// Returns `false` when the chunk receiver is gone
    pub(super) fn forward(&mut self, chunks: &ChunkSender) -> PipelineResult<bool> {
        self.file.seek(SeekFrom::Start(self.forwarded))?;
        let mut fresh = Vec::new();
        self.file.read_to_end(&mut fresh)?;
        if fresh.is_empty() {
            return Ok(true);
        }
        self.forwarded += fresh.len() as u64;
        Ok(chunks.blocking_send(Ok(EncodedChunk::new(fresh))).is_ok())
    }
}

struct LibavEncoderHandle {
    chunks: mpsc::Receiver<PipelineResult<EncodedChunk>>,
    stop_tx: Option<oneshot::Sender<()>>,
    aborted: Arc<AtomicBool>,
}

#[async_trait]
impl EncoderHandle for LibavEncoderHandle {
    async fn next_chunk(&mut self) -> Option<PipelineResult<EncodedChunk>> {
        self.chunks.recv().await
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        // dropping the sender wakes the encode thread
        self.stop_tx.take();
        self.chunks.close();
    }
}

impl Drop for LibavEncoderHandle {
    fn drop(&mut self) {
        self.abort();
    }
}
