// libav adapters - FFmpeg-backed source and VP8/VP9 encoder
//
// Decoding and encoding run on blocking threads; frames cross into the
// encoder through the capture channel and encoded bytes come back as chunks.

mod encoder;
mod source;

pub use encoder::LibavEncoder;
pub use source::LibavSource;

use std::sync::Once;

use tracing::warn;

use crate::error::{PipelineError, PipelineResult};

static INIT: Once = Once::new();

/// Initialise FFmpeg once per process
pub(crate) fn ensure_initialized() -> PipelineResult<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        if let Err(e) = ffmpeg_next::init() {
            result = Err(PipelineError::capture(format!("Failed to initialize FFmpeg: {}", e)));
        }
        ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);
    });
    if result.is_err() {
        warn!("FFmpeg initialisation failed; libav adapters unavailable");
    }
    result
}

/// Seconds in stream time base units
pub(crate) fn seconds(ts: i64, time_base: ffmpeg_next::Rational) -> f64 {
    ts as f64 * f64::from(time_base)
}

/// Native-endian f32 samples from raw PCM bytes; a trailing partial sample is dropped
pub(crate) fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Write samples as native-endian bytes into the front of `dst`
pub(crate) fn write_f32(dst: &mut [u8], samples: &[f32]) {
    for (slot, sample) in dst.chunks_exact_mut(4).zip(samples) {
        slot.copy_from_slice(&sample.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ffmpeg_next::format::Pixel;
    use ffmpeg_next::util::frame::video::Video as VideoFrame;
    use tokio::sync::mpsc;

    use super::encoder::{unpack_planes, OutputTail};
    use super::source::pack_planes;
    use super::*;
    use crate::adapters::mock::EBML_MAGIC;
    use crate::config::PipelineConfig;
    use crate::domain::model::*;
    use crate::domain::rules::{BitratePolicy, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
    use crate::error::PipelineError;
    use crate::ports::{EncoderBackend, EncoderHandle, CAPTURE_BUFFER_FRAMES};

    fn yuv_frame_bytes(width: usize, height: usize) -> usize {
        width * height + 2 * ((width + 1) / 2) * ((height + 1) / 2)
    }

    #[test]
    fn test_planes_survive_pack_and_unpack_at_odd_size() {
        ensure_initialized().unwrap();
        let (width, height) = (5, 3);
        let packed: Vec<u8> = (0..yuv_frame_bytes(width, height))
            .map(|i| (i * 7 % 251) as u8)
            .collect();

        let mut frame = VideoFrame::new(Pixel::YUV420P, width as u32, height as u32);
        unpack_planes(&packed, &mut frame);
        assert_eq!(pack_planes(&frame), packed);
    }

    #[test]
    fn test_unpack_tolerates_short_input() {
        ensure_initialized().unwrap();
        let mut frame = VideoFrame::new(Pixel::YUV420P, 4, 4);
        unpack_planes(&[9u8; 10], &mut frame);
        assert_eq!(&pack_planes(&frame)[..4], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_output_tail_forwards_only_new_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut tail = OutputTail::new(std::fs::File::open(file.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(4);

        assert!(tail.forward(&tx).unwrap());
        assert!(rx.try_recv().is_err());

        file.write_all(b"header").unwrap();
        file.flush().unwrap();
        assert!(tail.forward(&tx).unwrap());
        assert_eq!(rx.try_recv().unwrap().unwrap().as_bytes(), b"header");

        assert!(tail.forward(&tx).unwrap());
        assert!(rx.try_recv().is_err());

        file.write_all(b"cluster").unwrap();
        file.flush().unwrap();
        assert!(tail.forward(&tx).unwrap());
        assert_eq!(rx.try_recv().unwrap().unwrap().as_bytes(), b"cluster");

        drop(rx);
        file.write_all(b"more").unwrap();
        file.flush().unwrap();
        assert!(!tail.forward(&tx).unwrap());
    }

    #[test]
    fn test_f32_samples_roundtrip_through_bytes() {
        let samples = [0.0f32, -1.0, 0.5, 0.25];
        let mut bytes = vec![0u8; 18];
        write_f32(&mut bytes, &samples);
        assert_eq!(read_f32(&bytes), samples);
    }

    fn video_frame(index: usize, width: u32, height: u32) -> MediaFrame {
        MediaFrame {
            kind: FrameKind::Video { width, height },
            pts: index as f64 / 10.0,
            data: vec![(index * 20 % 256) as u8; yuv_frame_bytes(width as usize, height as usize)],
        }
    }

    fn audio_frame(index: usize) -> MediaFrame {
        // 100 ms of a quiet ramp
        let samples = AUDIO_SAMPLE_RATE as usize / 10 * AUDIO_CHANNELS as usize;
        let pcm: Vec<f32> = (0..samples).map(|i| (i % 100) as f32 / 1000.0).collect();
        let mut data = vec![0u8; pcm.len() * 4];
        write_f32(&mut data, &pcm);
        MediaFrame {
            kind: FrameKind::Audio {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
            },
            pts: index as f64 / 10.0,
            data,
        }
    }

    /// Encode one second of synthetic frames; `None` when this FFmpeg lacks the codec
    async fn encode_synthetic(include_audio: bool) -> Option<Vec<u8>> {
        let encoder = LibavEncoder::new().unwrap();
        let settings = EncoderSettings {
            include_audio,
            ..PipelineConfig::default().encoder_settings(BitratePolicy::resolve(QualityPreset::Low))
        };
        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER_FRAMES);
        let mut handle = match encoder.start(&settings, rx) {
            Ok(handle) => handle,
            Err(PipelineError::CaptureUnavailable { .. }) => return None,
            Err(e) => panic!("encoder failed to start: {}", e),
        };

        for index in 0..10 {
            if include_audio {
                tx.send(audio_frame(index)).await.unwrap();
            }
            tx.send(video_frame(index, 64, 48)).await.unwrap();
        }
        drop(tx);

        let mut output = Vec::new();
        while let Some(chunk) = handle.next_chunk().await {
            output.extend_from_slice(chunk.unwrap().as_bytes());
        }
        Some(output)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_synthetic_encode_produces_webm() {
        let Some(output) = encode_synthetic(false).await else {
            return;
        };
        assert!(output.starts_with(&EBML_MAGIC));
        assert!(output.len() > 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_synthetic_encode_carries_an_audio_track() {
        ensure_initialized().unwrap();
        if super::encoder::find_audio_codec().is_none() {
            return;
        }
        let Some(output) = encode_synthetic(true).await else {
            return;
        };
        assert!(output.starts_with(&EBML_MAGIC));

        let mut file = tempfile::Builder::new().suffix(".webm").tempfile().unwrap();
        file.write_all(&output).unwrap();
        file.flush().unwrap();
        let input = ffmpeg_next::format::input(&file.path()).unwrap();
        assert!(input
            .streams()
            .best(ffmpeg_next::media::Type::Audio)
            .is_some());
        assert!(input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .is_some());
    }
}
