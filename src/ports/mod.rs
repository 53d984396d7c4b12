// Ports - Capability contracts the pipeline drives

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::model::*;
use crate::engine::clock::{ClockReader, EndedSignal};
use crate::error::PipelineResult;

/// Live decoded signal flowing from a source into an encoder
pub type FrameSender = mpsc::Sender<MediaFrame>;
pub type FrameReceiver = mpsc::Receiver<MediaFrame>;

/// Capacity of the capture channel between a source and an encoder
pub const CAPTURE_BUFFER_FRAMES: usize = 64;

/// Port for turning raw input bytes into a playable source
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Allocate decode resources for `input`.
    ///
    /// Fails with `PipelineError::Load` when the bytes cannot be decoded.
    async fn open(&self, input: &MediaInput) -> PipelineResult<Box<dyn SourceHandle>>;
}

/// An opened source. Produces no audible output; audio only ever reaches a capture.
#[async_trait]
pub trait SourceHandle: Send + Sync {
    /// Suspend until metadata is known. `None` means the duration is indeterminate.
    ///
    /// May never resolve; callers bound the wait.
    async fn await_ready(&self) -> PipelineResult<Option<f64>>;

    /// Begin advancing the playback clock. Idempotent.
    fn start_playback(&self) -> PipelineResult<()>;

    /// Read-only view of this source's playback clock
    fn clock(&self) -> ClockReader;

    /// Non-blocking read of the playback position in seconds
    fn current_position(&self) -> f64 {
        self.clock().position()
    }

    fn duration(&self) -> Option<f64> {
        self.clock().duration()
    }

    /// Fires once when playback reaches the end of the stream
    fn on_ended(&self) -> EndedSignal {
        self.clock().ended_signal()
    }

    /// Attach a capture to the live decoded output.
    ///
    /// Must be called before playback starts to see every frame. Fails with
    /// `PipelineError::CaptureUnavailable` when the output cannot be captured.
    fn capture(&self, include_audio: bool) -> PipelineResult<FrameReceiver>;

    /// Release decode resources. Safe to call repeatedly and from any state.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Port for the external codec capability
pub trait EncoderBackend: Send + Sync {
    /// Begin encoding `frames` concurrently with playback
    fn start(
        &self,
        settings: &EncoderSettings,
        frames: FrameReceiver,
    ) -> PipelineResult<Box<dyn EncoderHandle>>;
}

/// A running encoder.
#[async_trait]
pub trait EncoderHandle: Send {
    /// Next chunk in arrival order, `None` once the encoder has stopped and flushed.
    ///
    /// Must be cancel-safe: dropping the future loses no chunk.
    async fn next_chunk(&mut self) -> Option<PipelineResult<EncodedChunk>>;

    /// Stop consuming frames and flush buffered state. Flushed chunks are
    /// still delivered through `next_chunk`.
    fn stop(&mut self);

    /// Stop immediately and discard buffered output. Idempotent.
    fn abort(&mut self);
}
