//! Encoding session: capture, encode, collect chunks, finalize
//!
//! A session attaches a capture to an opened source, hands the live frames to
//! an encoder backend and collects the encoded chunks on a background task in
//! arrival order. `finalize` flushes the encoder and assembles the artifact;
//! `abort` discards everything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::model::{Artifact, EncodedChunk, EncoderSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::ports::{EncoderBackend, EncoderHandle, SourceHandle};

/// Notified once per chunk, in arrival order
pub trait ChunkObserver: Send + Sync {
    fn on_chunk(&self, index: u64, chunk: &EncodedChunk);
}

impl<F> ChunkObserver for F
where
    F: Fn(u64, &EncodedChunk) + Send + Sync,
{
    fn on_chunk(&self, index: u64, chunk: &EncodedChunk) {
        self(index, chunk)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Recording,
    Finalized,
    Aborted,
}

#[derive(Debug)]
enum SessionCommand {
    Stop,
    Abort,
}

type CollectorResult = PipelineResult<Vec<EncodedChunk>>;

/// Capture-and-encode lifecycle for one run
pub struct EncodingSession {
    settings: EncoderSettings,
    commands: mpsc::UnboundedSender<SessionCommand>,
    collector: Option<JoinHandle<CollectorResult>>,
    state: SessionState,
    chunk_count: Arc<AtomicU64>,
}

impl EncodingSession {
    /// Capture `source` and start encoding it with `backend`.
    ///
    /// Fails with `CaptureUnavailable` when the source cannot be captured or
    /// the backend cannot encode with these settings.
    pub fn start(
        source: &dyn SourceHandle,
        backend: &dyn EncoderBackend,
        settings: EncoderSettings,
        observer: impl ChunkObserver + 'static,
    ) -> PipelineResult<Self> {
        let frames = source.capture(settings.include_audio)?;
        let encoder = backend.start(&settings, frames)?;
        info!(
            "Encoding session started: {} at {}",
            settings.mime_with_codecs(),
            settings.bitrate
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let chunk_count = Arc::new(AtomicU64::new(0));
        let collector = tokio::spawn(collect_chunks(
            encoder,
            command_rx,
            Arc::new(observer),
            Arc::clone(&chunk_count),
        ));

        Ok(Self {
            settings,
            commands,
            collector: Some(collector),
            state: SessionState::Recording,
            chunk_count,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Chunks received so far
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Acquire)
    }

    /// Stop capture, flush the encoder and assemble the artifact.
    ///
    /// Only one call per session may succeed. A session that produced no chunk
    /// yields an empty artifact. On failure the encoder is aborted.
    pub async fn finalize(&mut self) -> PipelineResult<Artifact> {
        if self.state != SessionState::Recording {
            return Err(PipelineError::finalize(format!(
                "session already {:?}",
                self.state
            )));
        }

        let _ = self.commands.send(SessionCommand::Stop);
        let collected = match self.collector.as_mut() {
            // awaited by reference so a cancelled finalize leaves the task abortable
            Some(collector) => collector.await,
            None => return Err(PipelineError::finalize("chunk collector missing")),
        };
        self.collector = None;

        let chunks = match collected {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                self.state = SessionState::Aborted;
                warn!("Encoder failed before finalize completed: {}", e);
                return Err(match e {
                    PipelineError::Finalize { .. } => e,
                    other => PipelineError::finalize(other.to_string()),
                });
            }
            Err(e) => {
                self.state = SessionState::Aborted;
                return Err(PipelineError::finalize(format!("chunk collector failed: {}", e)));
            }
        };

        self.state = SessionState::Finalized;
        if chunks.is_empty() {
            warn!("Session finalized before any chunk arrived");
        }
        let artifact = Artifact::assemble(
            chunks,
            self.settings.file_name(),
            self.settings.container.media_type(),
        )?;
        info!(
            "Session finalized: {} chunks, {} bytes",
            artifact.chunk_count(),
            artifact.size_bytes()
        );
        Ok(artifact)
    }

    /// Stop immediately and discard buffered chunks. Idempotent.
    ///
    /// Returns once the encoder has been released.
    pub async fn abort(&mut self) {
        if self.state == SessionState::Recording {
            self.state = SessionState::Aborted;
            debug!("Aborting encoding session");
        }
        let Some(collector) = self.collector.take() else {
            return;
        };
        let _ = self.commands.send(SessionCommand::Abort);
        match collector.await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Chunk collector ended abnormally during abort: {}", e),
        }
    }
}

impl Drop for EncodingSession {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.take() {
            let _ = self.commands.send(SessionCommand::Abort);
            collector.abort();
        }
    }
}

async fn collect_chunks(
    mut encoder: Box<dyn EncoderHandle>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    observer: Arc<dyn ChunkObserver>,
    chunk_count: Arc<AtomicU64>,
) -> CollectorResult {
    let mut chunks = Vec::new();
    let mut stopping = false;

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(SessionCommand::Stop) => {
                    if !stopping {
                        debug!("Stopping encoder and draining remaining chunks");
                        encoder.stop();
                        stopping = true;
                    }
                }
                // the session itself went away
                Some(SessionCommand::Abort) | None => {
                    encoder.abort();
                    return Ok(Vec::new());
                }
            },
            chunk = encoder.next_chunk() => match chunk {
                Some(Ok(chunk)) => {
                    let index = chunks.len() as u64;
                    debug!("Chunk {} arrived: {} bytes", index, chunk.len());
                    observer.on_chunk(index, &chunk);
                    chunks.push(chunk);
                    chunk_count.store(index + 1, Ordering::Release);
                }
                Some(Err(e)) => {
                    encoder.abort();
                    return Err(e);
                }
                None => return Ok(chunks),
            },
        }
    }
}
