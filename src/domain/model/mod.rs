// Domain models - Core types and data structures

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorReport, PipelineError, PipelineResult};

/// Identifier of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a media input; clones of one input share it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputId(Uuid);

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw source bytes plus the size the caller declared for them.
///
/// Cloning is cheap and keeps the same [`InputId`], so two runs handed clones
/// of one input are runs against the same source instance.
#[derive(Clone)]
pub struct MediaInput {
    id: InputId,
    bytes: Arc<[u8]>,
    size_bytes: u64,
}

impl MediaInput {
    /// Accept source bytes with a caller-declared size
    pub fn new(bytes: impl Into<Vec<u8>>, declared_size: u64) -> Self {
        let bytes: Vec<u8> = bytes.into();
        if declared_size != bytes.len() as u64 {
            tracing::debug!(
                "Declared input size {} differs from {} bytes received",
                declared_size,
                bytes.len()
            );
        }
        Self {
            id: InputId(Uuid::new_v4()),
            bytes: Arc::from(bytes),
            size_bytes: declared_size,
        }
    }

    /// Accept source bytes, taking their length as the size
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let size = bytes.len() as u64;
        Self::new(bytes, size)
    }

    pub fn id(&self) -> InputId {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl fmt::Debug for MediaInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaInput")
            .field("id", &self.id)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// Named size/quality tradeoff point; ordered from smallest output to largest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 3] = [QualityPreset::Low, QualityPreset::Medium, QualityPreset::High];
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for QualityPreset {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(QualityPreset::Low),
            "medium" => Ok(QualityPreset::Medium),
            "high" => Ok(QualityPreset::High),
            other => Err(PipelineError::Config {
                message: format!("Invalid quality preset: {}. Valid presets: low, medium, high", other),
            }),
        }
    }
}

/// Target average output rate in bits per second, always non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BitrateTarget(pub(crate) u32);

impl BitrateTarget {
    /// Returns `None` for a zero rate
    pub fn from_bps(bits_per_second: u32) -> Option<Self> {
        (bits_per_second > 0).then_some(Self(bits_per_second))
    }

    pub fn bits_per_second(&self) -> u32 {
        self.0
    }

    /// Bytes the encoder should emit for `seconds` of media
    pub fn bytes_for(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (self.0 as f64 * seconds / 8.0).round() as u64
    }
}

impl fmt::Display for BitrateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbps", self.0 / 1000)
    }
}

/// Read-only view of the playback clock at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackSnapshot {
    /// `None` until metadata is known, or when the source cannot tell
    pub duration: Option<f64>,
    pub position: f64,
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    WebM,
    Matroska,
}

impl ContainerFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            ContainerFormat::WebM => "video/webm",
            ContainerFormat::Matroska => "video/x-matroska",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::WebM => "webm",
            ContainerFormat::Matroska => "mkv",
        }
    }

    /// Muxer short name understood by libavformat
    pub fn muxer_name(&self) -> &'static str {
        match self {
            ContainerFormat::WebM => "webm",
            ContainerFormat::Matroska => "matroska",
        }
    }
}

impl FromStr for ContainerFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "webm" => Ok(ContainerFormat::WebM),
            "matroska" | "mkv" => Ok(ContainerFormat::Matroska),
            other => Err(PipelineError::Config {
                message: format!("Invalid container: {}. Valid containers: webm, matroska", other),
            }),
        }
    }
}

/// Output video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp9,
    Vp8,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Vp8 => "vp8",
        }
    }
}

impl FromStr for VideoCodec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vp9" => Ok(VideoCodec::Vp9),
            "vp8" => Ok(VideoCodec::Vp8),
            other => Err(PipelineError::Config {
                message: format!("Invalid video codec: {}. Valid codecs: vp9, vp8", other),
            }),
        }
    }
}

/// How fast a source advances its playback clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Wall-clock rate; a run takes at least the source duration
    Realtime,
    /// As fast as decode and encode allow
    Unthrottled,
}

impl FromStr for Pacing {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "realtime" => Ok(Pacing::Realtime),
            "unthrottled" => Ok(Pacing::Unthrottled),
            other => Err(PipelineError::Config {
                message: format!("Invalid pacing: {}. Valid values: realtime, unthrottled", other),
            }),
        }
    }
}

/// Kind of decoded signal carried by a [`MediaFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Planar YUV 4:2:0 picture
    Video { width: u32, height: u32 },
    /// Interleaved f32 PCM
    Audio { sample_rate: u32, channels: u16 },
}

/// One unit of the live decoded signal handed from source to encoder
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    /// Presentation time in seconds from the start of the source
    pub pts: f64,
    pub data: Vec<u8>,
}

impl MediaFrame {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, FrameKind::Video { .. })
    }
}

/// Fragment of encoded output; order is the order of arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    data: Vec<u8>,
}

impl EncodedChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Everything an encoder backend needs to configure one session
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub bitrate: BitrateTarget,
    pub container: ContainerFormat,
    pub video_codec: VideoCodec,
    pub include_audio: bool,
    /// Media time covered by each emitted chunk
    pub timeslice: Duration,
    pub output_basename: String,
}

impl EncoderSettings {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.output_basename, self.container.extension())
    }

    /// MIME type with codec parameter, e.g. `video/webm; codecs=vp9`
    pub fn mime_with_codecs(&self) -> String {
        format!("{}; codecs={}", self.container.media_type(), self.video_codec.name())
    }
}

/// Final encoded output of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    #[serde(skip)]
    bytes: Vec<u8>,
    size_bytes: u64,
    media_type: String,
    file_name: String,
    chunk_count: usize,
    created_at: DateTime<Utc>,
}

impl Artifact {
    /// Concatenate chunks in arrival order into the output file
    pub fn assemble(
        chunks: Vec<EncodedChunk>,
        file_name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> PipelineResult<Self> {
        let total = chunks
            .iter()
            .try_fold(0usize, |acc, chunk| acc.checked_add(chunk.len()))
            .ok_or_else(|| PipelineError::finalize("encoded output exceeds addressable size"))?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|e| PipelineError::finalize(format!("cannot allocate {} bytes: {}", total, e)))?;
        for chunk in &chunks {
            bytes.extend_from_slice(chunk.as_bytes());
        }

        Ok(Self {
            size_bytes: bytes.len() as u64,
            bytes,
            media_type: media_type.into(),
            file_name: file_name.into(),
            chunk_count: chunks.len(),
            created_at: Utc::now(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Output size over original size; `None` for an empty original
    pub fn compression_ratio(&self, original_size: u64) -> Option<f64> {
        (original_size > 0).then(|| self.size_bytes as f64 / original_size as f64)
    }

    /// Bytes saved versus the original, negative when the output grew
    pub fn size_saved(&self, original_size: u64) -> i64 {
        original_size as i64 - self.size_bytes as i64
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Loaded,
    Encoding,
    Completed,
    Errored,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Errored)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Loaded => "loaded",
            PipelineState::Encoding => "encoding",
            PipelineState::Completed => "completed",
            PipelineState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Time left in a run, or a sentinel when the duration is unknown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainingTime {
    Seconds(f64),
    Unknown,
}

impl RemainingTime {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            RemainingTime::Seconds(s) => Some(*s),
            RemainingTime::Unknown => None,
        }
    }
}

/// Periodic progress sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0-100, `None` while the duration is unknown
    pub percent: Option<u8>,
    pub remaining: RemainingTime,
    pub position_secs: f64,
    pub elapsed_secs: f64,
}

/// Terminal outcome of a run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultEvent {
    Completed { artifact: Arc<Artifact> },
    Errored { reason: ErrorReport },
}

/// Everything a caller observes while a run is in flight
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Progress(ProgressEvent),
    Chunk { index: u64, size_bytes: usize },
    Result(ResultEvent),
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Result(_))
    }
}

#[cfg(test)]
mod tests;
