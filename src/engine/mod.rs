//! Re-encoding engine: playback clock, progress, encoding sessions, orchestration

pub mod clock;
pub mod orchestrator;
pub mod progress;
pub mod session;

pub use clock::{ClockReader, EndedSignal, PlaybackClock};
pub use orchestrator::{Pipeline, RunEvents};
pub use progress::{compute_progress, ProgressCallback, ProgressTracker, DEFAULT_CADENCE};
pub use session::{ChunkObserver, EncodingSession, SessionState};
