//! Playback clock shared between a source and its observers
//!
//! The source owns the only [`PlaybackClock`]; everything else gets a
//! [`ClockReader`]. Position never moves backwards and never passes a known
//! duration.

use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::model::PlaybackSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct ClockState {
    duration: Option<f64>,
    position: f64,
    ready: bool,
    ended: bool,
}

impl ClockState {
    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            duration: self.duration,
            position: self.position,
        }
    }
}

/// Writable playback clock, held by the source adapter
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    state: Arc<watch::Sender<ClockState>>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ClockState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Record metadata. Non-finite or negative durations are stored as unknown.
    pub fn mark_ready(&self, duration: Option<f64>) {
        let duration = duration.filter(|d| d.is_finite() && *d >= 0.0);
        self.state.send_modify(|state| {
            state.duration = duration;
            state.ready = true;
            if let Some(d) = duration {
                state.position = state.position.min(d);
            }
        });
    }

    /// Move the position forward, returning the position actually stored
    pub fn advance_to(&self, position: f64) -> f64 {
        let mut stored = 0.0;
        self.state.send_if_modified(|state| {
            let mut next = if position.is_finite() {
                position.max(state.position)
            } else {
                state.position
            };
            if let Some(d) = state.duration {
                next = next.min(d);
            }
            stored = next;
            if next != state.position {
                state.position = next;
                true
            } else {
                false
            }
        });
        stored
    }

    /// Signal end of stream. Returns `false` if it had already ended.
    pub fn mark_ended(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.ended {
                return false;
            }
            if let Some(d) = state.duration {
                state.position = state.position.max(d);
            }
            state.ended = true;
            true
        })
    }

    pub fn reader(&self) -> ClockReader {
        ClockReader {
            state: self.state.subscribe(),
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a [`PlaybackClock`]
#[derive(Debug, Clone)]
pub struct ClockReader {
    state: watch::Receiver<ClockState>,
}

impl ClockReader {
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.state.borrow().snapshot()
    }

    pub fn position(&self) -> f64 {
        self.state.borrow().position
    }

    pub fn duration(&self) -> Option<f64> {
        self.state.borrow().duration
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    pub fn is_ended(&self) -> bool {
        self.state.borrow().ended
    }

    /// Wait until metadata is recorded; returns the duration.
    ///
    /// Returns `None` as well if the clock is dropped first.
    pub async fn wait_ready(&mut self) -> Option<f64> {
        match self.state.wait_for(|s| s.ready).await {
            Ok(state) => state.duration,
            Err(_) => None,
        }
    }

    pub fn ended_signal(&self) -> EndedSignal {
        EndedSignal {
            state: self.state.clone(),
        }
    }
}

/// One-shot end-of-stream notification
#[derive(Debug)]
pub struct EndedSignal {
    state: watch::Receiver<ClockState>,
}

impl EndedSignal {
    /// Resolves once the stream has ended. `false` means the source went away first.
    pub async fn wait(mut self) -> bool {
        self.state.wait_for(|s| s.ended).await.is_ok()
    }
}
