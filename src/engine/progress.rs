//! Progress tracking on a fixed sampling cadence
//!
//! The tracker polls a [`ClockReader`] every `cadence` and reports
//! percent-complete plus estimated time remaining to a [`ProgressCallback`].
//! Reported percentages never decrease within one tracker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::domain::model::{PlaybackSnapshot, ProgressEvent, RemainingTime};
use crate::engine::clock::ClockReader;

/// Default sampling interval
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(300);

/// Receives progress samples
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Percent complete and time remaining for one clock reading.
///
/// Unknown duration yields `(None, Unknown)`. A known zero duration is
/// complete by definition.
pub fn compute_progress(snapshot: PlaybackSnapshot) -> (Option<u8>, RemainingTime) {
    let Some(duration) = snapshot.duration else {
        return (None, RemainingTime::Unknown);
    };
    if duration <= 0.0 {
        return (Some(100), RemainingTime::Seconds(0.0));
    }

    let position = snapshot.position.max(0.0);
    let percent = (position / duration * 100.0).round().clamp(0.0, 100.0) as u8;
    let remaining = (duration - position).max(0.0);
    (Some(percent), RemainingTime::Seconds(remaining))
}

struct Sampler {
    clock: ClockReader,
    started: Instant,
    last_percent: Mutex<Option<u8>>,
}

impl Sampler {
    fn sample(&self) -> ProgressEvent {
        let snapshot = self.clock.snapshot();
        let (percent, remaining) = compute_progress(snapshot);

        let percent = match self.last_percent.lock() {
            Ok(mut last) => {
                let held = match (percent, *last) {
                    (Some(p), Some(prev)) => Some(p.max(prev)),
                    (Some(p), None) => Some(p),
                    (None, prev) => {
                        // duration vanished mid-run; keep the last known figure
                        prev
                    }
                };
                *last = held;
                held
            }
            Err(_) => percent,
        };

        ProgressEvent {
            percent,
            remaining,
            position_secs: snapshot.position,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Periodic progress sampler bound to one run
pub struct ProgressTracker {
    sampler: Arc<Sampler>,
    callback: Arc<dyn ProgressCallback>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    samples: Arc<Mutex<u64>>,
}

impl ProgressTracker {
    /// Start sampling `clock` every `cadence`; the first sample is immediate
    pub fn start(
        clock: ClockReader,
        cadence: Duration,
        callback: impl ProgressCallback + 'static,
    ) -> Self {
        let cadence = if cadence.is_zero() {
            warn!("Zero progress cadence requested, using {:?}", DEFAULT_CADENCE);
            DEFAULT_CADENCE
        } else {
            cadence
        };

        let sampler = Arc::new(Sampler {
            clock,
            started: Instant::now(),
            last_percent: Mutex::new(None),
        });
        let callback: Arc<dyn ProgressCallback> = Arc::new(callback);
        let samples = Arc::new(Mutex::new(0u64));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = {
            let sampler = Arc::clone(&sampler);
            let callback = Arc::clone(&callback);
            let samples = Arc::clone(&samples);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cadence);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut stop_rx => break,
                        _ = ticker.tick() => {
                            let event = sampler.sample();
                            callback.on_progress(&event);
                            if let Ok(mut count) = samples.lock() {
                                *count += 1;
                            }
                        }
                    }
                }
            })
        };

        debug!("Progress tracker started with cadence {:?}", cadence);
        Self {
            sampler,
            callback,
            stop_tx: Some(stop_tx),
            task: Some(task),
            samples,
        }
    }

    /// End sampling. No callback runs after this returns. Repeat calls are no-ops.
    pub async fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Progress sampling task ended abnormally: {}", e);
            }
        }
        debug!("Progress tracker stopped after {} samples", self.sample_count());
    }

    /// Stop sampling, then deliver one last sample of the final clock state
    pub async fn finish(&mut self) -> Option<ProgressEvent> {
        if self.is_stopped() {
            return None;
        }
        self.stop().await;
        let event = self.sampler.sample();
        self.callback.on_progress(&event);
        if let Ok(mut count) = self.samples.lock() {
            *count += 1;
        }
        Some(event)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_tx.is_none()
    }

    /// Number of samples delivered so far
    pub fn sample_count(&self) -> u64 {
        self.samples.lock().map(|count| *count).unwrap_or(0)
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::PlaybackClock;

    fn snapshot(duration: Option<f64>, position: f64) -> PlaybackSnapshot {
        PlaybackSnapshot { duration, position }
    }

    #[test]
    fn test_compute_progress_known_duration() {
        let (percent, remaining) = compute_progress(snapshot(Some(10.0), 2.5));
        assert_eq!(percent, Some(25));
        assert_eq!(remaining, RemainingTime::Seconds(7.5));
    }

    #[test]
    fn test_compute_progress_rounds_and_clamps() {
        assert_eq!(compute_progress(snapshot(Some(3.0), 1.0)).0, Some(33));
        assert_eq!(compute_progress(snapshot(Some(3.0), 2.0)).0, Some(67));
        let (percent, remaining) = compute_progress(snapshot(Some(10.0), 12.0));
        assert_eq!(percent, Some(100));
        assert_eq!(remaining, RemainingTime::Seconds(0.0));
        assert_eq!(compute_progress(snapshot(Some(10.0), -1.0)).0, Some(0));
    }

    #[test]
    fn test_compute_progress_unknown_duration() {
        let (percent, remaining) = compute_progress(snapshot(None, 4.0));
        assert_eq!(percent, None);
        assert_eq!(remaining, RemainingTime::Unknown);
    }

    #[test]
    fn test_compute_progress_zero_duration() {
        let (percent, remaining) = compute_progress(snapshot(Some(0.0), 0.0));
        assert_eq!(percent, Some(100));
        assert_eq!(remaining, RemainingTime::Seconds(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_samples_on_cadence() {
        let clock = PlaybackClock::new();
        clock.mark_ready(Some(3.0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tracker = ProgressTracker::start(
            clock.reader(),
            Duration::from_millis(300),
            move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()),
        );

        // ticks at 0, 300, 600, 900 ms
        tokio::time::sleep(Duration::from_millis(1000)).await;
        tracker.stop().await;
        assert_eq!(tracker.sample_count(), 4);
        assert_eq!(seen.lock().unwrap().len(), 4);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_reports_final_state() {
        let clock = PlaybackClock::new();
        clock.mark_ready(Some(10.0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tracker = ProgressTracker::start(
            clock.reader(),
            Duration::from_millis(300),
            move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()),
        );

        clock.advance_to(6.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.mark_ended();

        let last = tracker.finish().await.unwrap();
        assert_eq!(last.percent, Some(100));
        assert_eq!(last.remaining, RemainingTime::Seconds(0.0));
        assert!(tracker.is_stopped());
        assert!(tracker.finish().await.is_none());
        assert_eq!(seen.lock().unwrap().last().unwrap().percent, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_percent_never_decreases() {
        let clock = PlaybackClock::new();
        clock.mark_ready(Some(10.0));
        clock.advance_to(5.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tracker = ProgressTracker::start(
            clock.reader(),
            Duration::from_millis(300),
            move |event: &ProgressEvent| sink.lock().unwrap().push(event.percent),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        // a source that loses its duration must not make progress go backwards
        clock.mark_ready(None);
        tokio::time::sleep(Duration::from_millis(700)).await;
        tracker.stop().await;

        let percents = seen.lock().unwrap().clone();
        assert!(percents.len() >= 2);
        assert!(percents.iter().all(|p| *p == Some(50)));
    }
}
