//! Progress reporting for a running batch.
//!
//! Two sources feed the same [`ProgressSnapshot`]: a filesystem poller that
//! infers progress from which sample files exist, and a tracker folding the
//! driver's [`SampleEvent`]s.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProgressConfig;
use crate::driver::SampleEvent;
use crate::session::{GenerationSession, SessionSlot};

/// Number of leading samples `0, 1, ...` whose files exist.
pub fn check_generation_progress(session: &GenerationSession, total: u32) -> u32 {
    (0..total)
        .find(|index| !session.sample_path(*index).exists())
        .unwrap_or(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
    pub total: u32,
}

impl ProgressSnapshot {
    pub fn new(completed: u32, total: u32) -> Self {
        Self {
            completed: completed.min(total),
            failed: 0,
            total,
        }
    }

    pub fn settled(&self) -> u32 {
        (self.completed + self.failed).min(self.total)
    }

    /// Lowest sample index not yet settled, clamped to `total - 1`.
    pub fn index(&self) -> u32 {
        self.settled().min(self.total.saturating_sub(1))
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.settled() as f64 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.settled() >= self.total
    }

    pub fn status_text(&self) -> String {
        if self.is_complete() {
            return match self.failed {
                0 => format!("all {} samples generated", self.total),
                failed => format!(
                    "{} of {} samples generated, {failed} failed",
                    self.completed, self.total
                ),
            };
        }
        format!("generating the {} sample", ordinal(self.settled() + 1))
    }
}

pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// Why [`ProgressPoller::track`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every sample exists. Carries the first sample for display.
    Complete { first_sample: PathBuf },
    Cancelled,
    /// The slot was reset or now points at another session.
    SessionChanged,
}

/// Filesystem poller for the current session.
#[derive(Debug, Clone)]
pub struct ProgressPoller {
    poll_interval: Duration,
    startup_delay: Duration,
}

impl ProgressPoller {
    pub fn new(poll_interval: Duration, startup_delay: Duration) -> Self {
        Self {
            poll_interval,
            startup_delay,
        }
    }

    pub fn from_config(config: &ProgressConfig) -> Self {
        Self::new(config.poll_interval(), config.startup_delay())
    }

    /// Wait for the slot to hold a session, then poll it until done.
    pub async fn track(
        &self,
        slot: &SessionSlot,
        total: u32,
        cancel: CancellationToken,
        on_progress: impl FnMut(ProgressSnapshot),
    ) -> PollOutcome {
        let session = loop {
            if let Some(session) = slot.current() {
                break session;
            }
            debug!("No generation session yet, waiting before polling");
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.startup_delay) => {}
            }
        };

        self.poll(&session, total, cancel, Some(slot), on_progress)
            .await
    }

    /// Poll a known session without consulting any slot.
    pub async fn track_session(
        &self,
        session: &GenerationSession,
        total: u32,
        cancel: CancellationToken,
        on_progress: impl FnMut(ProgressSnapshot),
    ) -> PollOutcome {
        self.poll(session, total, cancel, None, on_progress).await
    }

    async fn poll(
        &self,
        session: &GenerationSession,
        total: u32,
        cancel: CancellationToken,
        slot: Option<&SessionSlot>,
        mut on_progress: impl FnMut(ProgressSnapshot),
    ) -> PollOutcome {
        let mut last: Option<ProgressSnapshot> = None;

        loop {
            if slot.is_some_and(|slot| !slot.is_current(session)) {
                debug!(
                    output_directory = %session.output_directory.display(),
                    "Session replaced or reset, stopping progress poll"
                );
                return PollOutcome::SessionChanged;
            }

            let completed = check_generation_progress(session, total);
            let previous = last.map_or(0, |snapshot| snapshot.completed);
            let snapshot = ProgressSnapshot::new(completed.max(previous), total);

            if last != Some(snapshot) {
                on_progress(snapshot);
                last = Some(snapshot);
            }

            if snapshot.is_complete() {
                return PollOutcome::Complete {
                    first_sample: session.sample_path(0),
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Folds driver events into a snapshot.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    snapshot: ProgressSnapshot,
}

impl ProgressTracker {
    pub fn new(total: u32) -> Self {
        Self {
            snapshot: ProgressSnapshot::new(0, total),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot
    }

    /// Returns the new snapshot if the event moved progress.
    pub fn apply(&mut self, event: &SampleEvent) -> Option<ProgressSnapshot> {
        match event {
            SampleEvent::Started { .. } => return None,
            SampleEvent::Completed { .. } => self.snapshot.completed += 1,
            SampleEvent::Failed { .. } => self.snapshot.failed += 1,
        }
        Some(self.snapshot)
    }
}
