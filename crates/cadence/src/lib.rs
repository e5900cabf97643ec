//! # Cadence
//!
//! Fixed-rate driver around a [`cadence_core::World`]:
//!
//! ```text
//! loop:
//!   ┌──────────────────────────────┐
//!   │ stop requested? ──► return   │
//!   │ world.run_frame()            │
//!   │ record FrameStats            │
//!   │ wait for next frame slot     │  (wakes early on stop)
//!   └──────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

use std::time::{Duration, Instant};

use cadence_core::{FrameReport, World, WorldResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

pub use cadence_core;

/// Configuration for the frame loop.
#[derive(Clone, Debug)]
pub struct FrameLoopConfig {
    /// Target frames per second. `0` runs frames back to back.
    pub target_fps: u32,
    /// Frames slower than this are logged as over budget.
    pub budget_warning: Duration,
    /// Stop after this many frames. `0` runs until stopped.
    pub max_frames: u64,
}

impl Default for FrameLoopConfig {
    fn default() -> Self {
        Self {
            target_fps: 60,
            budget_warning: Duration::from_millis(33),
            max_frames: 0,
        }
    }
}

impl FrameLoopConfig {
    /// Time slot of one frame, if the rate is capped.
    #[must_use]
    pub fn frame_time(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_secs(1) / self.target_fps)
    }
}

/// Timing of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number.
    pub frame: u64,
    /// Wall time of `run_frame` in microseconds.
    pub total_us: u64,
    /// Updates executed.
    pub updates: usize,
    /// Failed lock admissions.
    pub retries: usize,
    /// Entities migrated at commit.
    pub migrated: usize,
    /// Entities swept at commit.
    pub removed: usize,
}

impl From<&FrameReport> for FrameStats {
    fn from(report: &FrameReport) -> Self {
        Self {
            frame: report.frame,
            total_us: u64::try_from(report.elapsed.as_micros()).unwrap_or(u64::MAX),
            updates: report.pass.total_updates(),
            retries: report.pass.total_retries(),
            migrated: report.migrated,
            removed: report.removed,
        }
    }
}

/// Accumulator for frame statistics.
#[derive(Clone, Debug)]
pub struct FrameStatsAccumulator {
    /// Total frames recorded.
    pub frames_recorded: u64,
    /// Sum of total frame times.
    pub total_us_sum: u64,
    /// Min frame time.
    pub min_frame_us: u64,
    /// Max frame time.
    pub max_frame_us: u64,
    /// Frames that exceeded the budget.
    pub frames_over_budget: u64,
    /// Sum of lock admission retries.
    pub retries_sum: u64,
    budget_us: u64,
}

impl FrameStatsAccumulator {
    /// Creates an accumulator counting frames slower than `budget`.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            frames_recorded: 0,
            total_us_sum: 0,
            min_frame_us: u64::MAX,
            max_frame_us: 0,
            frames_over_budget: 0,
            retries_sum: 0,
            budget_us: u64::try_from(budget.as_micros()).unwrap_or(u64::MAX),
        }
    }

    /// Records a frame's statistics. Returns whether it was over budget.
    pub fn record(&mut self, stats: FrameStats) -> bool {
        self.frames_recorded += 1;
        self.total_us_sum += stats.total_us;
        self.retries_sum += u64::try_from(stats.retries).unwrap_or(u64::MAX);
        self.min_frame_us = self.min_frame_us.min(stats.total_us);
        self.max_frame_us = self.max_frame_us.max(stats.total_us);

        let over = stats.total_us > self.budget_us;
        if over {
            self.frames_over_budget += 1;
        }
        over
    }

    /// Returns average frame time in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_frame_ms(&self) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        (self.total_us_sum as f64 / self.frames_recorded as f64) / 1000.0
    }

    /// Returns the fraction of frames over budget.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn over_budget_ratio(&self) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        self.frames_over_budget as f64 / self.frames_recorded as f64
    }

    /// Logs a summary at info level.
    pub fn log_summary(&self) {
        tracing::info!(
            frames = self.frames_recorded,
            avg_ms = format_args!("{:.3}", self.avg_frame_ms()),
            min_us = if self.frames_recorded == 0 { 0 } else { self.min_frame_us },
            max_us = self.max_frame_us,
            over_budget = self.frames_over_budget,
            retries = self.retries_sum,
            "frame statistics"
        );
    }
}

impl Default for FrameStatsAccumulator {
    fn default() -> Self {
        Self::new(FrameLoopConfig::default().budget_warning)
    }
}

/// Requests a running [`FrameLoop`] to stop. Cloneable across threads.
#[derive(Clone, Debug)]
pub struct StopHandle {
    sender: Sender<()>,
}

impl StopHandle {
    /// Asks the loop to stop after the current frame.
    pub fn stop(&self) {
        // A full or disconnected channel means a stop is already pending
        // or the loop is gone.
        let _ = self.sender.try_send(());
    }
}

/// Fixed-rate frame driver.
#[derive(Debug)]
pub struct FrameLoop {
    config: FrameLoopConfig,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stats: FrameStatsAccumulator,
}

impl FrameLoop {
    /// Creates a loop.
    #[must_use]
    pub fn new(config: FrameLoopConfig) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        let stats = FrameStatsAccumulator::new(config.budget_warning);
        Self {
            config,
            stop_tx,
            stop_rx,
            stats,
        }
    }

    /// A handle that stops [`run`](Self::run) from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            sender: self.stop_tx.clone(),
        }
    }

    /// Runs frames until stopped or `max_frames` is reached. Returns the
    /// number of frames run.
    ///
    /// # Errors
    ///
    /// Propagates the first failing frame.
    pub fn run(&mut self, world: &mut World) -> WorldResult<u64> {
        let frame_time = self.config.frame_time();
        let mut frames = 0;
        let mut next_slot = Instant::now();

        loop {
            match self.stop_rx.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }

            let report = world.run_frame()?;
            let stats = FrameStats::from(&report);
            if self.stats.record(stats) {
                tracing::warn!(
                    frame = stats.frame,
                    elapsed_us = stats.total_us,
                    budget_us = self.config.budget_warning.as_micros(),
                    "frame exceeded budget"
                );
            }
            frames += 1;
            if self.config.max_frames != 0 && frames >= self.config.max_frames {
                break;
            }

            if let Some(frame_time) = frame_time {
                next_slot += frame_time;
                let now = Instant::now();
                if next_slot <= now {
                    // Behind schedule: do not try to catch up.
                    next_slot = now;
                    continue;
                }
                match self.stop_rx.recv_timeout(next_slot - now) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
                }
            }
        }

        tracing::debug!(frames, "frame loop stopped");
        Ok(frames)
    }

    /// Accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> &FrameStatsAccumulator {
        &self.stats
    }
}
