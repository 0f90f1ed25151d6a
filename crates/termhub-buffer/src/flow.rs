//! Per-session flow control.
//!
//! A bounded queue sits between the transcript reader and the emulator.
//! Crossing the high watermark pauses ingestion, dropping below the low
//! watermark resumes it, and a pause that outlives `max_pause` is resolved
//! by discarding the queue.
//!
//! The state machine never reads the clock itself; callers pass `now`.

use std::{collections::VecDeque, time::{Duration, Instant}};

use serde::Serialize;

/// Flow-control tuning.
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Hard cap on queued lines.
    pub max_lines: usize,
    /// Fraction of `max_lines` above which ingestion pauses.
    pub high_watermark: f64,
    /// Fraction of `max_lines` below which ingestion resumes.
    pub low_watermark: f64,
    /// Longest a session may stay paused before its queue is dropped.
    pub max_pause: Duration,
    /// How often the owner should call [`FlowControl::check_timeout`].
    pub check_interval: Duration,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_lines: 10_000,
            high_watermark: 0.8,
            low_watermark: 0.5,
            max_pause: Duration::from_secs(5 * 60),
            check_interval: Duration::from_millis(100),
        }
    }
}

/// Counters for observing flow-control behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub pauses: u64,
    pub resumes: u64,
    pub forced_drains: u64,
    pub dropped_lines: u64,
    pub peak_depth: usize,
}

/// Bounded, watermark-driven queue.
#[derive(Debug)]
pub struct FlowControl<T> {
    config: FlowControlConfig,
    high_lines: usize,
    low_lines: usize,
    queue: VecDeque<T>,
    paused_since: Option<Instant>,
    stats: FlowStats,
}

impl<T> FlowControl<T> {
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(config: FlowControlConfig) -> Self {
        let max = config.max_lines.max(1);
        let high_lines =
            ((max as f64 * config.high_watermark).round() as usize).min(max.saturating_sub(1));
        let low_lines = ((max as f64 * config.low_watermark).round() as usize).min(high_lines);
        Self {
            config,
            high_lines,
            low_lines,
            queue: VecDeque::new(),
            paused_since: None,
            stats: FlowStats::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub const fn stats(&self) -> FlowStats {
        self.stats
    }

    /// Queue depth as a fraction of the cap.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        self.queue.len() as f64 / self.config.max_lines.max(1) as f64
    }

    /// How many more items the producer may push right now.
    ///
    /// Zero while paused. Otherwise just enough to cross the high
    /// watermark, so a batch pauses exactly at the crossing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if self.is_paused() {
            return 0;
        }
        (self.high_lines + 1)
            .min(self.config.max_lines)
            .saturating_sub(self.queue.len())
    }

    /// Enqueue an item.
    ///
    /// Returns `false` and drops the item if the queue is already at its cap.
    pub fn push(&mut self, item: T, now: Instant) -> bool {
        if self.queue.len() >= self.config.max_lines {
            self.stats.dropped_lines += 1;
            return false;
        }
        self.queue.push_back(item);
        self.stats.peak_depth = self.stats.peak_depth.max(self.queue.len());

        if !self.is_paused() && self.queue.len() > self.high_lines {
            self.paused_since = Some(now);
            self.stats.pauses += 1;
            tracing::debug!(depth = self.queue.len(), "Flow control paused ingestion");
        }
        true
    }

    /// Dequeue the oldest item, resuming ingestion once below the low
    /// watermark.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.queue.pop_front()?;
        if self.is_paused() && self.queue.len() < self.low_lines {
            self.paused_since = None;
            self.stats.resumes += 1;
            tracing::debug!(depth = self.queue.len(), "Flow control resumed ingestion");
        }
        Some(item)
    }

    /// Force-drain if the current pause has lasted `max_pause` or longer.
    ///
    /// Returns the number of discarded items when a drain happened.
    pub fn check_timeout(&mut self, now: Instant) -> Option<usize> {
        let since = self.paused_since?;
        if now.saturating_duration_since(since) < self.config.max_pause {
            return None;
        }
        let dropped = self.queue.len();
        self.queue.clear();
        self.paused_since = None;
        self.stats.forced_drains += 1;
        self.stats.resumes += 1;
        self.stats.dropped_lines += dropped as u64;
        Some(dropped)
    }
}
