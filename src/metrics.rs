//! Operation latency histograms for the controller.
//! Each named operation keeps a bounded window of durations; summaries report
//! p50/p95/p99 in microseconds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

const WINDOW: usize = 256;

/// Well-known operation names.
pub mod op_names {
    pub const CONNECT: &str = "connect";
    pub const LOAD: &str = "load";
    pub const RESET: &str = "reset_buffers";
    pub const PLAY_BLOCKING: &str = "play_blocking";
    pub const BUTTON_READ: &str = "button_read";
}

#[derive(Default)]
struct Window {
    values_us: Vec<f64>,
    next: usize,
    total: u64,
}

impl Window {
    fn push(&mut self, value_us: f64) {
        if self.values_us.len() < WINDOW {
            self.values_us.push(value_us);
        } else {
            self.values_us[self.next] = value_us;
        }
        self.next = (self.next + 1) % WINDOW;
        self.total += 1;
    }

    fn percentile(&self, sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn summary(&self) -> TimingSummary {
        let mut sorted = self.values_us.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        TimingSummary {
            p50_us: self.percentile(&sorted, 50.0),
            p95_us: self.percentile(&sorted, 95.0),
            p99_us: self.percentile(&sorted, 99.0),
            count: self.total,
        }
    }
}

/// Per-operation timings. Owned by the controller, so no locking.
#[derive(Default)]
pub struct OpTimings {
    windows: HashMap<&'static str, Window>,
}

impl OpTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op: &'static str, elapsed: Duration) {
        let value_us = elapsed.as_secs_f64() * 1e6;
        self.windows.entry(op).or_default().push(value_us);
        tracing::debug!(op, value_us, "op_timed");
    }

    /// Record the time since `started`.
    pub fn record_since(&mut self, op: &'static str, started: Instant) {
        self.record(op, started.elapsed());
    }

    pub fn summary(&self) -> HashMap<String, TimingSummary> {
        self.windows
            .iter()
            .map(|(&op, w)| (op.to_string(), w.summary()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn percentiles_over_window() {
        let mut t = OpTimings::new();
        for ms in 1..=100 {
            t.record(op_names::LOAD, Duration::from_millis(ms));
        }
        let s = &t.summary()[op_names::LOAD];
        assert_eq!(s.count, 100);
        assert_relative_eq!(s.p50_us, 51_000.0, epsilon = 1.0);
        assert_relative_eq!(s.p99_us, 99_000.0, epsilon = 1.0);
    }

    #[test]
    fn window_keeps_most_recent() {
        let mut t = OpTimings::new();
        for _ in 0..WINDOW {
            t.record(op_names::RESET, Duration::from_millis(500));
        }
        for _ in 0..WINDOW {
            t.record(op_names::RESET, Duration::from_millis(1));
        }
        let s = &t.summary()[op_names::RESET];
        assert_eq!(s.count, 2 * WINDOW as u64);
        assert_relative_eq!(s.p99_us, 1_000.0, epsilon = 1.0);
    }
}
