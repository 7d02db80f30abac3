//! Queue-to-reader latency statistics
//!
//! Samples accumulate into a "next" window; [`Latency::roll`] publishes it
//! as the current window and starts a fresh one, so a reporter can print
//! per-interval figures without locking the reader.

use serde::{Deserialize, Serialize};

/// Running min/max/mean/stddev over one window, in microseconds.
///
/// Mean and variance use Welford's online update.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl LatencyStats {
    pub fn record(&mut self, sample: f64) {
        if self.count == 0 || sample < self.min {
            self.min = sample;
        }
        if self.count == 0 || sample > self.max {
            self.max = sample;
        }

        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation; 0 below two samples
    pub fn stddev(&self) -> f64 {
        if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        }
    }
}

/// Two-window latency tracker
#[derive(Debug, Clone, Default)]
pub struct Latency {
    current: LatencyStats,
    next: LatencyStats,
}

impl Latency {
    pub fn on_sample(&mut self, sample: f64) {
        self.next.record(sample);
    }

    /// Last completed window
    pub fn current(&self) -> &LatencyStats {
        &self.current
    }

    /// Window still being filled
    pub fn pending(&self) -> &LatencyStats {
        &self.next
    }

    /// Publish the pending window and start a new one
    pub fn roll(&mut self) -> &LatencyStats {
        self.current = std::mem::take(&mut self.next);
        &self.current
    }
}
