use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Latency distribution over a sliding reservoir of the most recent samples.
///
/// Memory is bounded by the reservoir size; percentiles are computed over the
/// retained samples only, so they approximate recent behavior rather than the
/// whole run.
#[derive(Debug)]
pub struct LatencyHistogram {
    capacity: usize,
    /// Total samples ever recorded; also the next ring position
    recorded: AtomicU64,
    samples: Mutex<Vec<u64>>,
}

impl LatencyHistogram {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recorded: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Records one latency observation in milliseconds.
    pub fn update(&self, latency_ms: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let position = self.recorded.fetch_add(1, Ordering::Relaxed);
        if samples.len() < self.capacity {
            samples.push(latency_ms);
        } else {
            let slot = (position % self.capacity as u64) as usize;
            samples[slot] = latency_ms;
        }
    }

    /// Number of observations recorded over the lifetime of the histogram.
    pub fn count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut values = self
            .samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        values.sort_unstable();
        HistogramSnapshot { values }
    }
}

/// Sorted copy of the reservoir at one instant.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    values: Vec<u64>,
}

impl HistogramSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let sum: u128 = self.values.iter().map(|&v| v as u128).sum();
        sum as f64 / self.values.len() as f64
    }

    pub fn min(&self) -> u64 {
        self.values.first().copied().unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.values.last().copied().unwrap_or(0)
    }

    /// Interpolated quantile for `q` in `[0, 1]`.
    pub fn value(&self, q: f64) -> f64 {
        let q = q.clamp(0.0, 1.0);
        let n = self.values.len();
        if n == 0 {
            return 0.0;
        }

        let pos = q * (n as f64 + 1.0);
        if pos < 1.0 {
            return self.values[0] as f64;
        }
        if pos >= n as f64 {
            return self.values[n - 1] as f64;
        }

        let idx = pos.floor() as usize;
        let lower = self.values[idx - 1] as f64;
        let upper = self.values[idx] as f64;
        lower + (pos - pos.floor()) * (upper - lower)
    }

    pub fn p75(&self) -> f64 {
        self.value(0.75)
    }

    pub fn p95(&self) -> f64 {
        self.value(0.95)
    }
}
