use crate::counters::CounterSet;
use crate::histogram::LatencyHistogram;
use crate::meter::RateMeter;
use crate::operation::Classification;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters, meters and latency reservoir for one operation.
#[derive(Debug)]
pub struct OperationStats {
    pub counters: CounterSet,
    pub throughput: RateMeter,
    pub failure_meter: RateMeter,
    pub latency: LatencyHistogram,
}

impl OperationStats {
    pub fn new(reservoir_size: usize) -> Self {
        Self {
            counters: CounterSet::new(),
            throughput: RateMeter::new(),
            failure_meter: RateMeter::new(),
            latency: LatencyHistogram::new(reservoir_size),
        }
    }

    /// Records a classified response. Conflicts count as successes but are
    /// left out of the latency distribution.
    pub fn record(&self, classification: Classification, latency_ms: u64) {
        match classification {
            Classification::Success => {
                self.throughput.mark();
                self.counters.record_success();
                self.latency.update(latency_ms);
            }
            Classification::Conflict => {
                self.throughput.mark();
                self.counters.record_success();
            }
            Classification::Failure => self.record_failure(),
        }
    }

    pub fn record_failure(&self) {
        self.failure_meter.mark();
        self.counters.record_failure();
    }

    /// Point-in-time view of this operation, `elapsed` being the run time.
    pub fn snapshot(&self, elapsed: Duration) -> OperationSnapshot {
        let total = self.counters.successes();
        let latency = self.latency.snapshot();
        OperationSnapshot {
            total,
            all_time_per_sec: per_second(total, elapsed),
            moving_avg_per_sec: (self.throughput.one_minute_rate() / 60.0) as u64,
            mean_ms: latency.mean() as u64,
            p75_ms: latency.p75() as u64,
            p95_ms: latency.p95() as u64,
        }
    }
}

/// Count divided by whole elapsed seconds, truncated. Zero before the first
/// second has passed.
pub fn per_second(count: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        return 0;
    }
    (count as f64 / secs) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub total: u64,
    pub all_time_per_sec: u64,
    pub moving_avg_per_sec: u64,
    pub mean_ms: u64,
    pub p75_ms: u64,
    pub p95_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_classifications() {
        let stats = OperationStats::new(16);

        stats.record(Classification::Success, 10);
        stats.record(Classification::Success, 30);
        stats.record(Classification::Conflict, 1000);
        stats.record(Classification::Failure, 5);

        assert_eq!(stats.counters.successes(), 3);
        assert_eq!(stats.counters.failures(), 1);
        assert_eq!(stats.throughput.count(), 3);
        assert_eq!(stats.failure_meter.count(), 1);
        assert_eq!(stats.latency.count(), 2);

        let snapshot = stats.snapshot(Duration::from_secs(3));
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.all_time_per_sec, 1);
        assert_eq!(snapshot.mean_ms, 20);
    }

    #[test]
    fn test_per_second() {
        assert_eq!(per_second(100, Duration::from_millis(500)), 0);
        assert_eq!(per_second(100, Duration::from_secs(10)), 10);
        assert_eq!(per_second(99, Duration::from_secs(10)), 9);
    }
}
