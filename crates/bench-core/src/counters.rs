use std::sync::atomic::{AtomicU64, Ordering};

/// Exact, monotonically increasing counters for one operation.
///
/// Values are never decremented; every update is a single relaxed
/// `fetch_add`, so any number of workers may record concurrently.
#[derive(Debug, Default)]
pub struct CounterSet {
    successes: AtomicU64,
    failures: AtomicU64,
    request_bytes: AtomicU64,
    response_bytes: AtomicU64,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_bytes(&self, bytes: u64) {
        self.request_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_response_bytes(&self, bytes: u64) {
        self.response_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn request_bytes(&self) -> u64 {
        self.request_bytes.load(Ordering::Relaxed)
    }

    pub fn response_bytes(&self) -> u64 {
        self.response_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = CounterSet::new();
        assert_eq!(counters.successes(), 0);
        assert_eq!(counters.failures(), 0);
        assert_eq!(counters.request_bytes(), 0);
        assert_eq!(counters.response_bytes(), 0);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 10_000;

        let counters = CounterSet::new();
        counters.record_success();

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..PER_THREAD {
                        counters.record_success();
                        counters.record_failure();
                        counters.record_response_bytes(3);
                    }
                });
            }
        });

        assert_eq!(counters.successes(), 1 + THREADS * PER_THREAD);
        assert_eq!(counters.failures(), THREADS * PER_THREAD);
        assert_eq!(counters.response_bytes(), 3 * THREADS * PER_THREAD);
    }
}
