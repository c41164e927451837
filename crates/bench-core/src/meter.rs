//! Exponentially-weighted moving-average rate meter.
//!
//! Marks are accumulated in an atomic and folded into the 1, 5 and 15 minute
//! averages once every [`TICK_INTERVAL`]. Ticking happens lazily on the next
//! mark or read, so an idle meter costs nothing. Rates are smoothed
//! estimates that lag behind sudden changes in throughput; they are not
//! exact per-second counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often accumulated marks are folded into the moving averages.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Ewma {
    alpha: f64,
    /// Events per second
    rate: f64,
    initialized: bool,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp();
        Self {
            alpha,
            rate: 0.0,
            initialized: false,
        }
    }

    fn tick(&mut self, count: u64) {
        let instant_rate = count as f64 / TICK_INTERVAL.as_secs_f64();
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

#[derive(Debug)]
struct Averages {
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

#[derive(Debug)]
pub struct RateMeter {
    start: Instant,
    count: AtomicU64,
    uncounted: AtomicU64,
    /// Nanoseconds after `start` at which the last tick happened
    last_tick: AtomicU64,
    averages: Mutex<Averages>,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub(crate) fn starting_at(start: Instant) -> Self {
        Self {
            start,
            count: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            last_tick: AtomicU64::new(0),
            averages: Mutex::new(Averages {
                m1: Ewma::over_minutes(1.0),
                m5: Ewma::over_minutes(5.0),
                m15: Ewma::over_minutes(15.0),
            }),
        }
    }

    pub fn mark(&self) {
        self.mark_n(1);
    }

    pub fn mark_n(&self, n: u64) {
        self.mark_n_at(n, Instant::now());
    }

    pub(crate) fn mark_n_at(&self, n: u64, now: Instant) {
        self.tick_if_necessary(now);
        self.count.fetch_add(n, Ordering::Relaxed);
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Total number of marked events.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Decayed one-minute average, in events per minute.
    pub fn one_minute_rate(&self) -> f64 {
        self.one_minute_rate_at(Instant::now())
    }

    pub(crate) fn one_minute_rate_at(&self, now: Instant) -> f64 {
        self.tick_if_necessary(now);
        self.lock().m1.rate * 60.0
    }

    /// Decayed five-minute average, in events per minute.
    pub fn five_minute_rate(&self) -> f64 {
        self.tick_if_necessary(Instant::now());
        self.lock().m5.rate * 60.0
    }

    /// Decayed fifteen-minute average, in events per minute.
    pub fn fifteen_minute_rate(&self) -> f64 {
        self.tick_if_necessary(Instant::now());
        self.lock().m15.rate * 60.0
    }

    /// Smoothed per-second rate: the one-minute average divided by 60.
    pub fn per_second(&self) -> f64 {
        self.one_minute_rate() / 60.0
    }

    /// Events per second since the meter was created.
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Averages> {
        self.averages.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick_if_necessary(&self, now: Instant) {
        let interval = TICK_INTERVAL.as_nanos() as u64;
        let now_nanos = now.saturating_duration_since(self.start).as_nanos() as u64;
        let old_tick = self.last_tick.load(Ordering::Acquire);
        let age = now_nanos.saturating_sub(old_tick);
        if age < interval {
            return;
        }

        let new_tick = now_nanos - age % interval;
        if self
            .last_tick
            .compare_exchange(old_tick, new_tick, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller claimed these ticks.
            return;
        }

        let required = age / interval;
        let mut averages = self.lock();
        for _ in 0..required {
            let count = self.uncounted.swap(0, Ordering::Relaxed);
            averages.m1.tick(count);
            averages.m5.tick(count);
            averages.m15.tick(count);
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_is_zero_before_first_tick() {
        let start = Instant::now();
        let meter = RateMeter::starting_at(start);
        meter.mark_n_at(100, start);

        assert_eq!(meter.count(), 100);
        assert_eq!(meter.one_minute_rate_at(start + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_first_tick_uses_instant_rate() {
        let start = Instant::now();
        let meter = RateMeter::starting_at(start);
        // 50 events in the first tick window = 10 events/sec = 600/min
        meter.mark_n_at(50, start + Duration::from_secs(1));

        let rate = meter.one_minute_rate_at(start + TICK_INTERVAL);
        assert!((rate - 600.0).abs() < 1e-9, "rate: {}", rate);
    }

    #[test]
    fn test_rate_decays_when_idle() {
        let start = Instant::now();
        let meter = RateMeter::starting_at(start);
        meter.mark_n_at(50, start);

        let after_first = meter.one_minute_rate_at(start + TICK_INTERVAL);
        let after_minute = meter.one_minute_rate_at(start + Duration::from_secs(65));

        assert!(after_minute < after_first);
        // One minute of idle ticks decays the 1m average to ~1/e of its value.
        let expected = after_first * (-1.0f64).exp();
        assert!(
            (after_minute - expected).abs() < 1.0,
            "after_minute: {}, expected: {}",
            after_minute,
            expected
        );
    }

    #[test]
    fn test_rate_converges_on_steady_load() {
        let start = Instant::now();
        let meter = RateMeter::starting_at(start);
        meter.mark_n_at(5, start);
        meter.one_minute_rate_at(start + TICK_INTERVAL);

        // Steady 20 events/sec for five minutes.
        for step in 1..=60u64 {
            let at = start + TICK_INTERVAL * step as u32;
            meter.mark_n_at(100, at + Duration::from_millis(1));
        }
        let per_minute = meter.one_minute_rate_at(start + TICK_INTERVAL * 61);
        let per_second = per_minute / 60.0;

        assert!((per_second - 20.0).abs() < 0.5, "per_second: {}", per_second);
    }
}
