use crate::budget::ConcurrencyBudget;
use crate::config::Config;
use crate::meter::RateMeter;
use crate::operation::Operation;
use crate::sender::SendOutcome;
use crate::stats::OperationStats;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Budget and statistics owned on behalf of one operation.
#[derive(Debug)]
pub struct OperationState {
    pub operation: Operation,
    pub stats: OperationStats,
    pub budget: ConcurrencyBudget,
}

/// All mutable state of one benchmark run.
///
/// Built once, shared by `Arc` with every runner and periodic task. Nothing
/// here is ever replaced; runners and tasks only record into or atomically
/// adjust what the session owns.
#[derive(Debug)]
pub struct BenchmarkSession {
    config: Config,
    started: Instant,
    operations: [OperationState; 4],
    request_bytes: RateMeter,
    response_bytes: RateMeter,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Permits granted to each operation's budget
    concurrency: AtomicUsize,
    shutdown: CancellationToken,
}

impl BenchmarkSession {
    pub fn new(config: Config) -> Self {
        let initial = config.initial_concurrency();
        let reservoir_size = config.metrics.reservoir_size;
        let operations = Operation::ALL.map(|operation| OperationState {
            operation,
            stats: OperationStats::new(reservoir_size),
            budget: ConcurrencyBudget::new(initial),
        });

        Self {
            config,
            started: Instant::now(),
            operations,
            request_bytes: RateMeter::new(),
            response_bytes: RateMeter::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            concurrency: AtomicUsize::new(initial),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn operation(&self, op: Operation) -> &OperationState {
        &self.operations[op.index()]
    }

    pub fn operations(&self) -> &[OperationState] {
        &self.operations
    }

    pub fn stats(&self, op: Operation) -> &OperationStats {
        &self.operation(op).stats
    }

    pub fn budget(&self, op: Operation) -> &ConcurrencyBudget {
        &self.operation(op).budget
    }

    /// Permits currently granted to every operation.
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Acquire)
    }

    /// Grants `delta` more permits to every operation's budget and returns
    /// the new per-operation concurrency.
    pub fn raise_concurrency(&self, delta: usize) -> usize {
        if delta == 0 {
            return self.concurrency();
        }
        for state in &self.operations {
            state.budget.grant(delta);
        }
        let total = self.concurrency.fetch_add(delta, Ordering::AcqRel) + delta;
        info!("Raised concurrency by {} - new total per operation: {}", delta, total);
        total
    }

    /// Records the parts of an outcome shared across operations: byte rates
    /// and cache observations.
    pub fn record_outcome(&self, op: Operation, outcome: &SendOutcome) {
        self.record_request_bytes(op, outcome.request_bytes);
        self.stats(op)
            .counters
            .record_response_bytes(outcome.response_bytes);
        self.response_bytes.mark_n(outcome.response_bytes);
        match outcome.cache_hit {
            Some(true) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            Some(false) => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    /// Meters a payload handed to the client, whether or not a response
    /// came back.
    pub fn record_request_bytes(&self, op: Operation, bytes: u64) {
        if bytes > 0 {
            self.stats(op).counters.record_request_bytes(bytes);
            self.request_bytes.mark_n(bytes);
        }
    }

    pub fn request_bytes_meter(&self) -> &RateMeter {
        &self.request_bytes
    }

    pub fn response_bytes_meter(&self) -> &RateMeter {
        &self.response_bytes
    }

    /// Share of read-side responses served from cache, `None` before any
    /// read-side response arrived.
    pub fn cache_hit_pct(&self) -> Option<u64> {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return None;
        }
        Some(hits * 100 / total)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signals every runner and periodic task to stop.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down benchmark session");
        }
        self.shutdown.cancel();
        for state in &self.operations {
            state.budget.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_initial_budgets_follow_ramp_setting() {
        let session = BenchmarkSession::new(testing::config(8, 0));
        assert_eq!(session.concurrency(), 8);
        for state in session.operations() {
            assert_eq!(state.budget.granted(), 8);
        }

        let session = BenchmarkSession::new(testing::config(8, 4));
        assert_eq!(session.concurrency(), 1);
        assert_eq!(session.budget(Operation::Update).granted(), 1);
    }

    #[test]
    fn test_raise_concurrency_grants_every_budget() {
        let session = BenchmarkSession::new(testing::config(8, 4));
        assert_eq!(session.raise_concurrency(2), 3);
        assert_eq!(session.raise_concurrency(0), 3);
        for state in session.operations() {
            assert_eq!(state.budget.granted(), 3);
        }
    }

    #[test]
    fn test_record_outcome_tracks_bytes_and_cache() {
        let session = BenchmarkSession::new(testing::config(1, 0));
        assert_eq!(session.cache_hit_pct(), None);

        let hit = SendOutcome {
            status: 200,
            latency_ms: 5,
            request_bytes: 0,
            response_bytes: 100,
            cache_hit: Some(true),
        };
        let miss = SendOutcome {
            cache_hit: Some(false),
            ..hit
        };
        session.record_outcome(Operation::Read, &hit);
        session.record_outcome(Operation::Read, &miss);
        session.record_outcome(Operation::Search, &miss);
        session.record_outcome(
            Operation::Create,
            &SendOutcome {
                status: 201,
                latency_ms: 5,
                request_bytes: 50,
                response_bytes: 0,
                cache_hit: None,
            },
        );
        session.record_request_bytes(Operation::Create, 25);

        assert_eq!(session.cache_hit_pct(), Some(33));
        assert_eq!(session.response_bytes_meter().count(), 300);
        assert_eq!(session.request_bytes_meter().count(), 75);
        assert_eq!(session.stats(Operation::Read).counters.response_bytes(), 200);
        assert_eq!(session.stats(Operation::Create).counters.request_bytes(), 75);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token_and_budgets() {
        let session = BenchmarkSession::new(testing::config(1, 0));
        let token = session.shutdown_token();
        session.shutdown();
        assert!(token.is_cancelled());
        assert!(session.is_shutting_down());
        assert!(session.budget(Operation::Read).acquire().await.is_err());
    }
}
