use crate::budget::BudgetPermit;
use crate::corpus::IdCorpus;
use crate::operation::{Classification, Operation};
use crate::pool::WorkerPool;
use crate::sender::OperationSender;
use crate::session::BenchmarkSession;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, info};

/// Submission loop for one operation.
///
/// Picks a random id, waits for a budget permit and hands one unit of work
/// to the operation's worker pool. Waiting on the budget is the only
/// backpressure: the loop never queues more work than it holds permits for.
pub struct OperationRunner {
    op: Operation,
    session: Arc<BenchmarkSession>,
    corpus: Arc<IdCorpus>,
    sender: Arc<dyn OperationSender>,
    pool: WorkerPool,
    rng: StdRng,
}

impl OperationRunner {
    pub fn new(
        op: Operation,
        session: Arc<BenchmarkSession>,
        corpus: Arc<IdCorpus>,
        sender: Arc<dyn OperationSender>,
    ) -> Result<Self> {
        if corpus.is_empty() {
            anyhow::bail!("cannot run {op}: id corpus is empty");
        }

        let config = session.config();
        let pool = WorkerPool::new(
            op.label().to_ascii_lowercase(),
            config.benchmark.max_concurrency,
            config.pool.queue_capacity,
        );
        let rng = match config.benchmark.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(op.index() as u64)),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            op,
            session,
            corpus,
            sender,
            pool,
            rng,
        })
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Submits work until the session shuts down. Work still in flight at
    /// that point is abandoned.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting {} runner with {} workers over {} ids",
            self.op,
            self.pool.size(),
            self.corpus.len()
        );
        while self.submit_next().await? {}
        self.pool.abort();
        info!("{} runner stopped", self.op);
        Ok(())
    }

    /// Submits exactly `attempts` units of work (fewer if the session shuts
    /// down first), then waits for them to finish.
    pub async fn run_attempts(mut self, attempts: u64) -> Result<()> {
        for _ in 0..attempts {
            if !self.submit_next().await? {
                break;
            }
        }
        self.pool.shutdown().await
    }

    /// Returns `false` once the session is shutting down.
    async fn submit_next(&mut self) -> Result<bool> {
        let token = self.session.shutdown_token();
        let budget = &self.session.budget(self.op);

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(false),
            permit = budget.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) if self.session.is_shutting_down() => return Ok(false),
                Err(e) => return Err(e),
            },
        };

        let id = match self.corpus.pick(&mut self.rng) {
            Some(id) => id.to_string(),
            None => anyhow::bail!("id corpus for {} is empty", self.op),
        };
        let job = execute(
            self.op,
            id,
            self.session.clone(),
            self.sender.clone(),
            permit,
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(false),
            submitted = self.pool.submit(job) => submitted.map(|_| true),
        }
    }
}

/// One unit of work: send, classify, record. Never fails; problems are
/// counted and logged at debug level.
async fn execute(
    op: Operation,
    id: String,
    session: Arc<BenchmarkSession>,
    sender: Arc<dyn OperationSender>,
    permit: BudgetPermit,
) {
    let stats = session.stats(op);

    match sender.send(op, &id).await {
        Ok(outcome) => {
            let classification = op.classify(outcome.status);
            if classification == Classification::Failure {
                debug!("Failure executing {} for {}: status {}", op, id, outcome.status);
            }
            stats.record(classification, outcome.latency_ms);
            session.record_outcome(op, &outcome);
        }
        Err(failure) => {
            debug!("Failure executing {} for {}: {}", op, id, failure);
            stats.record_failure();
            session.record_request_bytes(op, failure.request_bytes);
        }
    }

    drop(permit);
}
