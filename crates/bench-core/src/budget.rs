use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting permit gate bounding how many units of work of one operation may
/// execute at once.
///
/// The ceiling only ever grows (see [`ConcurrencyBudget::grant`]). Holders
/// never exceed the most recently granted total because every unit of work
/// holds a [`BudgetPermit`] for its whole execution.
#[derive(Debug)]
pub struct ConcurrencyBudget {
    semaphore: Arc<Semaphore>,
    granted: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

/// Right to run one unit of work. Dropping it returns the permit.
#[derive(Debug)]
pub struct BudgetPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyBudget {
    pub fn new(initial: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            granted: AtomicUsize::new(initial),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits until a permit is free and takes it.
    ///
    /// Fails only after [`ConcurrencyBudget::close`].
    pub async fn acquire(&self) -> Result<BudgetPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("concurrency budget closed"))?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(BudgetPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<BudgetPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(BudgetPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Adds `n` permits and returns the new ceiling.
    pub fn grant(&self, n: usize) -> usize {
        if n == 0 {
            return self.granted();
        }
        let total = self.granted.fetch_add(n, Ordering::AcqRel) + n;
        self.semaphore.add_permits(n);
        total
    }

    /// Current ceiling.
    pub fn granted(&self) -> usize {
        self.granted.load(Ordering::Acquire)
    }

    /// Permits currently held by running units of work.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wakes every waiter with an error; later acquires fail immediately.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
