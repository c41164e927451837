use anyhow::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Work driven on a fixed period until the run is cancelled.
pub trait Periodic: Send + 'static {
    fn name(&self) -> &'static str;

    fn tick(&mut self) -> Result<()>;

    /// Called once after cancellation.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`Periodic`] job running on its own tokio task.
///
/// A failing tick is fatal: it is logged, the shared token is cancelled so
/// the rest of the run stops too, and the error is returned from
/// [`PeriodicTask::join`].
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

impl PeriodicTask {
    pub fn spawn<P: Periodic>(
        mut job: P,
        first_delay: Duration,
        period: Duration,
        token: CancellationToken,
    ) -> Self {
        let name = job.name();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + first_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = job.tick() {
                            error!("{} failed: {:#}", name, e);
                            token.cancel();
                            return Err(e);
                        }
                    }
                }
            }

            debug!("{} stopping", name);
            job.finish()
        });

        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        ticks: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl Periodic for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn tick(&mut self) -> Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if Some(n) == self.fail_at {
                anyhow::bail!("disk full");
            }
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn counting(fail_at: Option<usize>) -> (Counting, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let job = Counting {
            ticks: ticks.clone(),
            finished: finished.clone(),
            fail_at,
        };
        (job, ticks, finished)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_delay_then_every_period() {
        let (job, ticks, finished) = counting(None);
        let token = CancellationToken::new();
        let task = PeriodicTask::spawn(
            job,
            Duration::from_secs(60),
            Duration::from_secs(60),
            token.clone(),
        );

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ticks.load(Ordering::Acquire), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::Acquire), 1);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::Acquire), 3);

        token.cancel();
        task.join().await.unwrap();
        assert_eq!(finished.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_cancels_run() {
        let (job, ticks, finished) = counting(Some(3));
        let token = CancellationToken::new();
        let task = PeriodicTask::spawn(
            job,
            Duration::ZERO,
            Duration::from_secs(1),
            token.clone(),
        );

        let err = task.join().await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(token.is_cancelled());
        assert_eq!(ticks.load(Ordering::Acquire), 3);
        assert_eq!(finished.load(Ordering::Acquire), 0);
    }
}
