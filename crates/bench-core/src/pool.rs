use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// A unit of work submitted to a [`WorkerPool`].
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed set of worker tasks draining a short bounded queue.
///
/// `submit` waits when the queue is full, so a submitter can never grow the
/// backlog past `queue_capacity`.
pub struct WorkerPool {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|idx| {
                let receiver = receiver.clone();
                let worker_name = format!("{name}-{idx}");
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!("worker {} exiting", worker_name);
                })
            })
            .collect();

        Self {
            name,
            sender: Some(sender),
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a unit of work, waiting for queue space if necessary.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker pool {} is shut down", self.name))?;
        sender
            .send(Box::pin(job))
            .await
            .map_err(|_| anyhow::anyhow!("worker pool {} is shut down", self.name))
    }

    /// Stops accepting work and waits for queued and running jobs to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.sender.take();
        for worker in self.workers.drain(..) {
            worker.await?;
        }
        Ok(())
    }

    /// Stops every worker without waiting for in-flight jobs.
    pub fn abort(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_all_submitted_jobs() {
        let pool = WorkerPool::new("test", 4, 8);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let done = done.clone();
            pool.submit(async move {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap();
        }
        pool.shutdown().await.unwrap();

        assert_eq!(done.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently_up_to_pool_size() {
        let pool = WorkerPool::new("test", 3, 16);
        assert_eq!(pool.size(), 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::AcqRel);
            })
            .await
            .unwrap();
        }
        pool.shutdown().await.unwrap();

        assert_eq!(peak.load(Ordering::Acquire), 3);
    }
}
