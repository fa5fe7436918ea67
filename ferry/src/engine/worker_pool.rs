//! Worker pool pulling job claims from the work queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::runner::JobRunner;
use super::work_queue::WorkQueue;

/// A fixed set of workers, each processing one job at a time.
pub struct WorkerPool {
    max_workers: usize,
    /// Workers currently inside a job.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, parent: &CancellationToken) -> Self {
        Self {
            max_workers: max_workers.max(1),
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: parent.child_token(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, queue: Arc<dyn WorkQueue>, runner: Arc<JobRunner>) {
        info!("Starting worker pool with {} workers", self.max_workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };

        for i in 0..self.max_workers {
            let queue = queue.clone();
            let runner = runner.clone();
            let token = self.cancellation_token.clone();
            let active = self.active_workers.clone();
            let error_backoff = queue.poll_interval();

            join_set.spawn(async move {
                debug!("Worker {} started", i);
                loop {
                    let claim = match queue.dequeue(&token).await {
                        Ok(Some(claim)) => claim,
                        Ok(None) => break,
                        Err(e) => {
                            error!(worker = i, error = %e, "Error dequeuing job");
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(error_backoff.max(Duration::from_millis(100))) => {}
                            }
                            continue;
                        }
                    };

                    debug!(
                        worker = i,
                        job_id = %claim.job_id,
                        deliveries = claim.deliveries,
                        "Worker picked up job"
                    );
                    active.fetch_add(1, Ordering::SeqCst);
                    runner.run_claim(claim, &token).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                debug!("Worker {} shutting down", i);
            });
        }
    }

    /// Stop the workers and wait for them to return.
    ///
    /// Jobs in flight see the cancellation, hand their claims back and stay
    /// `running` so they resume on the next start.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        info!("Worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_creation() {
        let root = CancellationToken::new();
        let pool = WorkerPool::new(0, &root);
        assert_eq!(pool.max_workers(), 1);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.is_running());
        root.cancel();
        assert!(!pool.is_running());
    }
}
