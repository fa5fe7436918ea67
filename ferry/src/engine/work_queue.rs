//! Work queue carrying job ids from producers to the worker pool.
//!
//! Delivery is at-least-once with competing consumers: a dequeued item is
//! hidden from other consumers until it is acked, nacked, or its visibility
//! timeout lapses, after which it is delivered again. Each job id has at most
//! one queue item, so enqueueing is idempotent.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

/// A consumer's claim on one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: String,
    pub claim_id: String,
    /// How many times this item has been handed out, including this one.
    pub deliveries: u32,
}

impl Claim {
    fn new(job_id: impl Into<String>, deliveries: u32) -> Self {
        Self {
            job_id: job_id.into(),
            claim_id: uuid::Uuid::new_v4().to_string(),
            deliveries,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a job. Returns false when the job already has a queue item.
    async fn enqueue(&self, job_id: &str) -> Result<bool>;

    /// Claim the oldest visible item without waiting.
    async fn try_dequeue(&self) -> Result<Option<Claim>>;

    /// Remove a finished item. A stale claim is ignored.
    async fn ack(&self, claim: &Claim) -> Result<()>;

    /// Give an item back, visible again after `delay`.
    async fn nack(&self, claim: &Claim, delay: Duration) -> Result<()>;

    /// Push the claim's visibility deadline out by another timeout.
    /// Returns false when the claim has been lost to redelivery.
    async fn extend(&self, claim: &Claim) -> Result<bool>;

    /// Items in the queue, claimed or not.
    async fn depth(&self) -> Result<usize>;

    /// Woken when a local producer enqueues.
    fn notifier(&self) -> Arc<Notify>;

    /// Fallback wake-up for items from other processes or delayed items.
    fn poll_interval(&self) -> Duration;

    /// Block until an item can be claimed. Returns `None` on cancellation.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Claim>> {
        let notify = self.notifier();
        let poll = self.poll_interval();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(claim) = self.try_dequeue().await? {
                return Ok(Some(claim));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[derive(Debug)]
struct MemoryItem {
    seq: u64,
    visible_at: Instant,
    claim_id: Option<String>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    items: HashMap<String, MemoryItem>,
}

/// Single-process queue.
pub struct MemoryWorkQueue {
    state: Mutex<MemoryState>,
    visibility_timeout: Duration,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl MemoryWorkQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            visibility_timeout,
            poll_interval: Duration::from_millis(100),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, job_id: &str) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if state.items.contains_key(job_id) {
                return Ok(false);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.items.insert(
                job_id.to_string(),
                MemoryItem {
                    seq,
                    visible_at: Instant::now(),
                    claim_id: None,
                    deliveries: 0,
                },
            );
        }
        trace!(job_id = %job_id, "Enqueued job");
        self.notify.notify_one();
        Ok(true)
    }

    async fn try_dequeue(&self) -> Result<Option<Claim>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some((job_id, item)) = state
            .items
            .iter_mut()
            .filter(|(_, item)| item.visible_at <= now)
            .min_by_key(|(_, item)| item.seq)
        else {
            return Ok(None);
        };

        item.deliveries += 1;
        let claim = Claim::new(job_id.clone(), item.deliveries);
        item.claim_id = Some(claim.claim_id.clone());
        item.visible_at = now + self.visibility_timeout;
        Ok(Some(claim))
    }

    async fn ack(&self, claim: &Claim) -> Result<()> {
        let mut state = self.state.lock();
        let owned = state
            .items
            .get(&claim.job_id)
            .is_some_and(|item| item.claim_id.as_deref() == Some(claim.claim_id.as_str()));
        if owned {
            state.items.remove(&claim.job_id);
        }
        Ok(())
    }

    async fn nack(&self, claim: &Claim, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(item) = state.items.get_mut(&claim.job_id)
                && item.claim_id.as_deref() == Some(claim.claim_id.as_str())
            {
                item.claim_id = None;
                item.visible_at = Instant::now() + delay;
            }
        }
        if delay.is_zero() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn extend(&self, claim: &Claim) -> Result<bool> {
        let mut state = self.state.lock();
        match state.items.get_mut(&claim.job_id) {
            Some(item) if item.claim_id.as_deref() == Some(claim.claim_id.as_str()) => {
                item.visible_at = Instant::now() + self.visibility_timeout;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.state.lock().items.len())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Queue stored in the `work_queue` table, shared by every process using
/// the same database.
pub struct SqliteWorkQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl SqliteWorkQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
            notify: Arc::new(Notify::new()),
        }
    }

    fn visibility_ms(&self) -> i64 {
        self.visibility_timeout.as_millis() as i64
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, job_id: &str) -> Result<bool> {
        let inserted = retry_on_sqlite_busy("work_queue_enqueue", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO work_queue (job_id, enqueued_at, visible_at, claim_id, deliveries)
                VALUES (?, ?, ?, NULL, 0)
                "#,
            )
            .bind(job_id)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            trace!(job_id = %job_id, "Enqueued job");
            self.notify.notify_one();
        }
        Ok(inserted)
    }

    async fn try_dequeue(&self) -> Result<Option<Claim>> {
        retry_on_sqlite_busy("work_queue_claim", || async {
            let now = now_ms();
            let claim_id = uuid::Uuid::new_v4().to_string();
            let row: Option<(String, i64)> = sqlx::query_as(
                r#"
                UPDATE work_queue
                SET claim_id = ?, visible_at = ?, deliveries = deliveries + 1
                WHERE job_id = (
                    SELECT job_id FROM work_queue
                    WHERE visible_at <= ?
                    ORDER BY enqueued_at, job_id
                    LIMIT 1
                ) AND visible_at <= ?
                RETURNING job_id, deliveries
                "#,
            )
            .bind(&claim_id)
            .bind(now + self.visibility_ms())
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|(job_id, deliveries)| Claim {
                job_id,
                claim_id,
                deliveries: deliveries.max(0) as u32,
            }))
        })
        .await
    }

    async fn ack(&self, claim: &Claim) -> Result<()> {
        retry_on_sqlite_busy("work_queue_ack", || async {
            let result = sqlx::query("DELETE FROM work_queue WHERE job_id = ? AND claim_id = ?")
                .bind(&claim.job_id)
                .bind(&claim.claim_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                debug!(job_id = %claim.job_id, "Ack for a claim that is no longer held");
            }
            Ok(())
        })
        .await
    }

    async fn nack(&self, claim: &Claim, delay: Duration) -> Result<()> {
        retry_on_sqlite_busy("work_queue_nack", || async {
            sqlx::query(
                "UPDATE work_queue SET claim_id = NULL, visible_at = ? WHERE job_id = ? AND claim_id = ?",
            )
            .bind(now_ms() + delay.as_millis() as i64)
            .bind(&claim.job_id)
            .bind(&claim.claim_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        if delay.is_zero() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn extend(&self, claim: &Claim) -> Result<bool> {
        retry_on_sqlite_busy("work_queue_extend", || async {
            let result =
                sqlx::query("UPDATE work_queue SET visible_at = ? WHERE job_id = ? AND claim_id = ?")
                    .bind(now_ms() + self.visibility_ms())
                    .bind(&claim.job_id)
                    .bind(&claim.claim_id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn depth(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};

    const VISIBILITY: Duration = Duration::from_millis(80);

    async fn sqlite_queue() -> SqliteWorkQueue {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteWorkQueue::new(pool, VISIBILITY, Duration::from_millis(10))
    }

    async fn check_idempotent_enqueue(queue: &dyn WorkQueue) {
        assert!(queue.enqueue("a").await.unwrap());
        assert!(!queue.enqueue("a").await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    async fn check_competing_consumers(queue: &dyn WorkQueue) {
        queue.enqueue("a").await.unwrap();
        let claim = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(claim.job_id, "a");
        assert_eq!(claim.deliveries, 1);
        // Claimed items are invisible to other consumers.
        assert!(queue.try_dequeue().await.unwrap().is_none());
        queue.ack(&claim).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    async fn check_redelivery(queue: &dyn WorkQueue) {
        queue.enqueue("a").await.unwrap();
        let first = queue.try_dequeue().await.unwrap().unwrap();
        tokio::time::sleep(VISIBILITY * 2).await;

        let second = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(second.job_id, "a");
        assert_eq!(second.deliveries, 2);
        assert!(second.is_redelivery());

        // The first consumer lost its claim.
        assert!(!queue.extend(&first).await.unwrap());
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);
        queue.ack(&second).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    async fn check_nack_delay_and_order(queue: &dyn WorkQueue) {
        queue.enqueue("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue("b").await.unwrap();

        let a = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(a.job_id, "a");
        queue.nack(&a, Duration::from_secs(60)).await.unwrap();

        let b = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(b.job_id, "b");
        assert!(queue.try_dequeue().await.unwrap().is_none());
        queue.nack(&b, Duration::ZERO).await.unwrap();
        assert_eq!(queue.try_dequeue().await.unwrap().unwrap().job_id, "b");
    }

    #[tokio::test]
    async fn test_memory_queue() {
        check_idempotent_enqueue(&MemoryWorkQueue::new(VISIBILITY)).await;
        check_competing_consumers(&MemoryWorkQueue::new(VISIBILITY)).await;
        check_redelivery(&MemoryWorkQueue::new(VISIBILITY)).await;
        check_nack_delay_and_order(&MemoryWorkQueue::new(VISIBILITY)).await;
    }

    #[tokio::test]
    async fn test_sqlite_queue() {
        check_idempotent_enqueue(&sqlite_queue().await).await;
        check_competing_consumers(&sqlite_queue().await).await;
        check_redelivery(&sqlite_queue().await).await;
        check_nack_delay_and_order(&sqlite_queue().await).await;
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = Arc::new(MemoryWorkQueue::new(VISIBILITY));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("late").await.unwrap();

        let claim = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(claim.job_id, "late");
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_on_cancel() {
        let queue = MemoryWorkQueue::new(VISIBILITY);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.unwrap().is_none());
    }
}
