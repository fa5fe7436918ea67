//! Throttle Controller: per-endpoint admission control.
//!
//! The unit of admission is one executor invocation against a destination
//! endpoint. A slot is taken right before the invocation and released right
//! after it, so a job with many files never holds more than its fair share of
//! an endpoint's `max_concurrent_transfers`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ThrottleConfig;
use crate::database::repositories::EndpointRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

/// Storage for live slot counts.
///
/// `try_acquire` must check `in_use < limit` and take the slot atomically.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Take a slot, returning its lease id, or `None` when the endpoint is full.
    async fn try_acquire(&self, endpoint_id: &str, limit: u32) -> Result<Option<String>>;
    async fn release(&self, endpoint_id: &str, lease_id: &str) -> Result<()>;
    /// Keep a lease alive. A no-op for stores without expiry.
    async fn renew(&self, endpoint_id: &str, lease_id: &str) -> Result<()>;
    async fn in_use(&self, endpoint_id: &str) -> Result<u32>;
}

/// In-process slot counts, for a single engine process.
#[derive(Default)]
pub struct MemorySlotStore {
    leases: DashMap<String, HashSet<String>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn try_acquire(&self, endpoint_id: &str, limit: u32) -> Result<Option<String>> {
        // The entry guard holds the shard lock for the check and the insert.
        let mut held = self.leases.entry(endpoint_id.to_string()).or_default();
        if held.len() >= limit as usize {
            return Ok(None);
        }
        let lease_id = uuid::Uuid::new_v4().to_string();
        held.insert(lease_id.clone());
        Ok(Some(lease_id))
    }

    async fn release(&self, endpoint_id: &str, lease_id: &str) -> Result<()> {
        if let Some(mut held) = self.leases.get_mut(endpoint_id) {
            held.remove(lease_id);
        }
        Ok(())
    }

    async fn renew(&self, _endpoint_id: &str, _lease_id: &str) -> Result<()> {
        Ok(())
    }

    async fn in_use(&self, endpoint_id: &str) -> Result<u32> {
        Ok(self
            .leases
            .get(endpoint_id)
            .map(|held| held.len() as u32)
            .unwrap_or(0))
    }
}

/// Slot leases in the `slot_lease` table, shared by every process using the
/// same database. Leases of crashed workers stop counting once they expire.
pub struct SqliteSlotStore {
    pool: SqlitePool,
    lease_ttl: Duration,
}

impl SqliteSlotStore {
    pub fn new(pool: SqlitePool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }

    fn ttl_ms(&self) -> i64 {
        self.lease_ttl.as_millis() as i64
    }
}

#[async_trait]
impl SlotStore for SqliteSlotStore {
    async fn try_acquire(&self, endpoint_id: &str, limit: u32) -> Result<Option<String>> {
        retry_on_sqlite_busy("slot_acquire", || async {
            let now = now_ms();
            sqlx::query("DELETE FROM slot_lease WHERE endpoint_id = ? AND expires_at <= ?")
                .bind(endpoint_id)
                .bind(now)
                .execute(&self.pool)
                .await?;

            let lease_id = uuid::Uuid::new_v4().to_string();
            // Count and insert in one statement so concurrent writers cannot
            // both see the last free slot.
            let result = sqlx::query(
                r#"
                INSERT INTO slot_lease (id, endpoint_id, expires_at)
                SELECT ?, ?, ?
                WHERE (
                    SELECT COUNT(*) FROM slot_lease WHERE endpoint_id = ? AND expires_at > ?
                ) < ?
                "#,
            )
            .bind(&lease_id)
            .bind(endpoint_id)
            .bind(now + self.ttl_ms())
            .bind(endpoint_id)
            .bind(now)
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await?;

            Ok((result.rows_affected() > 0).then_some(lease_id))
        })
        .await
    }

    async fn release(&self, _endpoint_id: &str, lease_id: &str) -> Result<()> {
        retry_on_sqlite_busy("slot_release", || async {
            sqlx::query("DELETE FROM slot_lease WHERE id = ?")
                .bind(lease_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn renew(&self, _endpoint_id: &str, lease_id: &str) -> Result<()> {
        sqlx::query("UPDATE slot_lease SET expires_at = ? WHERE id = ?")
            .bind(now_ms() + self.ttl_ms())
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn in_use(&self, endpoint_id: &str) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM slot_lease WHERE endpoint_id = ? AND expires_at > ?",
        )
        .bind(endpoint_id)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }
}

/// Events emitted by the throttle controller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThrottleEvent {
    /// A file had to wait because every slot of the endpoint was taken.
    Saturated { endpoint_id: String, limit: u32 },
    /// A slot was returned.
    Released { endpoint_id: String },
}

/// Outcome of waiting for a slot.
pub enum Admission {
    Granted(SlotGuard),
    Cancelled,
    /// No slot became free within the admission timeout.
    TimedOut,
}

/// The Throttle Controller service.
pub struct ThrottleController {
    store: Arc<dyn SlotStore>,
    endpoints: Arc<dyn EndpointRepository>,
    config: ThrottleConfig,
    /// endpoint id -> (limit, fetched at)
    limits: DashMap<String, (u32, Instant)>,
    event_tx: broadcast::Sender<ThrottleEvent>,
}

impl ThrottleController {
    pub fn new(
        store: Arc<dyn SlotStore>,
        endpoints: Arc<dyn EndpointRepository>,
        config: ThrottleConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store,
            endpoints,
            config,
            limits: DashMap::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThrottleEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// The endpoint's `max_concurrent_transfers`, cached briefly.
    pub async fn limit_for(&self, endpoint_id: &str) -> Result<u32> {
        if let Some(entry) = self.limits.get(endpoint_id) {
            let (limit, fetched_at) = *entry;
            if fetched_at.elapsed() < self.config.limit_cache_ttl() {
                return Ok(limit);
            }
        }
        let limit = self.endpoints.get_endpoint(endpoint_id).await?.slot_limit();
        self.limits
            .insert(endpoint_id.to_string(), (limit, Instant::now()));
        Ok(limit)
    }

    /// Forget a cached limit after the endpoint was edited.
    pub fn invalidate_limit(&self, endpoint_id: &str) {
        self.limits.remove(endpoint_id);
    }

    pub async fn in_use(&self, endpoint_id: &str) -> Result<u32> {
        self.store.in_use(endpoint_id).await
    }

    /// Take a slot without waiting.
    pub async fn try_acquire(self: &Arc<Self>, endpoint_id: &str) -> Result<Option<SlotGuard>> {
        let limit = self.limit_for(endpoint_id).await?;
        let lease = self.store.try_acquire(endpoint_id, limit).await?;
        Ok(lease.map(|lease_id| {
            trace!(endpoint_id = %endpoint_id, "Slot acquired");
            SlotGuard {
                controller: Arc::clone(self),
                endpoint_id: endpoint_id.to_string(),
                lease_id,
                released: false,
            }
        }))
    }

    /// Wait for a slot with capped exponential backoff.
    pub async fn acquire(
        self: &Arc<Self>,
        endpoint_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Admission> {
        let deadline = Instant::now() + self.config.admission_timeout();
        let max_backoff = Duration::from_millis(self.config.admission_max_backoff_ms.max(1));
        let mut backoff = Duration::from_millis(self.config.admission_initial_backoff_ms.max(1));
        let mut reported = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(Admission::Cancelled);
            }
            if let Some(guard) = self.try_acquire(endpoint_id).await? {
                return Ok(Admission::Granted(guard));
            }

            if !reported {
                let limit = self.limit_for(endpoint_id).await?;
                debug!(endpoint_id = %endpoint_id, limit, "Endpoint saturated, deferring transfer");
                let _ = self.event_tx.send(ThrottleEvent::Saturated {
                    endpoint_id: endpoint_id.to_string(),
                    limit,
                });
                reported = true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(endpoint_id = %endpoint_id, "Timed out waiting for a transfer slot");
                return Ok(Admission::TimedOut);
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % (backoff.as_millis() as u64 / 4 + 1));
            let wait = (backoff + jitter).min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Admission::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn release_lease(&self, endpoint_id: &str, lease_id: &str) {
        if let Err(e) = self.store.release(endpoint_id, lease_id).await {
            warn!(endpoint_id = %endpoint_id, error = %e, "Failed to release transfer slot");
            return;
        }
        trace!(endpoint_id = %endpoint_id, "Slot released");
        let _ = self.event_tx.send(ThrottleEvent::Released {
            endpoint_id: endpoint_id.to_string(),
        });
    }
}

/// A held slot. Released by [`SlotGuard::release`], or on drop.
pub struct SlotGuard {
    controller: Arc<ThrottleController>,
    endpoint_id: String,
    lease_id: String,
    released: bool,
}

impl SlotGuard {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub async fn renew(&self) -> Result<()> {
        self.controller
            .store
            .renew(&self.endpoint_id, &self.lease_id)
            .await
    }

    pub async fn release(mut self) {
        self.released = true;
        self.controller
            .release_lease(&self.endpoint_id, &self.lease_id)
            .await;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let controller = self.controller.clone();
        let endpoint_id = std::mem::take(&mut self.endpoint_id);
        let lease_id = std::mem::take(&mut self.lease_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    controller.release_lease(&endpoint_id, &lease_id).await;
                });
            }
            Err(_) => {
                warn!(endpoint_id = %endpoint_id, "Slot dropped outside a runtime; lease will expire");
            }
        }
    }
}
