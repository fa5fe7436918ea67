//! Repository layer for database access.
//!
//! Each entity has an `async_trait` repository trait and a SQLx implementation,
//! so the engine can be tested against an in-memory database.

pub mod endpoint;
pub mod job;
pub mod processed_event;
pub mod template;
pub mod transfer;

pub use endpoint::*;
pub use job::*;
pub use processed_event::*;
pub use template::*;
pub use transfer::*;

use sqlx::SqlitePool;
use std::sync::Arc;

/// The repositories the engine components share.
#[derive(Clone)]
pub struct Repositories {
    pub endpoints: Arc<dyn EndpointRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub transfers: Arc<dyn TransferRepository>,
    pub processed_events: Arc<dyn ProcessedEventRepository>,
}

impl Repositories {
    /// SQLx-backed repositories on one pool.
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            endpoints: Arc::new(SqlxEndpointRepository::new(pool.clone())),
            templates: Arc::new(SqlxTemplateRepository::new(pool.clone())),
            jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
            transfers: Arc::new(SqlxTransferRepository::new(pool.clone())),
            processed_events: Arc::new(SqlxProcessedEventRepository::new(pool)),
        }
    }
}
