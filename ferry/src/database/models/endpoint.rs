//! Endpoint database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use transfer_executor::EndpointKind;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// A named storage location with a concurrency budget.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EndpointDbModel {
    pub id: String,
    pub name: String,
    /// JSON-encoded [`EndpointKind`]
    pub kind: String,
    pub max_concurrent_transfers: i64,
    pub bandwidth_limit_kbps: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EndpointDbModel {
    pub fn new(name: impl Into<String>, kind: &EndpointKind, max_concurrent_transfers: u32) -> Result<Self> {
        if max_concurrent_transfers == 0 {
            return Err(Error::validation(
                "max_concurrent_transfers must be at least 1",
            ));
        }
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: serde_json::to_string(kind)?,
            max_concurrent_transfers: i64::from(max_concurrent_transfers),
            bandwidth_limit_kbps: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_bandwidth_limit(mut self, kbps: u64) -> Self {
        self.bandwidth_limit_kbps = Some(kbps as i64);
        self
    }

    /// Decode the protocol description.
    pub fn endpoint_kind(&self) -> Result<EndpointKind> {
        Ok(serde_json::from_str(&self.kind)?)
    }

    /// Slot budget, never below one.
    pub fn slot_limit(&self) -> u32 {
        self.max_concurrent_transfers.clamp(1, i64::from(u32::MAX)) as u32
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit_kbps
            .filter(|kbps| *kbps > 0)
            .map(|kbps| kbps as u64)
    }
}
