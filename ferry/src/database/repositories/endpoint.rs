//! Endpoint repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::EndpointDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Endpoint repository trait.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    async fn get_endpoint(&self, id: &str) -> Result<EndpointDbModel>;
    async fn list_endpoints(&self) -> Result<Vec<EndpointDbModel>>;
    async fn create_endpoint(&self, endpoint: &EndpointDbModel) -> Result<()>;
    async fn update_limits(
        &self,
        id: &str,
        max_concurrent_transfers: u32,
        bandwidth_limit_kbps: Option<u64>,
    ) -> Result<()>;
}

/// SQLx implementation of EndpointRepository.
pub struct SqlxEndpointRepository {
    pool: SqlitePool,
}

impl SqlxEndpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndpointRepository for SqlxEndpointRepository {
    async fn get_endpoint(&self, id: &str) -> Result<EndpointDbModel> {
        sqlx::query_as::<_, EndpointDbModel>("SELECT * FROM endpoint WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Endpoint", id))
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointDbModel>> {
        let endpoints =
            sqlx::query_as::<_, EndpointDbModel>("SELECT * FROM endpoint ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(endpoints)
    }

    async fn create_endpoint(&self, endpoint: &EndpointDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO endpoint (id, name, kind, max_concurrent_transfers, bandwidth_limit_kbps, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.kind)
        .bind(endpoint.max_concurrent_transfers)
        .bind(endpoint.bandwidth_limit_kbps)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_limits(
        &self,
        id: &str,
        max_concurrent_transfers: u32,
        bandwidth_limit_kbps: Option<u64>,
    ) -> Result<()> {
        if max_concurrent_transfers == 0 {
            return Err(Error::validation(
                "max_concurrent_transfers must be at least 1",
            ));
        }
        let result = sqlx::query(
            "UPDATE endpoint SET max_concurrent_transfers = ?, bandwidth_limit_kbps = ?, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(max_concurrent_transfers))
        .bind(bandwidth_limit_kbps.map(|v| v as i64))
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Endpoint", id));
        }
        Ok(())
    }
}
