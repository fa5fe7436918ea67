//! Transfer template repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::TemplateDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<TemplateDbModel>;
    async fn list_active_templates(&self) -> Result<Vec<TemplateDbModel>>;
    async fn create_template(&self, template: &TemplateDbModel) -> Result<()>;
    async fn set_active(&self, id: &str, active: bool) -> Result<()>;
}

/// SQLx implementation of TemplateRepository.
pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn get_template(&self, id: &str) -> Result<TemplateDbModel> {
        sqlx::query_as::<_, TemplateDbModel>("SELECT * FROM transfer_template WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Template", id))
    }

    async fn list_active_templates(&self) -> Result<Vec<TemplateDbModel>> {
        let templates = sqlx::query_as::<_, TemplateDbModel>(
            "SELECT * FROM transfer_template WHERE active = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    async fn create_template(&self, template: &TemplateDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_template (
                id, name, source_endpoint_id, source_path, file_pattern,
                destination_endpoint_id, destination_path, chain_rules,
                verify_checksum, active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.source_endpoint_id)
        .bind(&template.source_path)
        .bind(&template.file_pattern)
        .bind(&template.destination_endpoint_id)
        .bind(&template.destination_path)
        .bind(&template.chain_rules)
        .bind(template.verify_checksum)
        .bind(template.active)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let result =
            sqlx::query("UPDATE transfer_template SET active = ?, updated_at = ? WHERE id = ?")
                .bind(active)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Template", id));
        }
        Ok(())
    }
}
