//! Transfer template database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::Result;

/// A follow-on destination fired after one file's primary transfer succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRule {
    #[serde(default)]
    pub name: Option<String>,
    pub destination_endpoint_id: String,
    /// Path expression resolved against the transferred file.
    pub destination_path: String,
}

impl ChainRule {
    pub fn new(destination_endpoint_id: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            name: None,
            destination_endpoint_id: destination_endpoint_id.into(),
            destination_path: destination_path.into(),
        }
    }
}

/// Transfer template database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TemplateDbModel {
    pub id: String,
    pub name: String,
    pub source_endpoint_id: String,
    pub source_path: String,
    pub file_pattern: String,
    pub destination_endpoint_id: String,
    /// Path expression for the primary destination.
    pub destination_path: String,
    /// JSON array of [`ChainRule`]
    pub chain_rules: String,
    pub verify_checksum: bool,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TemplateDbModel {
    pub fn new(
        name: impl Into<String>,
        source_endpoint_id: impl Into<String>,
        source_path: impl Into<String>,
        destination_endpoint_id: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source_endpoint_id: source_endpoint_id.into(),
            source_path: source_path.into(),
            file_pattern: String::new(),
            destination_endpoint_id: destination_endpoint_id.into(),
            destination_path: destination_path.into(),
            chain_rules: "[]".to_string(),
            verify_checksum: false,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = pattern.into();
        self
    }

    pub fn with_chain_rules(mut self, rules: &[ChainRule]) -> Result<Self> {
        self.chain_rules = serde_json::to_string(rules)?;
        Ok(self)
    }

    pub fn get_chain_rules(&self) -> Result<Vec<ChainRule>> {
        if self.chain_rules.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&self.chain_rules)?)
    }
}
