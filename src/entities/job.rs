use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Connection descriptor JSON; password redacted in logs
    pub source_config: String,
    pub target_config: String,
    /// Table-mapping document JSON
    pub mapping: String,
    pub status: String,
    pub priority: i32,
    pub chunk_size: i64,
    pub initial_batch_size: i64,
    pub max_retries: i32,
    pub failure_threshold_percent: i32,
    pub drop_constraints: i64,
    pub validate: i64,
    pub optimization_method: Option<String>,
    pub total_tables: i32,
    pub total_chunks: i32,
    pub completed_chunks: i32,
    pub failed_chunks: i32,
    pub peak_memory_mb: Option<i64>,
    pub total_bytes: Option<i64>,
    pub avg_rows_per_sec: Option<f64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub auto_failed_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
