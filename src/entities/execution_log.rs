use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only audit of chunk attempts. Rows are never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chunk_execution_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub chunk_id: String,
    pub worker_id: Option<String>,
    pub attempt_number: i32,
    pub status: String,
    pub rows_processed: Option<i64>,
    pub source_row_count: Option<i64>,
    pub target_row_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
