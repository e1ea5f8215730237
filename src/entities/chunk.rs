use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One pk range of one table; the unit of scheduling, retry, and validation.
/// Ranges are half-open `[pk_start, pk_end)` except the last chunk of a
/// table, which closes the range (`pk_end_inclusive = 1`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_chunks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub job_id: String,
    pub table_id: String,
    pub table_name: String,
    pub pk_start: i64,
    pub pk_end: i64,
    pub pk_end_inclusive: i64,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub worker_id: Option<String>,
    pub next_retry_at: Option<i64>,
    pub rows_processed: Option<i64>,
    pub source_row_count: Option<i64>,
    pub target_row_count: Option<i64>,
    pub checksum: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
    pub validation_status: String,
    pub batch_size_used: Option<i64>,
    pub throughput_rows_per_sec: Option<f64>,
    pub throughput_mb_per_sec: Option<f64>,
    pub memory_peak_mb: Option<i64>,
    pub insert_latency_ms: Option<i64>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
