use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per adaptive batch-size controller decision.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batch_size_history")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub job_id: String,
    pub worker_id: String,
    pub old_batch_size: i64,
    pub new_batch_size: i64,
    pub avg_latency_ms: i64,
    pub target_latency_ms: i64,
    pub reason: String,
    pub recorded_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
