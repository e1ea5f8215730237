use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Restoration record for a target-side index or foreign key dropped before
/// bulk-load. The `updated_by` column doubles as the drop/restore guard.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "constraint_backup")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub job_id: String,
    pub table_name: String,
    pub constraint_type: String,
    pub constraint_name: String,
    pub definition: String,
    pub updated_by: String,
    pub dropped_at: Option<i64>,
    pub restored_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
