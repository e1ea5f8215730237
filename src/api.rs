//! Thin imperative API over the catalog, consumed by external surfaces
//! (REST, UI) that live outside this crate.

use sea_orm::DatabaseConnection;

use crate::catalog;
use crate::entities::{chunk, job, performance_metric, table};
use crate::errors::MigrateError;
use crate::metrics;
use crate::model::JobSpec;
use crate::settings::Settings;

pub struct Api {
    db: DatabaseConnection,
    cfg: Settings,
}

impl Api {
    pub fn new(db: DatabaseConnection, cfg: Settings) -> Self {
        Self { db, cfg }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create_job(&self, spec: &JobSpec) -> Result<job::Model, MigrateError> {
        catalog::create_job(&self.db, spec, &self.cfg).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<job::Model>, MigrateError> {
        catalog::list_jobs(&self.db).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<job::Model, MigrateError> {
        catalog::get_job(&self.db, job_id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))
    }

    pub async fn get_tables(&self, job_id: &str) -> Result<Vec<table::Model>, MigrateError> {
        catalog::get_tables(&self.db, job_id).await
    }

    pub async fn get_chunks(&self, job_id: &str) -> Result<Vec<chunk::Model>, MigrateError> {
        catalog::get_chunks(&self.db, job_id).await
    }

    pub async fn retry_chunk(&self, chunk_id: &str) -> Result<(), MigrateError> {
        catalog::get_chunk(&self.db, chunk_id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("chunk {chunk_id}")))?;
        catalog::retry_chunk(&self.db, chunk_id).await
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<(), MigrateError> {
        catalog::pause_job(&self.db, job_id).await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<(), MigrateError> {
        catalog::resume_job(&self.db, job_id).await
    }

    pub async fn metrics_series(
        &self,
        job_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<performance_metric::Model>, MigrateError> {
        metrics::metrics_series(&self.db, job_id, since).await
    }
}
