//! Worker runtime: claim one chunk at a time, execute it with a concurrent
//! heartbeat ticker, record the outcome, repeat. SIGINT drains: the current
//! chunk finishes, then the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sea_orm::{DatabaseConnection, EntityTrait};

use crate::batch::BatchController;
use crate::catalog;
use crate::entities::{chunk, job};
use crate::errors::MigrateError;
use crate::executor::{self, ExecProgress, ExecutionError};
use crate::model::WorkerStatus;
use crate::settings::Settings;

/// Stable worker identity: hostname plus a random suffix.
pub fn make_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}

pub struct Worker {
    db: DatabaseConnection,
    cfg: Settings,
    worker_id: String,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(db: DatabaseConnection, cfg: Settings, worker_id: Option<String>) -> Self {
        Self {
            db,
            cfg,
            worker_id: worker_id.unwrap_or_else(make_worker_id),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Flip this to drain the worker after its current chunk.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<(), MigrateError> {
        tracing::info!(worker_id = %self.worker_id, "Worker starting");
        catalog::upsert_worker(&self.db, &self.worker_id, WorkerStatus::Idle, None).await?;

        // The controller is per worker; it re-seeds when the job changes
        let mut controller: Option<(String, BatchController)> = None;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                catalog::upsert_worker(&self.db, &self.worker_id, WorkerStatus::Draining, None)
                    .await?;
                break;
            }

            let claimed = match catalog::claim_next_chunk(
                &self.db,
                &self.worker_id,
                self.cfg.worker.max_concurrent_per_job,
            )
            .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    // Catalog unavailable: back off and retry; transactional
                    // updates mean nothing is half-done
                    tracing::warn!(error = %err, "Claim failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let Some(chunk_model) = claimed else {
                tokio::time::sleep(idle_jitter()).await;
                continue;
            };

            self.process_chunk(chunk_model, &mut controller).await;
            catalog::upsert_worker(&self.db, &self.worker_id, WorkerStatus::Idle, None).await?;
        }

        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    async fn process_chunk(
        &self,
        chunk_model: chunk::Model,
        controller: &mut Option<(String, BatchController)>,
    ) {
        let chunk_id = chunk_model.id.clone();
        tracing::info!(
            worker_id = %self.worker_id,
            chunk_id = %chunk_id,
            table = %chunk_model.table_name,
            pk_start = chunk_model.pk_start,
            pk_end = chunk_model.pk_end,
            "Processing chunk"
        );

        let job_model = match catalog::get_job(&self.db, &chunk_model.job_id).await {
            Ok(Some(model)) => model,
            Ok(None) => {
                self.record_failure(&chunk_id, "owning job not found in catalog", 0, true).await;
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Cannot load job for claimed chunk");
                self.record_failure(&chunk_id, &err.to_string(), 0, false).await;
                return;
            }
        };
        let table_model = match crate::entities::Table::find_by_id(chunk_model.table_id.as_str())
            .one(&self.db)
            .await
        {
            Ok(Some(model)) => model,
            _ => {
                self.record_failure(&chunk_id, "owning table not found in catalog", 0, true).await;
                return;
            }
        };

        // Re-seed the controller when switching jobs
        match &mut *controller {
            Some((job_id, _)) if *job_id == job_model.id => {}
            other => {
                *other = Some((
                    job_model.id.clone(),
                    BatchController::new(job_model.initial_batch_size, &self.cfg.batch),
                ));
            }
        }
        let Some((_, ctl)) = controller.as_mut() else {
            return;
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(ExecProgress::new(ctl.current_batch()));
        let heartbeat = self.spawn_heartbeat(
            chunk_id.clone(),
            job_model.id.clone(),
            cancelled.clone(),
            progress.clone(),
        );

        let started = std::time::Instant::now();
        let result = executor::execute_chunk(
            &self.db,
            &self.worker_id,
            &chunk_model,
            &job_model,
            &table_model,
            ctl,
            &cancelled,
            &progress,
        )
        .await;

        heartbeat.abort();

        match result {
            Ok(outcome) => {
                let rows = outcome.rows_processed;
                match catalog::complete_chunk(&self.db, &chunk_id, outcome).await {
                    Ok(()) => {
                        tracing::info!(
                            worker_id = %self.worker_id,
                            chunk_id = %chunk_id,
                            rows,
                            duration_ms = started.elapsed().as_millis() as i64,
                            "Chunk completed"
                        );
                        self.maybe_restore_constraints(&job_model, &table_model).await;
                    }
                    Err(MigrateError::OwnershipLost(_)) => {
                        tracing::warn!(chunk_id = %chunk_id, "Chunk was reaped before completion");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, chunk_id = %chunk_id, "Failed to record completion");
                    }
                }
            }
            Err(ExecutionError::Cancelled) => {
                // Ownership lost: the reaper already rescheduled the range;
                // no further catalog updates for this chunk
                tracing::warn!(chunk_id = %chunk_id, "Chunk cancelled after ownership loss");
            }
            Err(ExecutionError::Failed { message, terminal }) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.record_failure(&chunk_id, &message, elapsed, terminal).await;
            }
        }
    }

    async fn record_failure(&self, chunk_id: &str, message: &str, duration_ms: i64, terminal: bool) {
        tracing::error!(
            worker_id = %self.worker_id,
            chunk_id,
            terminal,
            error = message,
            "Chunk failed"
        );
        match catalog::fail_chunk(&self.db, chunk_id, message, duration_ms, terminal, &self.cfg.retry)
            .await
        {
            Ok(()) => {}
            Err(MigrateError::OwnershipLost(_)) => {
                tracing::warn!(chunk_id, "Chunk was reaped before its failure was recorded");
            }
            Err(err) => {
                tracing::error!(error = %err, chunk_id, "Failed to record chunk failure");
            }
        }
    }

    async fn maybe_restore_constraints(&self, job_model: &job::Model, table_model: &crate::entities::table::Model) {
        if job_model.drop_constraints == 0 {
            return;
        }
        let table_done = match catalog::get_tables(&self.db, &job_model.id).await {
            Ok(tables) => tables
                .iter()
                .any(|t| t.id == table_model.id && t.status == "completed"),
            Err(_) => false,
        };
        if !table_done {
            return;
        }
        match executor::restore_constraints_if_table_done(
            &self.db,
            job_model,
            table_model,
            &self.worker_id,
        )
        .await
        {
            Ok(0) => {}
            Ok(restored) => {
                tracing::info!(table = %table_model.table_name, restored, "Restored constraints after final chunk");
            }
            Err(err) => {
                tracing::error!(error = %err, table = %table_model.table_name, "Constraint restore failed");
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        chunk_id: String,
        job_id: String,
        cancelled: Arc<AtomicBool>,
        progress: Arc<ExecProgress>,
    ) -> tokio::task::JoinHandle<()> {
        let db = self.db.clone();
        let worker_id = self.worker_id.clone();
        let period = Duration::from_secs(self.cfg.worker.heartbeat_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The claim already stamped the first heartbeat
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = catalog::heartbeat(
                    &db,
                    &worker_id,
                    &chunk_id,
                    &job_id,
                    progress.memory_mb(),
                    progress.rows_per_sec(),
                    progress.batch_size(),
                )
                .await;
                match result {
                    Ok(()) => {}
                    Err(MigrateError::OwnershipLost(_)) => {
                        tracing::warn!(chunk_id = %chunk_id, "Heartbeat lost chunk ownership, cancelling");
                        cancelled.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        // Transient catalog trouble: keep ticking, the reaper
                        // threshold is several periods away
                        tracing::warn!(error = %err, "Heartbeat failed");
                    }
                }
            }
        })
    }
}

fn idle_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(100..=500))
}
