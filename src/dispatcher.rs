//! Maintenance control loops: the reaper and the failure supervisor.
//!
//! Both run as scheduled jobs on whichever node holds the catalog advisory
//! lock; everyone else's ticks are no-ops. Scheduling itself is
//! poll-and-claim against the catalog — there is no broker, and the claim
//! contract in `catalog` stays the single authority.

use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::catalog;
use crate::errors::MigrateError;
use crate::settings::Settings;

/// Advisory-lock key for maintenance leadership.
pub const MAINTENANCE_LOCK_KEY: i64 = 0x6d64_7276;

/// Start the reaper and supervisor tickers. The returned scheduler owns the
/// tasks; dropping it stops them.
pub async fn init_scheduler(
    db: DatabaseConnection,
    cfg: Settings,
) -> Result<JobScheduler, MigrateError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| MigrateError::Other(format!("Failed to create maintenance scheduler: {e}")))?;

    let reaper_db = db.clone();
    let reaper_cfg = cfg.clone();
    let reaper_schedule = every_seconds(cfg.supervisor.reaper_interval_s);
    let reaper_job = Job::new_async(reaper_schedule.as_str(), move |_uuid, _l| {
        let db = reaper_db.clone();
        let cfg = reaper_cfg.clone();
        Box::pin(async move {
            if let Err(err) = run_reaper(&db, &cfg).await {
                tracing::error!(error = %err, "Reaper tick failed");
            }
        })
    })
    .map_err(|e| MigrateError::Other(format!("Failed to create reaper job: {e}")))?;
    sched
        .add(reaper_job)
        .await
        .map_err(|e| MigrateError::Other(format!("Failed to add reaper job: {e}")))?;

    let sup_db = db.clone();
    let sup_cfg = cfg.clone();
    let sup_schedule = every_seconds(cfg.supervisor.tick_interval_s);
    let supervisor_job = Job::new_async(sup_schedule.as_str(), move |_uuid, _l| {
        let db = sup_db.clone();
        let cfg = sup_cfg.clone();
        Box::pin(async move {
            if let Err(err) = run_supervisor_tick(&db, &cfg).await {
                tracing::error!(error = %err, "Supervisor tick failed");
            }
        })
    })
    .map_err(|e| MigrateError::Other(format!("Failed to create supervisor job: {e}")))?;
    sched
        .add(supervisor_job)
        .await
        .map_err(|e| MigrateError::Other(format!("Failed to add supervisor job: {e}")))?;

    sched
        .start()
        .await
        .map_err(|e| MigrateError::Other(format!("Failed to start maintenance scheduler: {e}")))?;
    tracing::info!("Maintenance scheduler started (reaper + supervisor)");
    Ok(sched)
}

fn every_seconds(period_s: u64) -> String {
    format!("*/{} * * * * *", period_s.clamp(1, 59))
}

/// One reaper pass: recover chunks whose workers stopped heart-beating.
pub async fn run_reaper(db: &DatabaseConnection, cfg: &Settings) -> Result<usize, MigrateError> {
    if !catalog::try_advisory_lock(db, MAINTENANCE_LOCK_KEY).await? {
        return Ok(0);
    }
    let reaped = catalog::reap_dead_workers(
        db,
        cfg.supervisor.liveness_threshold_s,
        cfg.supervisor.hard_timeout_s,
        &cfg.retry,
    )
    .await?;
    for entry in &reaped {
        tracing::warn!(
            chunk_id = %entry.chunk_id,
            table = %entry.table_name,
            worker_id = entry.worker_id.as_deref().unwrap_or("unknown"),
            retry_count = entry.retry_count,
            "Reaped chunk after heartbeat loss"
        );
    }
    Ok(reaped.len())
}

/// One supervisor pass: escalate jobs whose failure ratio tripped the
/// threshold, and requeue completed chunks that failed validation.
pub async fn run_supervisor_tick(
    db: &DatabaseConnection,
    cfg: &Settings,
) -> Result<(), MigrateError> {
    if !catalog::try_advisory_lock(db, MAINTENANCE_LOCK_KEY).await? {
        return Ok(());
    }

    for job in catalog::active_jobs(db).await? {
        if job.total_chunks < cfg.supervisor.min_chunks_for_escalation {
            continue;
        }
        let failure_rate =
            job.failed_chunks as f64 / (job.total_chunks.max(1)) as f64 * 100.0;
        if failure_rate >= job.failure_threshold_percent as f64 {
            catalog::auto_fail_job(db, &job.id).await?;
            tracing::error!(
                job_id = %job.id,
                failed_chunks = job.failed_chunks,
                total_chunks = job.total_chunks,
                failure_rate = format!("{failure_rate:.2}"),
                threshold = job.failure_threshold_percent,
                "Job auto-failed: failure rate over threshold"
            );
        }
    }

    let requeued = catalog::requeue_validation_failures(db, &cfg.retry).await?;
    if !requeued.is_empty() {
        tracing::warn!(count = requeued.len(), "Requeued chunks after failed validation");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_clamp_into_cron_range() {
        assert_eq!(every_seconds(30), "*/30 * * * * *");
        assert_eq!(every_seconds(10), "*/10 * * * * *");
        assert_eq!(every_seconds(0), "*/1 * * * * *");
        assert_eq!(every_seconds(600), "*/59 * * * * *");
    }
}
