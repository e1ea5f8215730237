//! Transactional catalog operations.
//!
//! The catalog is the single source of truth for jobs, tables, chunks,
//! worker presence, and the execution audit. Every state transition runs in
//! one transaction and recomputes the parent counters in the same unit of
//! work, so observers never see completed + failed exceed total.

use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, IntoActiveModel, NotSet, PaginatorTrait, QueryFilter, QueryOrder, Set, Statement,
    TransactionTrait,
};

use crate::entities::{self, batch_adjustment, chunk, execution_log, job, performance_metric, table, worker};
use crate::errors::MigrateError;
use crate::model::{ChunkStatus, JobSpec, JobStatus, ValidationStatus, WorkerStatus};
use crate::settings;

/// Error text stored on chunks reaped after heartbeat loss.
pub const HEARTBEAT_TIMEOUT_ERROR: &str = "heartbeat timeout";
/// Error text stored on chunks requeued after a row-count mismatch.
pub const VALIDATION_ERROR: &str = "row count validation failed";

const ERROR_MAX_LEN: usize = 1000;
const CLAIM_CANDIDATES: usize = 16;
const CHUNK_INSERT_BATCH: usize = 500;

pub async fn init(cfg: &settings::Catalog) -> Result<DatabaseConnection, MigrateError> {
    let db = Database::connect(&cfg.url).await?;
    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA foreign_keys = ON",
        ))
        .await?;
    }
    Ok(db)
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// `backoff(n) = min(base * 2^n, cap)` seconds.
pub fn backoff_secs(retry_count: i32, retry: &settings::Retry) -> i64 {
    let shift = retry_count.clamp(0, 30) as u32;
    retry
        .backoff_base_s
        .saturating_mul(1i64 << shift)
        .min(retry.backoff_cap_s)
}

fn truncate_error(msg: &str) -> String {
    if msg.len() <= ERROR_MAX_LEN {
        msg.to_string()
    } else {
        let mut end = ERROR_MAX_LEN;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg[..end].to_string()
    }
}

/// Rewrite `?` placeholders to `$n` for postgres.
pub(crate) fn rebind(backend: DbBackend, sql: &str) -> String {
    match backend {
        DbBackend::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut n = 0;
            for ch in sql.chars() {
                if ch == '?' {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                } else {
                    out.push(ch);
                }
            }
            out
        }
        _ => sql.to_string(),
    }
}

// ===== Job operations =====

pub async fn create_job(
    db: &DatabaseConnection,
    spec: &JobSpec,
    cfg: &settings::Settings,
) -> Result<job::Model, MigrateError> {
    let now = Utc::now().timestamp();
    let model = job::ActiveModel {
        id: Set(random_id()),
        source_config: Set(serde_json::to_string(&spec.source)?),
        target_config: Set(serde_json::to_string(&spec.target)?),
        mapping: Set(serde_json::to_string(&spec.tables)?),
        status: Set(JobStatus::Pending.as_str().to_string()),
        priority: Set(spec.priority.unwrap_or(100)),
        chunk_size: Set(spec.chunk_size.unwrap_or(cfg.planner.chunk_size)),
        initial_batch_size: Set(spec.batch_size.unwrap_or(cfg.worker.batch_size)),
        max_retries: Set(spec.max_retries.unwrap_or(cfg.retry.max_retries)),
        failure_threshold_percent: Set(spec
            .failure_threshold_percent
            .unwrap_or(cfg.supervisor.failure_threshold_percent)),
        drop_constraints: Set(if spec.drop_constraints { 1 } else { 0 }),
        validate: Set(if spec.validate { 1 } else { 0 }),
        optimization_method: Set(Some("bulk".to_string())),
        total_tables: Set(0),
        total_chunks: Set(0),
        completed_chunks: Set(0),
        failed_chunks: Set(0),
        peak_memory_mb: Set(None),
        total_bytes: Set(None),
        avg_rows_per_sec: Set(None),
        created_at: Set(now),
        started_at: Set(None),
        completed_at: Set(None),
        auto_failed_at: Set(None),
        last_error: Set(None),
    };
    let created = model.insert(db).await?;
    tracing::info!(job_id = %created.id, "Created migration job");
    Ok(created)
}

pub async fn get_job(db: &DatabaseConnection, job_id: &str) -> Result<Option<job::Model>, MigrateError> {
    Ok(entities::Job::find_by_id(job_id).one(db).await?)
}

pub async fn list_jobs(db: &DatabaseConnection) -> Result<Vec<job::Model>, MigrateError> {
    Ok(entities::Job::find()
        .order_by_desc(job::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn update_job_status(
    db: &DatabaseConnection,
    job_id: &str,
    status: JobStatus,
    error: Option<String>,
) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();
    let model = entities::Job::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    let mut active = model.into_active_model();
    active.status = Set(status.as_str().to_string());
    match status {
        JobStatus::Running => active.started_at = Set(Some(now)),
        JobStatus::Completed | JobStatus::Failed => active.completed_at = Set(Some(now)),
        _ => {}
    }
    if let Some(error) = error {
        active.last_error = Set(Some(truncate_error(&error)));
    }
    active.update(db).await?;
    Ok(())
}

pub async fn pause_job(db: &DatabaseConnection, job_id: &str) -> Result<(), MigrateError> {
    let model = entities::Job::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    let status = JobStatus::parse(&model.status);
    if matches!(status, Some(s) if s.is_terminal()) {
        return Err(MigrateError::Other(format!("job {job_id} is terminal")));
    }
    let mut active = model.into_active_model();
    active.status = Set(JobStatus::Paused.as_str().to_string());
    active.update(db).await?;
    tracing::info!(job_id, "Job paused; in-flight chunks will complete normally");
    Ok(())
}

pub async fn resume_job(db: &DatabaseConnection, job_id: &str) -> Result<(), MigrateError> {
    let model = entities::Job::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    if model.status != JobStatus::Paused.as_str() {
        return Err(MigrateError::Other(format!(
            "job {job_id} is not paused (status: {})",
            model.status
        )));
    }
    let next = if model.started_at.is_some() {
        JobStatus::Running
    } else {
        JobStatus::Pending
    };
    let mut active = model.into_active_model();
    active.status = Set(next.as_str().to_string());
    active.update(db).await?;
    tracing::info!(job_id, "Job resumed");
    Ok(())
}

// ===== Planner output =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub pk_start: i64,
    pub pk_end: i64,
    pub pk_end_inclusive: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedTable {
    pub table_name: String,
    pub target_table: String,
    pub pk_column: String,
    pub total_rows: i64,
    /// Completed for empty tables (skipped), failed for unplannable ones
    pub status: ChunkStatus,
    pub last_error: Option<String>,
    pub chunks: Vec<PlannedChunk>,
}

/// Write the full planner output in a single transaction and set the job
/// totals. Chunks are never added after planning.
pub async fn insert_tables_and_chunks(
    db: &DatabaseConnection,
    job_id: &str,
    planned: Vec<PlannedTable>,
) -> Result<(usize, usize), MigrateError> {
    let txn = db.begin().await?;
    let now = Utc::now().timestamp();

    let job_model = entities::Job::find_by_id(job_id)
        .one(&txn)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    if job_model.status != JobStatus::Planning.as_str() {
        return Err(MigrateError::Other(format!(
            "job {job_id} is not in planning (status: {})",
            job_model.status
        )));
    }

    let mut total_tables = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_tables = 0usize;

    for planned_table in &planned {
        let table_id = random_id();
        let failed = planned_table.status == ChunkStatus::Failed;
        let completed = planned_table.status == ChunkStatus::Completed;
        let table_row = table::ActiveModel {
            id: Set(table_id.clone()),
            job_id: Set(job_id.to_string()),
            table_name: Set(planned_table.table_name.clone()),
            target_table: Set(planned_table.target_table.clone()),
            pk_column: Set(planned_table.pk_column.clone()),
            total_rows: Set(planned_table.total_rows),
            total_chunks: Set(planned_table.chunks.len() as i32),
            completed_chunks: Set(0),
            failed_chunks: Set(0),
            status: Set(planned_table.status.as_str().to_string()),
            last_error: Set(planned_table.last_error.as_deref().map(truncate_error)),
            created_at: Set(now),
            completed_at: Set(if completed { Some(now) } else { None }),
        };
        table_row.insert(&txn).await?;

        if failed {
            failed_tables += 1;
        } else {
            total_tables += 1;
        }

        for batch in planned_table.chunks.chunks(CHUNK_INSERT_BATCH) {
            let rows: Vec<chunk::ActiveModel> = batch
                .iter()
                .map(|c| chunk::ActiveModel {
                    id: Set(random_id()),
                    job_id: Set(job_id.to_string()),
                    table_id: Set(table_id.clone()),
                    table_name: Set(planned_table.table_name.clone()),
                    pk_start: Set(c.pk_start),
                    pk_end: Set(c.pk_end),
                    pk_end_inclusive: Set(if c.pk_end_inclusive { 1 } else { 0 }),
                    status: Set(ChunkStatus::Pending.as_str().to_string()),
                    retry_count: Set(0),
                    max_retries: Set(job_model.max_retries),
                    worker_id: Set(None),
                    next_retry_at: Set(None),
                    rows_processed: Set(None),
                    source_row_count: Set(None),
                    target_row_count: Set(None),
                    checksum: Set(None),
                    duration_ms: Set(None),
                    started_at: Set(None),
                    completed_at: Set(None),
                    last_heartbeat: Set(None),
                    last_error: Set(None),
                    validation_status: Set(ValidationStatus::Pending.as_str().to_string()),
                    batch_size_used: Set(None),
                    throughput_rows_per_sec: Set(None),
                    throughput_mb_per_sec: Set(None),
                    memory_peak_mb: Set(None),
                    insert_latency_ms: Set(None),
                    created_at: Set(now),
                })
                .collect();
            if !rows.is_empty() {
                entities::Chunk::insert_many(rows).exec(&txn).await?;
            }
        }
        total_chunks += planned_table.chunks.len();
    }

    let mut active = job_model.into_active_model();
    active.total_tables = Set(total_tables as i32);
    active.total_chunks = Set(total_chunks as i32);
    if !planned.is_empty() && failed_tables == planned.len() {
        active.status = Set(JobStatus::Failed.as_str().to_string());
        active.completed_at = Set(Some(now));
        active.last_error = Set(Some("planning failed for every table".to_string()));
    } else if total_chunks == 0 {
        // Nothing to move: all usable tables were empty
        active.status = Set(JobStatus::Completed.as_str().to_string());
        active.completed_at = Set(Some(now));
    }
    active.update(&txn).await?;

    txn.commit().await?;
    Ok((total_tables, total_chunks))
}

// ===== Claim =====

/// Atomically claim the next eligible chunk for `worker_id`.
///
/// Eligibility: status pending, retry timer elapsed, owning job dispatchable,
/// and the job below its running-chunk concurrency cap. Candidates are
/// ordered by (job priority, next_retry_at, created_at); postgres claimers
/// skip each other's row locks, sqlite serializes writers.
pub async fn claim_next_chunk(
    db: &DatabaseConnection,
    worker_id: &str,
    max_concurrent_per_job: i64,
) -> Result<Option<chunk::Model>, MigrateError> {
    // Transient sqlite write contention surfaces as busy/locked; back off and
    // retry rather than bubbling a claim failure to the worker loop.
    let mut attempts: u64 = 0;
    loop {
        match try_claim(db, worker_id, max_concurrent_per_job).await {
            Ok(result) => return Ok(result),
            Err(MigrateError::Db(err)) if attempts < 3 => {
                let msg = err.to_string().to_lowercase();
                if msg.contains("locked") || msg.contains("busy") {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempts)).await;
                    continue;
                }
                return Err(MigrateError::Db(err));
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_claim(
    db: &DatabaseConnection,
    worker_id: &str,
    max_concurrent_per_job: i64,
) -> Result<Option<chunk::Model>, MigrateError> {
    let backend = db.get_database_backend();
    let now = Utc::now().timestamp();
    let txn = db.begin().await?;

    let mut sql = format!(
        "SELECT c.id AS id, c.job_id AS job_id FROM migration_chunks c \
         INNER JOIN migration_jobs j ON j.id = c.job_id \
         WHERE c.status = 'pending' \
           AND (c.next_retry_at IS NULL OR c.next_retry_at <= ?) \
           AND j.status IN ('pending', 'planning', 'running') \
         ORDER BY j.priority ASC, c.next_retry_at ASC, c.created_at ASC \
         LIMIT {CLAIM_CANDIDATES}"
    );
    if backend == DbBackend::Postgres {
        sql.push_str(" FOR UPDATE OF c SKIP LOCKED");
    }
    let candidates = txn
        .query_all(Statement::from_sql_and_values(
            backend,
            rebind(backend, &sql),
            [now.into()],
        ))
        .await?;

    for row in candidates {
        let chunk_id: String = row.try_get("", "id")?;
        let job_id: String = row.try_get("", "job_id")?;

        let running = entities::Chunk::find()
            .filter(chunk::Column::JobId.eq(job_id.as_str()))
            .filter(chunk::Column::Status.eq(ChunkStatus::Running.as_str()))
            .count(&txn)
            .await?;
        if running as i64 >= max_concurrent_per_job {
            continue;
        }

        let claimed = entities::Chunk::update_many()
            .col_expr(chunk::Column::Status, Expr::value(ChunkStatus::Running.as_str()))
            .col_expr(chunk::Column::WorkerId, Expr::value(worker_id))
            .col_expr(chunk::Column::StartedAt, Expr::value(now))
            .col_expr(chunk::Column::LastHeartbeat, Expr::value(now))
            .filter(chunk::Column::Id.eq(chunk_id.as_str()))
            .filter(chunk::Column::Status.eq(ChunkStatus::Pending.as_str()))
            .exec(&txn)
            .await?;
        if claimed.rows_affected != 1 {
            continue;
        }

        // First dispatch flips the job to running
        entities::Job::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(job::Column::StartedAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id.as_str()))
            .filter(job::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Planning.as_str(),
            ]))
            .exec(&txn)
            .await?;

        upsert_worker(&txn, worker_id, WorkerStatus::Busy, Some(chunk_id.clone())).await?;

        let model = entities::Chunk::find_by_id(chunk_id.as_str())
            .one(&txn)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("chunk {chunk_id}")))?;
        txn.commit().await?;
        return Ok(Some(model));
    }

    txn.commit().await?;
    Ok(None)
}

// ===== Heartbeat =====

/// Refresh the heartbeat for a running chunk. Fails with `OwnershipLost`
/// when the chunk has been reaped or reassigned; the caller must treat that
/// as cancellation and stop all work on the chunk.
pub async fn heartbeat(
    db: &DatabaseConnection,
    worker_id: &str,
    chunk_id: &str,
    job_id: &str,
    memory_mb: i64,
    rows_per_sec: f64,
    current_batch_size: i64,
) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();
    let updated = entities::Chunk::update_many()
        .col_expr(chunk::Column::LastHeartbeat, Expr::value(now))
        .filter(chunk::Column::Id.eq(chunk_id))
        .filter(chunk::Column::WorkerId.eq(worker_id))
        .filter(chunk::Column::Status.eq(ChunkStatus::Running.as_str()))
        .exec(db)
        .await?;
    if updated.rows_affected == 0 {
        return Err(MigrateError::OwnershipLost(chunk_id.to_string()));
    }

    upsert_worker(db, worker_id, WorkerStatus::Busy, Some(chunk_id.to_string())).await?;

    performance_metric::ActiveModel {
        id: NotSet,
        job_id: Set(job_id.to_string()),
        worker_id: Set(worker_id.to_string()),
        rows_per_second: Set(rows_per_sec),
        mb_per_second: Set(0.0),
        memory_usage_mb: Set(memory_mb),
        insert_latency_ms: Set(0),
        current_batch_size: Set(current_batch_size),
        recorded_at: Set(now),
    }
    .insert(db)
    .await?;

    Ok(())
}

pub async fn upsert_worker<C: ConnectionTrait>(
    conn: &C,
    worker_id: &str,
    status: WorkerStatus,
    current_chunk_id: Option<String>,
) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();
    let model = worker::ActiveModel {
        worker_id: Set(worker_id.to_string()),
        last_seen: Set(now),
        current_chunk_id: Set(current_chunk_id),
        status: Set(status.as_str().to_string()),
    };
    entities::Worker::insert(model)
        .on_conflict(
            OnConflict::column(worker::Column::WorkerId)
                .update_columns([
                    worker::Column::LastSeen,
                    worker::Column::CurrentChunkId,
                    worker::Column::Status,
                ])
                .to_owned(),
        )
        .exec(conn)
        .await?;
    Ok(())
}

// ===== Chunk completion and failure =====

#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub rows_processed: i64,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub checksum: String,
    pub duration_ms: i64,
    pub batch_size_used: i64,
    pub throughput_rows_per_sec: f64,
    pub throughput_mb_per_sec: f64,
    pub memory_peak_mb: i64,
    pub insert_latency_ms: i64,
    pub total_bytes: i64,
    /// None when validation is disabled for the job
    pub validated: Option<bool>,
}

pub async fn complete_chunk(
    db: &DatabaseConnection,
    chunk_id: &str,
    outcome: ChunkOutcome,
) -> Result<(), MigrateError> {
    let txn = db.begin().await?;
    let now = Utc::now().timestamp();

    let model = entities::Chunk::find_by_id(chunk_id)
        .one(&txn)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("chunk {chunk_id}")))?;
    if model.status != ChunkStatus::Running.as_str() {
        return Err(MigrateError::OwnershipLost(chunk_id.to_string()));
    }

    let validation = match outcome.validated {
        Some(true) => ValidationStatus::Validated,
        Some(false) => ValidationStatus::Failed,
        None => ValidationStatus::Pending,
    };
    let attempt = model.retry_count + 1;
    let worker_id = model.worker_id.clone();
    let job_id = model.job_id.clone();
    let table_id = model.table_id.clone();
    let started_at = model.started_at;

    let mut active = model.into_active_model();
    active.status = Set(ChunkStatus::Completed.as_str().to_string());
    active.completed_at = Set(Some(now));
    active.rows_processed = Set(Some(outcome.rows_processed));
    active.source_row_count = Set(Some(outcome.source_row_count));
    active.target_row_count = Set(Some(outcome.target_row_count));
    active.checksum = Set(Some(outcome.checksum.clone()));
    active.duration_ms = Set(Some(outcome.duration_ms));
    active.batch_size_used = Set(Some(outcome.batch_size_used));
    active.throughput_rows_per_sec = Set(Some(outcome.throughput_rows_per_sec));
    active.throughput_mb_per_sec = Set(Some(outcome.throughput_mb_per_sec));
    active.memory_peak_mb = Set(Some(outcome.memory_peak_mb));
    active.insert_latency_ms = Set(Some(outcome.insert_latency_ms));
    active.validation_status = Set(validation.as_str().to_string());
    active.update(&txn).await?;

    execution_log::ActiveModel {
        id: NotSet,
        chunk_id: Set(chunk_id.to_string()),
        worker_id: Set(worker_id),
        attempt_number: Set(attempt),
        status: Set(ChunkStatus::Completed.as_str().to_string()),
        rows_processed: Set(Some(outcome.rows_processed)),
        source_row_count: Set(Some(outcome.source_row_count)),
        target_row_count: Set(Some(outcome.target_row_count)),
        duration_ms: Set(Some(outcome.duration_ms)),
        error_message: Set(None),
        started_at: Set(started_at),
        completed_at: Set(now),
    }
    .insert(&txn)
    .await?;

    aggregate_job_performance(&txn, &job_id, &outcome).await?;
    sync_counters(&txn, &job_id, &table_id).await?;
    txn.commit().await?;
    Ok(())
}

/// Fail a chunk through the retry policy. `terminal` exhausts the retry
/// budget immediately (auth failures, type mismatches, constraint
/// violations).
pub async fn fail_chunk(
    db: &DatabaseConnection,
    chunk_id: &str,
    error: &str,
    duration_ms: i64,
    terminal: bool,
    retry: &settings::Retry,
) -> Result<(), MigrateError> {
    let txn = db.begin().await?;
    let failed = fail_chunk_in(
        &txn,
        chunk_id,
        error,
        Some(duration_ms),
        terminal,
        Some(ChunkStatus::Running),
        retry,
    )
    .await?;
    txn.commit().await?;
    if !failed {
        // Reaped out from under the caller between execution and recording
        return Err(MigrateError::OwnershipLost(chunk_id.to_string()));
    }
    Ok(())
}

/// Returns false when the chunk is no longer in `expect_status` (someone
/// else transitioned it first); the transaction is left clean either way.
async fn fail_chunk_in<C: ConnectionTrait>(
    conn: &C,
    chunk_id: &str,
    error: &str,
    duration_ms: Option<i64>,
    terminal: bool,
    expect_status: Option<ChunkStatus>,
    retry: &settings::Retry,
) -> Result<bool, MigrateError> {
    let now = Utc::now().timestamp();
    let model = entities::Chunk::find_by_id(chunk_id)
        .one(conn)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("chunk {chunk_id}")))?;
    if let Some(expected) = expect_status {
        if model.status != expected.as_str() {
            return Ok(false);
        }
    }

    let attempt = model.retry_count + 1;
    let max_retries = model.max_retries;
    let worker_id = model.worker_id.clone();
    let job_id = model.job_id.clone();
    let table_id = model.table_id.clone();
    let started_at = model.started_at;
    let exhausted = terminal || attempt >= max_retries;

    let mut active = model.into_active_model();
    active.worker_id = Set(None);
    active.last_error = Set(Some(truncate_error(error)));
    active.completed_at = Set(Some(now));
    if let Some(duration) = duration_ms {
        active.duration_ms = Set(Some(duration));
    }
    if exhausted {
        active.status = Set(ChunkStatus::Failed.as_str().to_string());
        active.retry_count = Set(max_retries.max(attempt));
        active.next_retry_at = Set(None);
    } else {
        active.status = Set(ChunkStatus::Pending.as_str().to_string());
        active.retry_count = Set(attempt);
        active.next_retry_at = Set(Some(now + backoff_secs(attempt, retry)));
    }
    active.update(conn).await?;

    execution_log::ActiveModel {
        id: NotSet,
        chunk_id: Set(chunk_id.to_string()),
        worker_id: Set(worker_id),
        attempt_number: Set(attempt),
        status: Set(ChunkStatus::Failed.as_str().to_string()),
        rows_processed: Set(None),
        source_row_count: Set(None),
        target_row_count: Set(None),
        duration_ms: Set(duration_ms),
        error_message: Set(Some(truncate_error(error))),
        started_at: Set(started_at),
        completed_at: Set(now),
    }
    .insert(conn)
    .await?;

    sync_counters(conn, &job_id, &table_id).await?;
    Ok(true)
}

// ===== Reaper =====

#[derive(Debug, Clone)]
pub struct ReapedChunk {
    pub chunk_id: String,
    pub table_name: String,
    pub worker_id: Option<String>,
    pub retry_count: i32,
}

/// Fail every running chunk whose owner has stopped heart-beating (or that
/// has exceeded the hard timeout), routing each through the normal retry
/// policy. Dead worker registrations drop back to idle.
pub async fn reap_dead_workers(
    db: &DatabaseConnection,
    liveness_threshold_s: i64,
    hard_timeout_s: i64,
    retry: &settings::Retry,
) -> Result<Vec<ReapedChunk>, MigrateError> {
    let now = Utc::now().timestamp();
    let heartbeat_cutoff = now - liveness_threshold_s;
    let started_cutoff = now - hard_timeout_s;

    let stale = entities::Chunk::find()
        .filter(chunk::Column::Status.eq(ChunkStatus::Running.as_str()))
        .filter(
            sea_orm::Condition::any()
                .add(chunk::Column::LastHeartbeat.lt(heartbeat_cutoff))
                .add(chunk::Column::StartedAt.lt(started_cutoff)),
        )
        .all(db)
        .await?;

    let mut reaped = Vec::with_capacity(stale.len());
    for model in stale {
        let txn = db.begin().await?;
        let failed = fail_chunk_in(
            &txn,
            &model.id,
            HEARTBEAT_TIMEOUT_ERROR,
            None,
            false,
            Some(ChunkStatus::Running),
            retry,
        )
        .await?;
        txn.commit().await?;
        if failed {
            reaped.push(ReapedChunk {
                chunk_id: model.id,
                table_name: model.table_name,
                worker_id: model.worker_id,
                retry_count: model.retry_count + 1,
            });
        }
    }

    entities::Worker::update_many()
        .col_expr(worker::Column::Status, Expr::value(WorkerStatus::Idle.as_str()))
        .col_expr(worker::Column::CurrentChunkId, Expr::value(Option::<String>::None))
        .filter(worker::Column::LastSeen.lt(heartbeat_cutoff))
        .filter(worker::Column::Status.eq(WorkerStatus::Busy.as_str()))
        .exec(db)
        .await?;

    Ok(reaped)
}

// ===== Supervisor =====

#[derive(Debug, Clone)]
pub struct JobHealth {
    pub job_id: String,
    pub status: String,
    pub total_chunks: i32,
    pub completed_chunks: i32,
    pub failed_chunks: i32,
    pub failure_threshold_percent: i32,
    pub auto_failed_at: Option<i64>,
}

pub async fn query_job_health(
    db: &DatabaseConnection,
    job_id: &str,
) -> Result<JobHealth, MigrateError> {
    let model = entities::Job::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    Ok(JobHealth {
        job_id: model.id,
        status: model.status,
        total_chunks: model.total_chunks,
        completed_chunks: model.completed_chunks,
        failed_chunks: model.failed_chunks,
        failure_threshold_percent: model.failure_threshold_percent,
        auto_failed_at: model.auto_failed_at,
    })
}

pub async fn active_jobs(db: &DatabaseConnection) -> Result<Vec<job::Model>, MigrateError> {
    Ok(entities::Job::find()
        .filter(job::Column::Status.is_in([
            JobStatus::Pending.as_str(),
            JobStatus::Planning.as_str(),
            JobStatus::Running.as_str(),
        ]))
        .all(db)
        .await?)
}

/// Transition a job to failed because its failure ratio tripped the
/// threshold.
pub async fn auto_fail_job(db: &DatabaseConnection, job_id: &str) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();
    entities::Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Failed.as_str()))
        .col_expr(job::Column::AutoFailedAt, Expr::value(now))
        .col_expr(job::Column::CompletedAt, Expr::value(now))
        .filter(job::Column::Id.eq(job_id))
        .filter(job::Column::Status.is_in([
            JobStatus::Pending.as_str(),
            JobStatus::Planning.as_str(),
            JobStatus::Running.as_str(),
        ]))
        .exec(db)
        .await?;
    Ok(())
}

/// Requeue completed chunks whose row counts did not validate, through the
/// retry policy so repeated mismatch still exhausts to terminal failure.
pub async fn requeue_validation_failures(
    db: &DatabaseConnection,
    retry: &settings::Retry,
) -> Result<Vec<String>, MigrateError> {
    let candidates = entities::Chunk::find()
        .filter(chunk::Column::Status.eq(ChunkStatus::Completed.as_str()))
        .filter(chunk::Column::ValidationStatus.eq(ValidationStatus::Failed.as_str()))
        .all(db)
        .await?;

    let mut requeued = Vec::new();
    for model in candidates {
        let Some(job_model) = entities::Job::find_by_id(model.job_id.as_str()).one(db).await? else {
            continue;
        };
        if job_model.validate == 0 {
            continue;
        }
        if matches!(JobStatus::parse(&job_model.status), Some(s) if s.is_terminal()) {
            continue;
        }
        let txn = db.begin().await?;
        let failed = fail_chunk_in(
            &txn,
            &model.id,
            VALIDATION_ERROR,
            model.duration_ms,
            false,
            Some(ChunkStatus::Completed),
            retry,
        )
        .await?;
        if !failed {
            txn.commit().await?;
            continue;
        }
        // Back to an unvalidated state for the re-run
        entities::Chunk::update_many()
            .col_expr(
                chunk::Column::ValidationStatus,
                Expr::value(ValidationStatus::Pending.as_str()),
            )
            .filter(chunk::Column::Id.eq(model.id.as_str()))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        requeued.push(model.id);
    }
    Ok(requeued)
}

// ===== Operator actions =====

/// Operator reset for a terminal chunk: clear the retry budget and make the
/// range schedulable immediately. A failed owning job is administratively
/// resumed.
pub async fn retry_chunk(db: &DatabaseConnection, chunk_id: &str) -> Result<(), MigrateError> {
    let txn = db.begin().await?;
    let now = Utc::now().timestamp();

    let model = entities::Chunk::find_by_id(chunk_id)
        .one(&txn)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("chunk {chunk_id}")))?;
    if model.status != ChunkStatus::Failed.as_str() {
        return Err(MigrateError::Other(format!(
            "chunk {chunk_id} is not terminal (status: {})",
            model.status
        )));
    }
    let job_id = model.job_id.clone();
    let table_id = model.table_id.clone();

    let mut active = model.into_active_model();
    active.status = Set(ChunkStatus::Pending.as_str().to_string());
    active.retry_count = Set(0);
    active.next_retry_at = Set(Some(now));
    active.worker_id = Set(None);
    active.validation_status = Set(ValidationStatus::Pending.as_str().to_string());
    active.update(&txn).await?;

    // Explicit resume-administrative action on a failed job
    entities::Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Running.as_str()))
        .col_expr(job::Column::CompletedAt, Expr::value(Option::<i64>::None))
        .filter(job::Column::Id.eq(job_id.as_str()))
        .filter(job::Column::Status.eq(JobStatus::Failed.as_str()))
        .exec(&txn)
        .await?;

    entities::Table::update_many()
        .col_expr(table::Column::Status, Expr::value(ChunkStatus::Pending.as_str()))
        .col_expr(table::Column::CompletedAt, Expr::value(Option::<i64>::None))
        .filter(table::Column::Id.eq(table_id.as_str()))
        .filter(table::Column::Status.eq(ChunkStatus::Failed.as_str()))
        .exec(&txn)
        .await?;

    sync_counters(&txn, &job_id, &table_id).await?;
    txn.commit().await?;
    tracing::info!(chunk_id, "Chunk reset by operator");
    Ok(())
}

// ===== Readers =====

pub async fn get_tables(
    db: &DatabaseConnection,
    job_id: &str,
) -> Result<Vec<table::Model>, MigrateError> {
    Ok(entities::Table::find()
        .filter(table::Column::JobId.eq(job_id))
        .order_by_asc(table::Column::TableName)
        .all(db)
        .await?)
}

pub async fn get_chunks(
    db: &DatabaseConnection,
    job_id: &str,
) -> Result<Vec<chunk::Model>, MigrateError> {
    Ok(entities::Chunk::find()
        .filter(chunk::Column::JobId.eq(job_id))
        .order_by_asc(chunk::Column::TableName)
        .order_by_asc(chunk::Column::PkStart)
        .all(db)
        .await?)
}

pub async fn get_chunk(
    db: &DatabaseConnection,
    chunk_id: &str,
) -> Result<Option<chunk::Model>, MigrateError> {
    Ok(entities::Chunk::find_by_id(chunk_id).one(db).await?)
}

pub async fn get_execution_log(
    db: &DatabaseConnection,
    chunk_id: &str,
) -> Result<Vec<execution_log::Model>, MigrateError> {
    Ok(entities::ExecutionLog::find()
        .filter(execution_log::Column::ChunkId.eq(chunk_id))
        .order_by_asc(execution_log::Column::AttemptNumber)
        .all(db)
        .await?)
}

pub async fn record_batch_adjustment(
    db: &DatabaseConnection,
    record: batch_adjustment::ActiveModel,
) -> Result<(), MigrateError> {
    record.insert(db).await?;
    Ok(())
}

// ===== Advisory lock =====

/// Maintenance leadership. Postgres uses a session advisory lock; on other
/// back-ends a single maintenance node is assumed and the lock is trivially
/// held.
pub async fn try_advisory_lock(db: &DatabaseConnection, key: i64) -> Result<bool, MigrateError> {
    match db.get_database_backend() {
        DbBackend::Postgres => {
            let row = db
                .query_one(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    "SELECT pg_try_advisory_lock($1) AS locked",
                    [key.into()],
                ))
                .await?;
            Ok(row
                .and_then(|r| r.try_get::<bool>("", "locked").ok())
                .unwrap_or(false))
        }
        _ => Ok(true),
    }
}

// ===== Counter consistency =====

/// Recompute table and job counters from chunk statuses, then run the
/// completion check. Must be called inside the same transaction as the
/// chunk transition it reconciles.
async fn sync_counters<C: ConnectionTrait>(
    conn: &C,
    job_id: &str,
    table_id: &str,
) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();

    let table_total = entities::Chunk::find()
        .filter(chunk::Column::TableId.eq(table_id))
        .count(conn)
        .await? as i32;
    let table_completed = count_status(conn, chunk::Column::TableId, table_id, ChunkStatus::Completed).await?;
    let table_failed = count_status(conn, chunk::Column::TableId, table_id, ChunkStatus::Failed).await?;
    let table_running = count_status(conn, chunk::Column::TableId, table_id, ChunkStatus::Running).await?;

    if let Some(table_model) = entities::Table::find_by_id(table_id).one(conn).await? {
        // Planner-failed tables keep their recorded failure
        if table_model.status != ChunkStatus::Failed.as_str() || table_total > 0 {
            let status = if table_total > 0 && table_completed == table_total {
                ChunkStatus::Completed
            } else if table_total > 0 && table_completed + table_failed == table_total {
                ChunkStatus::Failed
            } else if table_running > 0 || table_completed > 0 || table_failed > 0 {
                ChunkStatus::Running
            } else {
                ChunkStatus::Pending
            };
            let completed_at = if status == ChunkStatus::Completed || status == ChunkStatus::Failed {
                table_model.completed_at.or(Some(now))
            } else {
                None
            };
            let mut active = table_model.into_active_model();
            active.completed_chunks = Set(table_completed);
            active.failed_chunks = Set(table_failed);
            active.status = Set(status.as_str().to_string());
            active.completed_at = Set(completed_at);
            active.update(conn).await?;
        }
    }

    let job_completed = count_status(conn, chunk::Column::JobId, job_id, ChunkStatus::Completed).await?;
    let job_failed = count_status(conn, chunk::Column::JobId, job_id, ChunkStatus::Failed).await?;

    let Some(job_model) = entities::Job::find_by_id(job_id).one(conn).await? else {
        return Ok(());
    };
    let total = job_model.total_chunks;
    let validate = job_model.validate == 1;
    let current = JobStatus::parse(&job_model.status);

    let mut active = job_model.into_active_model();
    active.completed_chunks = Set(job_completed);
    active.failed_chunks = Set(job_failed);

    // Completion check: all chunks terminal and none awaiting revalidation
    if total > 0 && job_completed + job_failed == total {
        let unresolved_validation = if validate {
            entities::Chunk::find()
                .filter(chunk::Column::JobId.eq(job_id))
                .filter(chunk::Column::Status.eq(ChunkStatus::Completed.as_str()))
                .filter(chunk::Column::ValidationStatus.eq(ValidationStatus::Failed.as_str()))
                .count(conn)
                .await?
        } else {
            0
        };
        if unresolved_validation == 0 {
            if let Some(status) = current {
                if !status.is_terminal() && status != JobStatus::Paused {
                    let outcome = if job_failed == 0 {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    active.status = Set(outcome.as_str().to_string());
                    active.completed_at = Set(Some(now));
                }
            }
        }
    }

    active.update(conn).await?;
    Ok(())
}

async fn count_status<C: ConnectionTrait>(
    conn: &C,
    scope: chunk::Column,
    id: &str,
    status: ChunkStatus,
) -> Result<i32, MigrateError> {
    Ok(entities::Chunk::find()
        .filter(scope.eq(id))
        .filter(chunk::Column::Status.eq(status.as_str()))
        .count(conn)
        .await? as i32)
}

async fn aggregate_job_performance<C: ConnectionTrait>(
    conn: &C,
    job_id: &str,
    outcome: &ChunkOutcome,
) -> Result<(), MigrateError> {
    let Some(job_model) = entities::Job::find_by_id(job_id).one(conn).await? else {
        return Ok(());
    };
    let peak = job_model
        .peak_memory_mb
        .unwrap_or(0)
        .max(outcome.memory_peak_mb);
    let bytes = job_model.total_bytes.unwrap_or(0) + outcome.total_bytes;
    let avg = match job_model.avg_rows_per_sec {
        Some(prev) => (prev + outcome.throughput_rows_per_sec) / 2.0,
        None => outcome.throughput_rows_per_sec,
    };
    let mut active = job_model.into_active_model();
    active.peak_memory_mb = Set(Some(peak));
    active.total_bytes = Set(Some(bytes));
    active.avg_rows_per_sec = Set(Some(avg));
    active.update(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionDescriptor;
    use migration::MigratorTrait;
    use tempfile::NamedTempFile;

    struct TestDb {
        connection: DatabaseConnection,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_path = temp_file.path().to_str().expect("Invalid temp file path");
            let db_url = format!("sqlite://{}?mode=rwc", db_path);

            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");
            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");

            Self { connection, _temp_file: temp_file }
        }

        fn connection(&self) -> &DatabaseConnection {
            &self.connection
        }
    }

    fn sqlite_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "sqlite://ignored".into(),
            port: None,
            database: "ignored".into(),
            username: String::new(),
            password: String::new(),
            tls: false,
            driver: Some("sqlite".into()),
        }
    }

    fn test_spec() -> JobSpec {
        JobSpec {
            source: sqlite_descriptor(),
            target: sqlite_descriptor(),
            tables: Default::default(),
            chunk_size: Some(1000),
            batch_size: None,
            max_retries: Some(3),
            failure_threshold_percent: None,
            priority: None,
            drop_constraints: false,
            validate: false,
        }
    }

    async fn plan_one_table(db: &DatabaseConnection, chunks: usize) -> (String, Vec<String>) {
        let cfg = settings::Settings::default();
        let job_model = create_job(db, &test_spec(), &cfg).await.expect("create job");
        update_job_status(db, &job_model.id, JobStatus::Planning, None)
            .await
            .expect("to planning");

        let planned = vec![PlannedTable {
            table_name: "users".into(),
            target_table: "users".into(),
            pk_column: "id".into(),
            total_rows: (chunks * 1000) as i64,
            status: ChunkStatus::Pending,
            last_error: None,
            chunks: (0..chunks)
                .map(|i| PlannedChunk {
                    pk_start: (i * 1000) as i64,
                    pk_end: ((i + 1) * 1000) as i64,
                    pk_end_inclusive: i == chunks - 1,
                })
                .collect(),
        }];
        insert_tables_and_chunks(db, &job_model.id, planned)
            .await
            .expect("insert plan");

        let chunk_ids = get_chunks(db, &job_model.id)
            .await
            .expect("chunks")
            .into_iter()
            .map(|c| c.id)
            .collect();
        (job_model.id, chunk_ids)
    }

    fn ok_outcome() -> ChunkOutcome {
        ChunkOutcome {
            rows_processed: 1000,
            source_row_count: 1000,
            target_row_count: 1000,
            checksum: "00:1000".into(),
            duration_ms: 25,
            batch_size_used: 500,
            throughput_rows_per_sec: 40_000.0,
            throughput_mb_per_sec: 4.0,
            memory_peak_mb: 64,
            insert_latency_ms: 12,
            total_bytes: 100_000,
            validated: Some(true),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = settings::Retry::default();
        assert_eq!(backoff_secs(0, &retry), 10);
        assert_eq!(backoff_secs(1, &retry), 20);
        assert_eq!(backoff_secs(2, &retry), 40);
        assert_eq!(backoff_secs(10, &retry), 600);
    }

    #[tokio::test]
    async fn claim_marks_chunk_running_and_job_running() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, _) = plan_one_table(db, 3).await;

        let claimed = claim_next_chunk(db, "w1", 8)
            .await
            .expect("claim")
            .expect("a chunk");
        assert_eq!(claimed.status, "running");
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.last_heartbeat.is_some());

        let job_model = get_job(db, &job_id).await.expect("get").expect("job");
        assert_eq!(job_model.status, "running");
        assert!(job_model.started_at.is_some());
    }

    #[tokio::test]
    async fn sequential_claims_hand_out_distinct_chunks_then_none() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_job_id, _) = plan_one_table(db, 3).await;

        let mut seen = std::collections::HashSet::new();
        for i in 0..3 {
            let claimed = claim_next_chunk(db, &format!("w{i}"), 8)
                .await
                .expect("claim")
                .expect("a chunk");
            assert!(seen.insert(claimed.id));
        }
        assert!(claim_next_chunk(db, "w9", 8).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn concurrency_cap_limits_running_chunks_per_job() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_job_id, _) = plan_one_table(db, 3).await;

        assert!(claim_next_chunk(db, "w1", 2).await.expect("claim").is_some());
        assert!(claim_next_chunk(db, "w2", 2).await.expect("claim").is_some());
        assert!(claim_next_chunk(db, "w3", 2).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn complete_chunk_keeps_counters_coherent() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, _) = plan_one_table(db, 2).await;

        let claimed = claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        complete_chunk(db, &claimed.id, ok_outcome()).await.expect("complete");

        let job_model = get_job(db, &job_id).await.unwrap().unwrap();
        assert_eq!(job_model.completed_chunks, 1);
        assert_eq!(job_model.failed_chunks, 0);
        assert_eq!(job_model.status, "running");

        let claimed = claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        complete_chunk(db, &claimed.id, ok_outcome()).await.expect("complete");

        let job_model = get_job(db, &job_id).await.unwrap().unwrap();
        assert_eq!(job_model.completed_chunks, 2);
        assert_eq!(job_model.status, "completed");
        assert!(job_model.completed_at.is_some());

        let tables = get_tables(db, &job_id).await.unwrap();
        assert_eq!(tables[0].status, "completed");
        assert_eq!(tables[0].completed_chunks, 2);
    }

    #[tokio::test]
    async fn failed_chunk_is_rescheduled_with_backoff() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_job_id, _) = plan_one_table(db, 1).await;
        let retry = settings::Retry::default();

        let claimed = claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        let before = Utc::now().timestamp();
        fail_chunk(db, &claimed.id, "connection lost: mid-copy", 100, false, &retry)
            .await
            .expect("fail");

        let model = get_chunk(db, &claimed.id).await.unwrap().unwrap();
        assert_eq!(model.status, "pending");
        assert_eq!(model.retry_count, 1);
        assert!(model.worker_id.is_none());
        let next_retry = model.next_retry_at.expect("retry scheduled");
        assert!(next_retry >= before + 20 && next_retry <= before + 22);

        // Not eligible until the timer elapses
        assert!(claim_next_chunk(db, "w2", 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_exhaustion_is_terminal_and_audited() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, chunk_ids) = plan_one_table(db, 1).await;
        let chunk_id = &chunk_ids[0];
        let retry = settings::Retry::default();

        for attempt in 1..=3 {
            // Make the chunk immediately eligible again
            entities::Chunk::update_many()
                .col_expr(chunk::Column::NextRetryAt, Expr::value(Option::<i64>::None))
                .filter(chunk::Column::Id.eq(chunk_id.as_str()))
                .exec(db)
                .await
                .unwrap();
            let claimed = claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
            assert_eq!(&claimed.id, chunk_id);
            fail_chunk(db, chunk_id, "constraint violation", 10, false, &retry)
                .await
                .unwrap();
            let model = get_chunk(db, chunk_id).await.unwrap().unwrap();
            assert_eq!(model.retry_count, attempt);
        }

        let model = get_chunk(db, chunk_id).await.unwrap().unwrap();
        assert_eq!(model.status, "failed");
        assert_eq!(model.retry_count, 3);
        assert!(model.next_retry_at.is_none());

        let job_model = get_job(db, &job_id).await.unwrap().unwrap();
        assert_eq!(job_model.failed_chunks, 1);
        assert_eq!(job_model.status, "failed");

        let log = get_execution_log(db, chunk_id).await.unwrap();
        assert_eq!(log.len(), 3);
        let attempts: Vec<i32> = log.iter().map(|entry| entry.attempt_number).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn terminal_error_exhausts_immediately() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_job_id, chunk_ids) = plan_one_table(db, 1).await;
        let retry = settings::Retry::default();

        claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        fail_chunk(db, &chunk_ids[0], "authentication failed", 5, true, &retry)
            .await
            .unwrap();

        let model = get_chunk(db, &chunk_ids[0]).await.unwrap().unwrap();
        assert_eq!(model.status, "failed");
        assert_eq!(model.retry_count, model.max_retries);
    }

    #[tokio::test]
    async fn reaper_recovers_stale_chunk() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_job_id, chunk_ids) = plan_one_table(db, 1).await;
        let retry = settings::Retry::default();

        claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();

        // Simulate a heartbeat 180s in the past against a 120s threshold
        let stale = Utc::now().timestamp() - 180;
        entities::Chunk::update_many()
            .col_expr(chunk::Column::LastHeartbeat, Expr::value(stale))
            .filter(chunk::Column::Id.eq(chunk_ids[0].as_str()))
            .exec(db)
            .await
            .unwrap();

        let before = Utc::now().timestamp();
        let reaped = reap_dead_workers(db, 120, 3600, &retry).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].chunk_id, chunk_ids[0]);

        let model = get_chunk(db, &chunk_ids[0]).await.unwrap().unwrap();
        assert_eq!(model.status, "pending");
        assert_eq!(model.retry_count, 1);
        assert!(model.worker_id.is_none());
        let next_retry = model.next_retry_at.unwrap();
        assert!(next_retry >= before + 20 && next_retry <= before + 22);

        let log = get_execution_log(db, &chunk_ids[0]).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].error_message.as_deref(), Some(HEARTBEAT_TIMEOUT_ERROR));
    }

    #[tokio::test]
    async fn heartbeat_reports_ownership_loss_after_reap() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, chunk_ids) = plan_one_table(db, 1).await;
        let retry = settings::Retry::default();

        claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        let stale = Utc::now().timestamp() - 500;
        entities::Chunk::update_many()
            .col_expr(chunk::Column::LastHeartbeat, Expr::value(stale))
            .filter(chunk::Column::Id.eq(chunk_ids[0].as_str()))
            .exec(db)
            .await
            .unwrap();
        reap_dead_workers(db, 120, 3600, &retry).await.unwrap();

        let result = heartbeat(db, "w1", &chunk_ids[0], &job_id, 32, 1000.0, 5000).await;
        assert!(matches!(result, Err(MigrateError::OwnershipLost(_))));
    }

    #[tokio::test]
    async fn paused_job_hands_out_no_chunks() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, _) = plan_one_table(db, 2).await;

        pause_job(db, &job_id).await.unwrap();
        assert!(claim_next_chunk(db, "w1", 8).await.unwrap().is_none());

        resume_job(db, &job_id).await.unwrap();
        assert!(claim_next_chunk(db, "w1", 8).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn operator_retry_resets_terminal_chunk_and_resumes_job() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (job_id, chunk_ids) = plan_one_table(db, 1).await;
        let retry = settings::Retry::default();

        claim_next_chunk(db, "w1", 8).await.unwrap().unwrap();
        fail_chunk(db, &chunk_ids[0], "constraint violation", 5, true, &retry)
            .await
            .unwrap();
        assert_eq!(get_job(db, &job_id).await.unwrap().unwrap().status, "failed");

        retry_chunk(db, &chunk_ids[0]).await.unwrap();

        let model = get_chunk(db, &chunk_ids[0]).await.unwrap().unwrap();
        assert_eq!(model.status, "pending");
        assert_eq!(model.retry_count, 0);

        let job_model = get_job(db, &job_id).await.unwrap().unwrap();
        assert_eq!(job_model.status, "running");
        assert_eq!(job_model.failed_chunks, 0);
    }

    #[tokio::test]
    async fn empty_plan_completes_job_immediately() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Settings::default();
        let job_model = create_job(db, &test_spec(), &cfg).await.unwrap();
        update_job_status(db, &job_model.id, JobStatus::Planning, None)
            .await
            .unwrap();

        let planned = vec![PlannedTable {
            table_name: "empty_table".into(),
            target_table: "empty_table".into(),
            pk_column: "id".into(),
            total_rows: 0,
            status: ChunkStatus::Completed,
            last_error: None,
            chunks: vec![],
        }];
        insert_tables_and_chunks(db, &job_model.id, planned).await.unwrap();

        let job_model = get_job(db, &job_model.id).await.unwrap().unwrap();
        assert_eq!(job_model.status, "completed");
        assert_eq!(job_model.total_chunks, 0);
    }
}
