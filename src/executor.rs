//! Per-chunk execution: stream the source range, project rows through the
//! table mapping, bulk-load the target batch by batch, and measure
//! everything the catalog wants to know.
//!
//! Each batch commits in its own target transaction, so a mid-chunk failure
//! leaves a clean prefix applied; the delete-then-copy preamble makes
//! re-execution of the same range idempotent.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use sea_orm::DatabaseConnection;

use crate::adapter::{Adapter, PkRange, RangeScanner, SqlAdapter};
use crate::batch::BatchController;
use crate::catalog::ChunkOutcome;
use crate::constraints;
use crate::entities::{chunk, job, table};
use crate::errors::{AdapterError, MigrateError};
use crate::metrics::PerformanceTracker;
use crate::model::{ConnectionDescriptor, TableMapping};
use crate::transform;

/// Shared view of an in-flight execution, read by the heartbeat ticker.
pub struct ExecProgress {
    rows: AtomicI64,
    memory_mb: AtomicI64,
    batch_size: AtomicI64,
    started: Instant,
}

impl ExecProgress {
    pub fn new(initial_batch: i64) -> Self {
        Self {
            rows: AtomicI64::new(0),
            memory_mb: AtomicI64::new(0),
            batch_size: AtomicI64::new(initial_batch),
            started: Instant::now(),
        }
    }

    pub fn rows(&self) -> i64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn memory_mb(&self) -> i64 {
        self.memory_mb.load(Ordering::Relaxed)
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size.load(Ordering::Relaxed)
    }

    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.rows() as f64 / secs
        }
    }

    fn update(&self, rows: i64, memory_mb: i64, batch_size: i64) {
        self.rows.store(rows, Ordering::Relaxed);
        self.memory_mb.store(memory_mb, Ordering::Relaxed);
        self.batch_size.store(batch_size, Ordering::Relaxed);
    }
}

/// Why a chunk did not complete.
#[derive(Debug)]
pub enum ExecutionError {
    /// Ownership was lost mid-flight; no catalog updates may follow.
    Cancelled,
    Failed { message: String, terminal: bool },
}

impl From<AdapterError> for ExecutionError {
    fn from(err: AdapterError) -> Self {
        ExecutionError::Failed { message: err.to_string(), terminal: err.is_terminal() }
    }
}

pub async fn execute_chunk(
    catalog_db: &DatabaseConnection,
    worker_id: &str,
    chunk: &chunk::Model,
    job: &job::Model,
    table_row: &table::Model,
    controller: &mut BatchController,
    cancelled: &AtomicBool,
    progress: &ExecProgress,
) -> Result<ChunkOutcome, ExecutionError> {
    let started = Instant::now();

    let source_desc: ConnectionDescriptor = serde_json::from_str(&job.source_config)
        .map_err(|e| config_error(format!("bad source descriptor: {e}")))?;
    let target_desc: ConnectionDescriptor = serde_json::from_str(&job.target_config)
        .map_err(|e| config_error(format!("bad target descriptor: {e}")))?;
    let mappings: std::collections::BTreeMap<String, TableMapping> =
        serde_json::from_str(&job.mapping)
            .map_err(|e| config_error(format!("bad table mapping: {e}")))?;
    let mapping = mappings.get(&chunk.table_name).cloned().unwrap_or_default();

    let source = SqlAdapter::connect(&source_desc).await?;
    let target = SqlAdapter::connect(&target_desc).await?;

    let pk = table_row.pk_column.as_str();
    let target_table = table_row.target_table.as_str();
    let range = PkRange {
        start: chunk.pk_start,
        end: chunk.pk_end,
        end_inclusive: chunk.pk_end_inclusive != 0,
    };

    if job.drop_constraints != 0 {
        constraints::ensure_dropped(catalog_db, &target, &job.id, target_table, worker_id)
            .await
            .map_err(|e| ExecutionError::Failed { message: e.to_string(), terminal: false })?;
    }

    // Idempotent re-copy: clear whatever a previous attempt left behind
    target.delete_range(target_table, pk, range).await?;

    let mut tracker = PerformanceTracker::new();
    let mut scanner = RangeScanner::new(&source, &chunk.table_name, pk, range);
    let mut pk_sum: u64 = 0;
    let mut avg_insert_latency: i64 = 0;

    while let Some(rows) = scanner.next_batch(controller.current_batch()).await? {
        if cancelled.load(Ordering::SeqCst) {
            return Err(ExecutionError::Cancelled);
        }

        let columns = transform::source_columns(&rows[0]);
        let target_cols = transform::target_columns(&columns, &mapping);
        let mut projected = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(value) = row.get(pk).and_then(|v| v.as_i64()) {
                pk_sum = pk_sum.wrapping_add(value as u64);
            }
            projected.push(transform::project_row(row, &columns, &mapping)?);
        }

        if cancelled.load(Ordering::SeqCst) {
            return Err(ExecutionError::Cancelled);
        }
        let report = target.bulk_insert(target_table, &target_cols, &projected).await?;
        tracker.record_batch(report.rows_inserted, report.bytes, report.latency_ms, controller.current_batch());
        avg_insert_latency = tracker.avg_latency_ms();
        progress.update(tracker.rows_processed(), tracker.peak_memory_mb(), controller.current_batch());

        if let Some(adjustment) = controller.observe(report.latency_ms) {
            tracing::info!(
                worker_id,
                old = adjustment.old_batch_size,
                new = adjustment.new_batch_size,
                avg_latency_ms = adjustment.avg_latency_ms,
                reason = %adjustment.reason,
                "Batch size adjusted"
            );
            if let Err(err) =
                crate::batch::record_adjustment(catalog_db, &job.id, worker_id, &adjustment).await
            {
                tracing::warn!(error = %err, "Failed to record batch adjustment");
            }
        }
    }

    if cancelled.load(Ordering::SeqCst) {
        return Err(ExecutionError::Cancelled);
    }

    let source_count = source.count_range(&chunk.table_name, pk, range).await?;
    let target_count = target.count_range(target_table, pk, range).await?;
    let (rows_per_sec, mb_per_sec) = tracker.throughput();

    let validated = if job.validate != 0 {
        Some(source_count == target_count)
    } else {
        None
    };
    if validated == Some(false) {
        tracing::error!(
            chunk_id = %chunk.id,
            source_count,
            target_count,
            "Row count mismatch after copy"
        );
    }

    Ok(ChunkOutcome {
        rows_processed: tracker.rows_processed(),
        source_row_count: source_count,
        target_row_count: target_count,
        checksum: format!("{pk_sum:016x}:{}", tracker.rows_processed()),
        duration_ms: started.elapsed().as_millis() as i64,
        batch_size_used: controller.current_batch(),
        throughput_rows_per_sec: rows_per_sec,
        throughput_mb_per_sec: mb_per_sec,
        memory_peak_mb: tracker.peak_memory_mb(),
        insert_latency_ms: avg_insert_latency,
        total_bytes: tracker.bytes_processed(),
        validated,
    })
}

/// Restore the table's constraints once its final chunk completes. Errors
/// are surfaced to the caller for logging; the copy itself has already
/// succeeded.
pub async fn restore_constraints_if_table_done(
    catalog_db: &DatabaseConnection,
    job: &job::Model,
    table_row: &table::Model,
    worker_id: &str,
) -> Result<usize, MigrateError> {
    if job.drop_constraints == 0 {
        return Ok(0);
    }
    let target_desc: ConnectionDescriptor = serde_json::from_str(&job.target_config)?;
    let target = SqlAdapter::connect(&target_desc).await?;
    constraints::restore_for_table(
        catalog_db,
        &target,
        &job.id,
        &table_row.target_table,
        worker_id,
    )
    .await
}

fn config_error(message: String) -> ExecutionError {
    ExecutionError::Failed { message, terminal: true }
}
