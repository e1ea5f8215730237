//! Decomposes a job into tables and deterministic pk-range chunks.
//!
//! Planning moves no data: it reads source statistics, validates the table
//! mapping against the target schema, and writes the whole plan to the
//! catalog in one transaction. A table that cannot be planned fails on its
//! own; the job only fails when every table does.

use std::collections::BTreeMap;

use sea_orm::DatabaseConnection;

use crate::adapter::{Adapter, SqlAdapter, TableDescription};
use crate::catalog::{self, PlannedChunk, PlannedTable};
use crate::errors::MigrateError;
use crate::model::{ChunkStatus, ConnectionDescriptor, JobStatus, TableMapping};

#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub job_id: String,
    pub planned_tables: usize,
    pub total_chunks: usize,
}

pub async fn plan_job(db: &DatabaseConnection, job_id: &str) -> Result<PlanSummary, MigrateError> {
    let job = catalog::get_job(db, job_id)
        .await?
        .ok_or_else(|| MigrateError::NotFound(format!("job {job_id}")))?;
    if job.status != JobStatus::Pending.as_str() {
        return Err(MigrateError::Other(format!(
            "job {job_id} has already been planned (status: {})",
            job.status
        )));
    }

    let source_desc: ConnectionDescriptor = serde_json::from_str(&job.source_config)?;
    let target_desc: ConnectionDescriptor = serde_json::from_str(&job.target_config)?;
    let mapping: BTreeMap<String, TableMapping> = serde_json::from_str(&job.mapping)?;

    catalog::update_job_status(db, job_id, JobStatus::Planning, None).await?;

    let source = match SqlAdapter::connect(&source_desc).await {
        Ok(adapter) => adapter,
        Err(err) => {
            catalog::update_job_status(db, job_id, JobStatus::Failed, Some(err.to_string())).await?;
            return Err(err.into());
        }
    };
    let target = match SqlAdapter::connect(&target_desc).await {
        Ok(adapter) => adapter,
        Err(err) => {
            catalog::update_job_status(db, job_id, JobStatus::Failed, Some(err.to_string())).await?;
            return Err(err.into());
        }
    };

    let table_names: Vec<String> = if mapping.is_empty() {
        source.discover_tables().await?
    } else {
        mapping.keys().cloned().collect()
    };
    if table_names.is_empty() {
        catalog::update_job_status(db, job_id, JobStatus::Failed, Some("source has no tables".into()))
            .await?;
        return Err(MigrateError::Spec("source has no tables to migrate".into()));
    }

    let mut planned = Vec::with_capacity(table_names.len());
    for table_name in &table_names {
        let table_mapping = mapping.get(table_name).cloned().unwrap_or_default();
        let entry = plan_table(&source, &target, table_name, &table_mapping, job.chunk_size).await;
        match &entry {
            PlannedTable { status: ChunkStatus::Failed, last_error, .. } => {
                tracing::warn!(
                    table = %table_name,
                    reason = last_error.as_deref().unwrap_or("unknown"),
                    "Table failed planning"
                );
            }
            PlannedTable { chunks, total_rows, .. } => {
                tracing::info!(
                    table = %table_name,
                    rows = *total_rows,
                    chunks = chunks.len(),
                    "Planned table"
                );
            }
        }
        planned.push(entry);
    }

    let (planned_tables, total_chunks) = catalog::insert_tables_and_chunks(db, job_id, planned).await?;
    tracing::info!(job_id, planned_tables, total_chunks, "Planning complete");
    Ok(PlanSummary { job_id: job_id.to_string(), planned_tables, total_chunks })
}

async fn plan_table(
    source: &SqlAdapter,
    target: &SqlAdapter,
    table_name: &str,
    mapping: &TableMapping,
    chunk_size: i64,
) -> PlannedTable {
    let target_table = mapping.target_table_for(table_name);
    let base = PlannedTable {
        table_name: table_name.to_string(),
        target_table: target_table.clone(),
        pk_column: String::new(),
        total_rows: 0,
        status: ChunkStatus::Pending,
        last_error: None,
        chunks: vec![],
    };

    let description = match source.describe_table(table_name).await {
        Ok(d) => d,
        Err(err) => return failed(base, format!("cannot describe source table: {err}")),
    };
    let Some(pk) = description.chunkable_pk().map(str::to_string) else {
        return failed(base, "table has no single-column integer primary key".to_string());
    };

    if let Err(reason) = validate_mapping(&description, target, &target_table, mapping).await {
        return failed(base, reason);
    }

    let bounds = match source.pk_bounds(table_name, &pk).await {
        Ok(b) => b,
        Err(err) => return failed(base, format!("cannot read pk bounds: {err}")),
    };
    let row_count = description.row_count_estimate;

    // Empty tables are skipped outright so job counters stay honest
    let (Some((min_pk, max_pk)), true) = (bounds, row_count > 0) else {
        return PlannedTable {
            pk_column: pk,
            status: ChunkStatus::Completed,
            ..base
        };
    };

    let chunks = compute_chunk_ranges(min_pk, max_pk, row_count, chunk_size);
    PlannedTable {
        pk_column: pk,
        total_rows: row_count,
        chunks,
        ..base
    }
}

fn failed(base: PlannedTable, reason: String) -> PlannedTable {
    PlannedTable {
        status: ChunkStatus::Failed,
        last_error: Some(reason),
        ..base
    }
}

/// A NOT NULL target column without a default that no source column reaches
/// is a planner-time error; so is a mapped target column that does not
/// exist.
async fn validate_mapping(
    source_desc: &TableDescription,
    target: &SqlAdapter,
    target_table: &str,
    mapping: &TableMapping,
) -> Result<(), String> {
    let target_desc = target
        .describe_table(target_table)
        .await
        .map_err(|err| format!("cannot describe target table {target_table}: {err}"))?;

    let covered: Vec<String> = source_desc
        .columns
        .iter()
        .map(|c| mapping.target_column(&c.name))
        .collect();

    for mapped in mapping.column_mapping.values() {
        if !target_desc.columns.iter().any(|c| &c.name == mapped) {
            return Err(format!("mapped target column {mapped} does not exist in {target_table}"));
        }
    }

    for column in &target_desc.columns {
        if column.not_null && !column.has_default && !covered.contains(&column.name) {
            return Err(format!(
                "target column {}.{} is NOT NULL without default and has no source mapping",
                target_table, column.name
            ));
        }
    }
    Ok(())
}

/// Split `[min_pk, max_pk]` into `ceil(row_count / chunk_size)` ranges of
/// approximately equal pk width. Every range is half-open `[lo, hi)` except
/// the last, which closes at `max_pk`, so every row lands in exactly one
/// chunk. Deterministic in (table, pk_start, pk_end).
pub fn compute_chunk_ranges(
    min_pk: i64,
    max_pk: i64,
    row_count: i64,
    chunk_size: i64,
) -> Vec<PlannedChunk> {
    if row_count <= 0 || max_pk < min_pk {
        return vec![];
    }
    let chunk_size = chunk_size.max(1);
    let num_chunks = (row_count + chunk_size - 1) / chunk_size;
    if num_chunks <= 1 {
        return vec![PlannedChunk { pk_start: min_pk, pk_end: max_pk, pk_end_inclusive: true }];
    }

    let span = max_pk - min_pk;
    let width = ((span + num_chunks - 1) / num_chunks).max(1);

    let mut chunks = Vec::with_capacity(num_chunks as usize);
    let mut lo = min_pk;
    for i in 0..num_chunks {
        if lo > max_pk {
            break;
        }
        let last = i == num_chunks - 1 || lo + width > max_pk;
        if last {
            chunks.push(PlannedChunk { pk_start: lo, pk_end: max_pk, pk_end_inclusive: true });
            break;
        }
        chunks.push(PlannedChunk { pk_start: lo, pk_end: lo + width, pk_end_inclusive: false });
        lo += width;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_250k_rows_into_three_ranges() {
        let chunks = compute_chunk_ranges(1, 250_000, 250_000, 100_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], PlannedChunk { pk_start: 1, pk_end: 83_334, pk_end_inclusive: false });
        assert_eq!(chunks[1], PlannedChunk { pk_start: 83_334, pk_end: 166_667, pk_end_inclusive: false });
        assert_eq!(chunks[2], PlannedChunk { pk_start: 166_667, pk_end: 250_000, pk_end_inclusive: true });
    }

    #[test]
    fn small_table_is_a_single_closed_range() {
        let chunks = compute_chunk_ranges(10, 500, 400, 100_000);
        assert_eq!(chunks, vec![PlannedChunk { pk_start: 10, pk_end: 500, pk_end_inclusive: true }]);
    }

    #[test]
    fn empty_table_yields_no_chunks() {
        assert!(compute_chunk_ranges(0, 0, 0, 1000).is_empty());
        assert!(compute_chunk_ranges(10, 5, 100, 1000).is_empty());
    }

    #[test]
    fn ranges_cover_without_overlap() {
        for (min, max, rows, size) in [
            (1i64, 250_000i64, 250_000i64, 100_000i64),
            (7, 1_000_003, 800_000, 75_000),
            (0, 99, 100, 10),
            (5, 6, 2, 1),
        ] {
            let chunks = compute_chunk_ranges(min, max, rows, size);
            assert!(!chunks.is_empty());
            assert_eq!(chunks[0].pk_start, min);
            let last = chunks.last().unwrap();
            assert_eq!(last.pk_end, max);
            assert!(last.pk_end_inclusive);
            for pair in chunks.windows(2) {
                // Adjacent: next range starts exactly where this one ends
                assert_eq!(pair[0].pk_end, pair[1].pk_start);
                assert!(!pair[0].pk_end_inclusive);
            }
            for c in &chunks {
                assert!(c.pk_start <= c.pk_end);
            }
        }
    }

    #[test]
    fn planning_twice_is_deterministic() {
        let a = compute_chunk_ranges(1, 999_983, 750_000, 100_000);
        let b = compute_chunk_ranges(1, 999_983, 750_000, 100_000);
        assert_eq!(a, b);
    }
}
