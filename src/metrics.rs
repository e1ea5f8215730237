//! Chunk-level performance tracking and catalog time-series readers.

use std::time::Instant;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::entities::{self, performance_metric};
use crate::errors::MigrateError;

/// Accumulates throughput, bytes, latency, and memory over one chunk
/// execution.
pub struct PerformanceTracker {
    started: Instant,
    rows_processed: i64,
    bytes_processed: i64,
    peak_memory_mb: i64,
    latencies: Vec<i64>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rows_processed: 0,
            bytes_processed: 0,
            peak_memory_mb: 0,
            latencies: Vec::new(),
        }
    }

    pub fn record_batch(&mut self, rows: u64, bytes: i64, latency_ms: i64, batch_size: i64) {
        self.rows_processed += rows as i64;
        self.bytes_processed += bytes;
        self.latencies.push(latency_ms);
        // Resident memory is dominated by the in-flight batch buffer
        let batch_mb = (batch_size.saturating_mul(estimated_row_bytes(bytes, rows))) / (1024 * 1024);
        self.peak_memory_mb = self.peak_memory_mb.max(batch_mb.max(1));
    }

    pub fn rows_processed(&self) -> i64 {
        self.rows_processed
    }

    pub fn bytes_processed(&self) -> i64 {
        self.bytes_processed
    }

    pub fn peak_memory_mb(&self) -> i64 {
        self.peak_memory_mb
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// (rows/sec, MB/sec) since the tracker was created.
    pub fn throughput(&self) -> (f64, f64) {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.rows_processed as f64 / secs,
            (self.bytes_processed as f64 / (1024.0 * 1024.0)) / secs,
        )
    }

    pub fn avg_latency_ms(&self) -> i64 {
        if self.latencies.is_empty() {
            return 0;
        }
        self.latencies.iter().sum::<i64>() / self.latencies.len() as i64
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn estimated_row_bytes(bytes: i64, rows: u64) -> i64 {
    if rows == 0 {
        return 0;
    }
    (bytes / rows as i64).max(1)
}

/// Time-series reader for a job's metrics samples, oldest first.
pub async fn metrics_series(
    db: &DatabaseConnection,
    job_id: &str,
    since: Option<i64>,
) -> Result<Vec<performance_metric::Model>, MigrateError> {
    let mut query = entities::PerformanceMetric::find()
        .filter(performance_metric::Column::JobId.eq(job_id));
    if let Some(since) = since {
        query = query.filter(performance_metric::Column::RecordedAt.gte(since));
    }
    Ok(query
        .order_by_asc(performance_metric::Column::RecordedAt)
        .order_by_asc(performance_metric::Column::Id)
        .all(db)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_accumulates_batches() {
        let mut tracker = PerformanceTracker::new();
        tracker.record_batch(1000, 50_000, 40, 1000);
        tracker.record_batch(500, 25_000, 60, 1000);
        assert_eq!(tracker.rows_processed(), 1500);
        assert_eq!(tracker.bytes_processed(), 75_000);
        assert_eq!(tracker.avg_latency_ms(), 50);
        assert!(tracker.peak_memory_mb() >= 1);
    }

    #[test]
    fn empty_tracker_reports_zero_latency() {
        let tracker = PerformanceTracker::new();
        assert_eq!(tracker.avg_latency_ms(), 0);
        assert_eq!(tracker.rows_processed(), 0);
    }
}
