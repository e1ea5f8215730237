use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::MigrateError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub catalog: Catalog,
    pub planner: Planner,
    pub worker: Worker,
    pub retry: Retry,
    pub supervisor: Supervisor,
    pub batch: Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// SeaORM/SQLx connection string for the metadata database
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Planner {
    /// Target rows per chunk
    pub chunk_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Initial insert batch size; the adaptive controller takes over from here
    pub batch_size: i64,
    pub heartbeat_interval_s: u64,
    /// Upper bound on concurrently running chunks per job
    pub max_concurrent_per_job: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retry {
    pub max_retries: i32,
    pub backoff_base_s: i64,
    pub backoff_cap_s: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supervisor {
    pub liveness_threshold_s: i64,
    /// Chunks running longer than this are reaped like a heartbeat loss
    pub hard_timeout_s: i64,
    pub failure_threshold_percent: i32,
    /// Escalation needs at least this many chunks to avoid early noise
    pub min_chunks_for_escalation: i32,
    pub reaper_interval_s: u64,
    pub tick_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub target_latency_ms: i64,
    pub min_batch: i64,
    pub max_batch: i64,
    /// Number of batches averaged per controller sample
    pub window: usize,
}

impl Default for Catalog {
    fn default() -> Self {
        Self { url: "sqlite://massdriver.db?mode=rwc".to_string() }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self { chunk_size: 100_000 }
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            heartbeat_interval_s: 10,
            max_concurrent_per_job: 8,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_s: 10,
            backoff_cap_s: 600,
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            liveness_threshold_s: 120,
            hard_timeout_s: 3_600,
            failure_threshold_percent: 5,
            min_chunks_for_escalation: 20,
            reaper_interval_s: 30,
            tick_interval_s: 10,
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            target_latency_ms: 200,
            min_batch: 500,
            max_batch: 50_000,
            window: 5,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            planner: Planner::default(),
            worker: Worker::default(),
            retry: Retry::default(),
            supervisor: Supervisor::default(),
            batch: Batch::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the optional config file, then the recognized
    /// environment variables. The env set is closed: new knobs get a row
    /// here rather than ad hoc lookups elsewhere.
    pub fn load(path: &str) -> Result<Self, MigrateError> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("catalog.url", defaults.catalog.url.clone())?
            .set_default("planner.chunk_size", defaults.planner.chunk_size)?
            .set_default("worker.batch_size", defaults.worker.batch_size)?
            .set_default("worker.heartbeat_interval_s", defaults.worker.heartbeat_interval_s as i64)?
            .set_default("worker.max_concurrent_per_job", defaults.worker.max_concurrent_per_job)?
            .set_default("retry.max_retries", defaults.retry.max_retries as i64)?
            .set_default("retry.backoff_base_s", defaults.retry.backoff_base_s)?
            .set_default("retry.backoff_cap_s", defaults.retry.backoff_cap_s)?
            .set_default("supervisor.liveness_threshold_s", defaults.supervisor.liveness_threshold_s)?
            .set_default("supervisor.hard_timeout_s", defaults.supervisor.hard_timeout_s)?
            .set_default(
                "supervisor.failure_threshold_percent",
                defaults.supervisor.failure_threshold_percent as i64,
            )?
            .set_default(
                "supervisor.min_chunks_for_escalation",
                defaults.supervisor.min_chunks_for_escalation as i64,
            )?
            .set_default("supervisor.reaper_interval_s", defaults.supervisor.reaper_interval_s as i64)?
            .set_default("supervisor.tick_interval_s", defaults.supervisor.tick_interval_s as i64)?
            .set_default("batch.target_latency_ms", defaults.batch.target_latency_ms)?
            .set_default("batch.min_batch", defaults.batch.min_batch)?
            .set_default("batch.max_batch", defaults.batch.max_batch)?
            .set_default("batch.window", defaults.batch.window as i64)?;

        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder
            .set_override_option("catalog.url", env_var("METADATA_DB_URL"))?
            .set_override_option("planner.chunk_size", env_var("MIGRATION_CHUNK_SIZE"))?
            .set_override_option("worker.batch_size", env_var("MIGRATION_BATCH_SIZE"))?
            .set_override_option("retry.max_retries", env_var("MIGRATION_MAX_RETRIES"))?
            .set_override_option(
                "worker.heartbeat_interval_s",
                env_var("MIGRATION_HEARTBEAT_INTERVAL_S"),
            )?
            .set_override_option(
                "supervisor.liveness_threshold_s",
                env_var("MIGRATION_LIVENESS_THRESHOLD_S"),
            )?
            .set_override_option(
                "supervisor.failure_threshold_percent",
                env_var("MIGRATION_FAILURE_THRESHOLD_PCT"),
            )?;

        let cfg = builder.build()?;
        let settings: Settings = cfg.try_deserialize()?;
        Ok(settings)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_env_table() {
        let s = Settings::default();
        assert_eq!(s.planner.chunk_size, 100_000);
        assert_eq!(s.worker.batch_size, 5_000);
        assert_eq!(s.retry.max_retries, 3);
        assert_eq!(s.worker.heartbeat_interval_s, 10);
        assert_eq!(s.supervisor.liveness_threshold_s, 120);
        assert_eq!(s.supervisor.failure_threshold_percent, 5);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let s = Settings::load("definitely-missing-config.toml").expect("load");
        assert_eq!(s.batch.target_latency_ms, 200);
        assert_eq!(s.retry.backoff_base_s, 10);
        assert_eq!(s.retry.backoff_cap_s, 600);
    }
}
