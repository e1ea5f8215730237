use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use massdriver::batch::BatchController;
use massdriver::catalog;
use massdriver::entities;
use massdriver::executor::{self, ExecProgress, ExecutionError};
use massdriver::model::{ConnectionDescriptor, JobSpec};
use massdriver::settings::Settings;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait};
use tempfile::NamedTempFile;

/// A sqlite source/target pair on temp files.
pub struct SourceTarget {
    pub source: DatabaseConnection,
    pub target: DatabaseConnection,
    pub source_file: NamedTempFile,
    pub target_file: NamedTempFile,
}

pub async fn sqlite_pair() -> SourceTarget {
    let source_file = NamedTempFile::new().expect("source temp file");
    let target_file = NamedTempFile::new().expect("target temp file");
    let source = connect(source_file.path()).await;
    let target = connect(target_file.path()).await;
    SourceTarget { source, target, source_file, target_file }
}

pub async fn connect(path: &Path) -> DatabaseConnection {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    Database::connect(&url).await.expect("connect sqlite")
}

pub async fn create_users_table(db: &DatabaseConnection) {
    db.execute_unprepared(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT)",
    )
    .await
    .expect("create users");
}

/// Insert ids 1..=n with deterministic names/emails.
pub async fn seed_users(db: &DatabaseConnection, n: i64) {
    let mut id = 1;
    while id <= n {
        let upper = (id + 499).min(n);
        let values: Vec<String> = (id..=upper)
            .map(|i| format!("({i}, 'user{i}', 'User{i}@Example.com')"))
            .collect();
        db.execute_unprepared(&format!(
            "INSERT INTO users (id, name, email) VALUES {}",
            values.join(", ")
        ))
        .await
        .expect("seed users");
        id = upper + 1;
    }
}

pub async fn count_rows(db: &DatabaseConnection, table: &str) -> i64 {
    let row = db
        .query_one(sea_orm::Statement::from_string(
            sea_orm::DbBackend::Sqlite,
            format!("SELECT COUNT(*) AS cnt FROM {table}"),
        ))
        .await
        .expect("count")
        .expect("count row");
    row.try_get::<i64>("", "cnt").expect("cnt column")
}

pub fn descriptor_for(path: &Path) -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: String::from("localhost"),
        port: None,
        database: path.display().to_string(),
        username: String::new(),
        password: String::new(),
        tls: false,
        driver: Some("sqlite".into()),
    }
}

pub fn job_spec(source: &Path, target: &Path, chunk_size: i64) -> JobSpec {
    JobSpec {
        source: descriptor_for(source),
        target: descriptor_for(target),
        tables: Default::default(),
        chunk_size: Some(chunk_size),
        batch_size: Some(500),
        max_retries: None,
        failure_threshold_percent: None,
        priority: None,
        drop_constraints: false,
        validate: true,
    }
}

/// Claim-execute-record until no chunk is immediately eligible; the manual
/// equivalent of one worker draining the queue.
pub async fn drain(db: &DatabaseConnection, cfg: &Settings, worker_id: &str) -> usize {
    let mut controllers: HashMap<String, BatchController> = HashMap::new();
    let mut processed = 0;
    while let Some(chunk) = catalog::claim_next_chunk(db, worker_id, cfg.worker.max_concurrent_per_job)
        .await
        .expect("claim")
    {
        let job = catalog::get_job(db, &chunk.job_id)
            .await
            .expect("get job")
            .expect("job exists");
        let table = entities::Table::find_by_id(chunk.table_id.as_str())
            .one(db)
            .await
            .expect("get table")
            .expect("table exists");
        let controller = controllers
            .entry(job.id.clone())
            .or_insert_with(|| BatchController::new(job.initial_batch_size, &cfg.batch));

        let cancelled = AtomicBool::new(false);
        let progress = ExecProgress::new(controller.current_batch());
        match executor::execute_chunk(db, worker_id, &chunk, &job, &table, controller, &cancelled, &progress)
            .await
        {
            Ok(outcome) => catalog::complete_chunk(db, &chunk.id, outcome)
                .await
                .expect("complete chunk"),
            Err(ExecutionError::Failed { message, terminal }) => {
                catalog::fail_chunk(db, &chunk.id, &message, 0, terminal, &cfg.retry)
                    .await
                    .expect("fail chunk")
            }
            Err(ExecutionError::Cancelled) => {}
        }
        processed += 1;
    }
    processed
}
