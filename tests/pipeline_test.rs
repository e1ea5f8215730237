mod helpers;

use std::collections::BTreeMap;
use std::collections::HashSet;

use chrono::Utc;
use helpers::db::TestDb;
use helpers::seed;
use massdriver::catalog;
use massdriver::model::TableMapping;
use massdriver::planner;
use massdriver::settings::Settings;
use sea_orm::ConnectionTrait;

#[tokio::test]
async fn happy_path_migrates_every_row() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::create_users_table(&pair.target).await;
    seed::seed_users(&pair.source, 2_500).await;

    let spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 1_000);
    let job = catalog::create_job(db, &spec, &cfg).await.expect("create");
    planner::plan_job(db, &job.id).await.expect("plan");

    let processed = seed::drain(db, &cfg, "worker-a").await;
    assert_eq!(processed, 3);

    let job = catalog::get_job(db, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, "completed");
    assert_eq!(job.total_chunks, 3);
    assert_eq!(job.completed_chunks, 3);
    assert_eq!(job.failed_chunks, 0);
    assert!(job.completed_at.is_some());
    assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

    assert_eq!(seed::count_rows(&pair.target, "users").await, 2_500);

    // Completed-job equivalence: per-chunk source and target counts agree
    let chunks = catalog::get_chunks(db, &job.id).await.unwrap();
    let source_total: i64 = chunks.iter().filter_map(|c| c.source_row_count).sum();
    let target_total: i64 = chunks.iter().filter_map(|c| c.target_row_count).sum();
    assert_eq!(source_total, 2_500);
    assert_eq!(source_total, target_total);
    for chunk in &chunks {
        assert_eq!(chunk.status, "completed");
        assert_eq!(chunk.validation_status, "validated");
        assert!(chunk.checksum.is_some());
        assert!(chunk.batch_size_used.is_some());

        let log = catalog::get_execution_log(db, &chunk.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].attempt_number, 1);
        assert_eq!(log[0].status, "completed");
    }
}

#[tokio::test]
async fn rerunning_a_chunk_does_not_duplicate_rows() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::create_users_table(&pair.target).await;
    seed::seed_users(&pair.source, 300).await;
    // A previous, partially applied attempt
    pair.target
        .execute_unprepared("INSERT INTO users (id, name, email) VALUES (5, 'stale', NULL)")
        .await
        .unwrap();

    let spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 1_000);
    let job = catalog::create_job(db, &spec, &cfg).await.unwrap();
    planner::plan_job(db, &job.id).await.unwrap();
    seed::drain(db, &cfg, "worker-a").await;

    assert_eq!(seed::count_rows(&pair.target, "users").await, 300);
    let job = catalog::get_job(db, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, "completed");
}

#[tokio::test]
async fn mapping_and_transforms_shape_the_target() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::seed_users(&pair.source, 40).await;
    pair.target
        .execute_unprepared(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, full_name TEXT NOT NULL, email TEXT)",
        )
        .await
        .unwrap();

    let mut spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 1_000);
    spec.tables = BTreeMap::from([(
        "users".to_string(),
        TableMapping {
            target_table: Some("accounts".into()),
            column_mapping: BTreeMap::from([("name".to_string(), "full_name".to_string())]),
            transforms: BTreeMap::from([("email".to_string(), "lower".to_string())]),
        },
    )]);

    let job = catalog::create_job(db, &spec, &cfg).await.unwrap();
    planner::plan_job(db, &job.id).await.unwrap();
    seed::drain(db, &cfg, "worker-a").await;

    assert_eq!(seed::count_rows(&pair.target, "accounts").await, 40);
    let row = pair
        .target
        .query_one(sea_orm::Statement::from_string(
            sea_orm::DbBackend::Sqlite,
            "SELECT full_name, email FROM accounts WHERE id = 7".to_string(),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<String>("", "full_name").unwrap(), "user7");
    assert_eq!(row.try_get::<String>("", "email").unwrap(), "user7@example.com");
}

#[tokio::test]
async fn resume_after_crash_drains_to_completion() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::create_users_table(&pair.target).await;
    seed::seed_users(&pair.source, 1_200).await;

    let spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 400);
    let job = catalog::create_job(db, &spec, &cfg).await.unwrap();
    planner::plan_job(db, &job.id).await.unwrap();

    // A worker claims a chunk and dies without a trace
    let doomed = catalog::claim_next_chunk(db, "doomed-worker", 8)
        .await
        .unwrap()
        .unwrap();
    let stale = Utc::now().timestamp() - 300;
    db.execute(sea_orm::Statement::from_sql_and_values(
        sea_orm::DbBackend::Sqlite,
        "UPDATE migration_chunks SET last_heartbeat = ? WHERE id = ?",
        [stale.into(), doomed.id.clone().into()],
    ))
    .await
    .unwrap();

    // One reaper cycle recovers the orphan
    let reaped = catalog::reap_dead_workers(
        db,
        cfg.supervisor.liveness_threshold_s,
        cfg.supervisor.hard_timeout_s,
        &cfg.retry,
    )
    .await
    .unwrap();
    assert_eq!(reaped.len(), 1);

    // The reaped chunk is waiting out its back-off; make it eligible now
    db.execute(sea_orm::Statement::from_sql_and_values(
        sea_orm::DbBackend::Sqlite,
        "UPDATE migration_chunks SET next_retry_at = ? WHERE id = ?",
        [(stale).into(), doomed.id.clone().into()],
    ))
    .await
    .unwrap();

    // Fresh workers drain everything
    seed::drain(db, &cfg, "replacement-worker").await;

    let job = catalog::get_job(db, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, "completed");
    assert_eq!(job.failed_chunks, 0);
    assert_eq!(seed::count_rows(&pair.target, "users").await, 1_200);

    // The orphaned chunk carries its audit trail: reap + successful rerun
    let log = catalog::get_execution_log(db, &doomed.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].attempt_number, 1);
    assert_eq!(log[0].status, "failed");
    assert_eq!(log[1].attempt_number, 2);
    assert_eq!(log[1].status, "completed");
}

#[tokio::test]
async fn concurrent_claims_hand_out_each_chunk_once() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::create_users_table(&pair.target).await;
    seed::seed_users(&pair.source, 2_500).await;

    let spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 1_000);
    let job = catalog::create_job(db, &spec, &cfg).await.unwrap();
    planner::plan_job(db, &job.id).await.unwrap();

    // Ten workers race for three pending chunks
    let claims = futures::future::join_all((0..10).map(|i| {
        let db = db.clone();
        async move { catalog::claim_next_chunk(&db, &format!("racer-{i}"), 8).await }
    }))
    .await;

    let mut won = Vec::new();
    for claim in claims {
        if let Some(chunk) = claim.expect("claim must not error") {
            won.push(chunk);
        }
    }
    assert_eq!(won.len(), 3);
    let distinct: HashSet<String> = won.iter().map(|c| c.id.clone()).collect();
    assert_eq!(distinct.len(), 3);
    let owners: HashSet<String> = won.iter().filter_map(|c| c.worker_id.clone()).collect();
    assert_eq!(owners.len(), 3);
}

#[tokio::test]
async fn worker_runtime_drains_job_end_to_end() {
    let catalog_db = TestDb::new().await;
    let db = catalog_db.connection();
    let cfg = Settings::default();

    let pair = seed::sqlite_pair().await;
    seed::create_users_table(&pair.source).await;
    seed::create_users_table(&pair.target).await;
    seed::seed_users(&pair.source, 900).await;

    let spec = seed::job_spec(pair.source_file.path(), pair.target_file.path(), 300);
    let job = catalog::create_job(db, &spec, &cfg).await.unwrap();
    planner::plan_job(db, &job.id).await.unwrap();

    let worker = std::sync::Arc::new(massdriver::worker::Worker::new(
        db.clone(),
        cfg.clone(),
        Some("runtime-worker".into()),
    ));
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Wait for the job to finish, then drain the worker
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        let state = catalog::get_job(db, &job.id).await.unwrap().unwrap();
        if state.status == "completed" {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "job did not complete in time (status: {})",
            state.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    handle.await.expect("join").expect("worker run");

    assert_eq!(seed::count_rows(&pair.target, "users").await, 900);
}
