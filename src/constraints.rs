//! Target-side constraint management around bulk-load.
//!
//! Dropping indexes and foreign keys for a table is a job-global operation:
//! a guard row in `constraint_backup` (unique per job/table) elects exactly
//! one dropper; everyone else waits for the guard to be stamped. Restoration
//! definitions are persisted before anything is dropped, so a crashed
//! dropper leaves enough behind for the operator to recover.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet,
    QueryFilter, Set,
};

use crate::adapter::{Adapter, ConstraintDef, ConstraintKind, SqlAdapter};
use crate::entities::{self, constraint_backup};
use crate::errors::MigrateError;

const GUARD_NAME: &str = "_guard";
const GUARD_TYPE: &str = "guard";
const GUARD_POLL_MS: u64 = 500;
const GUARD_WAIT_MAX_S: u64 = 120;

/// Make sure the table's secondary indexes and foreign keys are dropped,
/// electing this worker through the guard row or waiting for the elected
/// one to finish. Idempotent across workers and retries.
pub async fn ensure_dropped(
    catalog_db: &DatabaseConnection,
    target: &SqlAdapter,
    job_id: &str,
    table_name: &str,
    worker_id: &str,
) -> Result<(), MigrateError> {
    let now = Utc::now().timestamp();
    let guard = constraint_backup::ActiveModel {
        id: NotSet,
        job_id: Set(job_id.to_string()),
        table_name: Set(table_name.to_string()),
        constraint_type: Set(GUARD_TYPE.to_string()),
        constraint_name: Set(GUARD_NAME.to_string()),
        definition: Set("{}".to_string()),
        updated_by: Set(worker_id.to_string()),
        dropped_at: Set(None),
        restored_at: Set(None),
    };

    match guard.insert(catalog_db).await {
        Ok(_) => {
            drop_and_backup(catalog_db, target, job_id, table_name, worker_id).await?;
            // Stamping the guard releases the waiters
            entities::ConstraintBackup::update_many()
                .col_expr(constraint_backup::Column::DroppedAt, Expr::value(now))
                .filter(guard_filter(job_id, table_name))
                .exec(catalog_db)
                .await?;
            Ok(())
        }
        Err(err) if is_unique_violation(&err) => wait_for_guard(catalog_db, job_id, table_name).await,
        Err(err) => Err(err.into()),
    }
}

async fn drop_and_backup(
    catalog_db: &DatabaseConnection,
    target: &SqlAdapter,
    job_id: &str,
    table_name: &str,
    worker_id: &str,
) -> Result<(), MigrateError> {
    let defs = target.list_constraints(table_name).await?;
    let now = Utc::now().timestamp();
    for def in defs {
        let kind = match def.kind {
            ConstraintKind::Index => "index",
            ConstraintKind::ForeignKey => "foreign_key",
        };
        constraint_backup::ActiveModel {
            id: NotSet,
            job_id: Set(job_id.to_string()),
            table_name: Set(table_name.to_string()),
            constraint_type: Set(kind.to_string()),
            constraint_name: Set(def.name.clone()),
            definition: Set(serde_json::to_string(&def)?),
            updated_by: Set(worker_id.to_string()),
            dropped_at: Set(Some(now)),
            restored_at: Set(None),
        }
        .insert(catalog_db)
        .await?;

        target.drop_constraint(table_name, &def).await?;
        tracing::info!(table = table_name, constraint = %def.name, kind, "Dropped target constraint");
    }
    Ok(())
}

async fn wait_for_guard(
    catalog_db: &DatabaseConnection,
    job_id: &str,
    table_name: &str,
) -> Result<(), MigrateError> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(GUARD_WAIT_MAX_S);
    loop {
        let guard = entities::ConstraintBackup::find()
            .filter(guard_filter(job_id, table_name))
            .one(catalog_db)
            .await?;
        match guard {
            Some(row) if row.dropped_at.is_some() => return Ok(()),
            // Guard deleted (operator cleanup): nothing left to wait for
            None => return Ok(()),
            Some(_) => {
                if std::time::Instant::now() >= deadline {
                    return Err(MigrateError::Other(format!(
                        "timed out waiting for constraint guard on {table_name}"
                    )));
                }
                tokio::time::sleep(std::time::Duration::from_millis(GUARD_POLL_MS)).await;
            }
        }
    }
}

/// Restore every constraint recorded for the table that has not been
/// restored yet. Called by the worker that completes the table's final
/// chunk; safe to call again.
pub async fn restore_for_table(
    catalog_db: &DatabaseConnection,
    target: &SqlAdapter,
    job_id: &str,
    table_name: &str,
    worker_id: &str,
) -> Result<usize, MigrateError> {
    let pending = entities::ConstraintBackup::find()
        .filter(constraint_backup::Column::JobId.eq(job_id))
        .filter(constraint_backup::Column::TableName.eq(table_name))
        .filter(constraint_backup::Column::ConstraintType.ne(GUARD_TYPE))
        .filter(constraint_backup::Column::RestoredAt.is_null())
        .all(catalog_db)
        .await?;

    let now = Utc::now().timestamp();
    let mut restored = 0;
    for row in pending {
        let def: ConstraintDef = serde_json::from_str(&row.definition)?;
        target.restore_constraint(table_name, &def).await?;

        let mut active = row.into_active_model();
        active.restored_at = Set(Some(now));
        active.updated_by = Set(worker_id.to_string());
        active.update(catalog_db).await?;
        restored += 1;
        tracing::info!(table = table_name, constraint = %def.name, "Restored target constraint");
    }

    entities::ConstraintBackup::update_many()
        .col_expr(constraint_backup::Column::RestoredAt, Expr::value(now))
        .filter(guard_filter(job_id, table_name))
        .filter(constraint_backup::Column::RestoredAt.is_null())
        .exec(catalog_db)
        .await?;
    Ok(restored)
}

fn guard_filter(job_id: &str, table_name: &str) -> sea_orm::Condition {
    sea_orm::Condition::all()
        .add(constraint_backup::Column::JobId.eq(job_id))
        .add(constraint_backup::Column::TableName.eq(table_name))
        .add(constraint_backup::Column::ConstraintType.eq(GUARD_TYPE))
        .add(constraint_backup::Column::ConstraintName.eq(GUARD_NAME))
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unique") || msg.contains("duplicate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Database};
    use migration::MigratorTrait;
    use tempfile::NamedTempFile;

    async fn catalog_db() -> (DatabaseConnection, NamedTempFile) {
        let temp_file = NamedTempFile::new().expect("temp file");
        let url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
        let db = Database::connect(&url).await.expect("connect");
        migration::Migrator::up(&db, None).await.expect("migrate");
        (db, temp_file)
    }

    async fn target_db() -> (DatabaseConnection, NamedTempFile) {
        let temp_file = NamedTempFile::new().expect("temp file");
        let url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
        let db = Database::connect(&url).await.expect("connect");
        db.execute_unprepared("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")
            .await
            .expect("create");
        db.execute_unprepared("CREATE INDEX idx_users_email ON users(email)")
            .await
            .expect("index");
        (db, temp_file)
    }

    #[tokio::test]
    async fn first_worker_drops_and_backs_up() {
        let (catalog, _c) = catalog_db().await;
        let (target_conn, _t) = target_db().await;
        let target = SqlAdapter::from_connection(target_conn);

        ensure_dropped(&catalog, &target, "job1", "users", "w1")
            .await
            .expect("ensure dropped");

        assert!(target.list_constraints("users").await.unwrap().is_empty());
        let rows = entities::ConstraintBackup::find().all(&catalog).await.unwrap();
        // One guard + one index backup
        assert_eq!(rows.len(), 2);
        let backup = rows.iter().find(|r| r.constraint_type == "index").unwrap();
        assert_eq!(backup.constraint_name, "idx_users_email");
        assert!(backup.dropped_at.is_some());
    }

    #[tokio::test]
    async fn second_worker_waits_then_proceeds() {
        let (catalog, _c) = catalog_db().await;
        let (target_conn, _t) = target_db().await;
        let target = SqlAdapter::from_connection(target_conn);

        ensure_dropped(&catalog, &target, "job1", "users", "w1").await.unwrap();
        // Guard already stamped: the second call returns without touching
        // the target again
        ensure_dropped(&catalog, &target, "job1", "users", "w2").await.unwrap();

        let rows = entities::ConstraintBackup::find().all(&catalog).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn restore_rebuilds_and_stamps() {
        let (catalog, _c) = catalog_db().await;
        let (target_conn, _t) = target_db().await;
        let target = SqlAdapter::from_connection(target_conn);

        ensure_dropped(&catalog, &target, "job1", "users", "w1").await.unwrap();
        let restored = restore_for_table(&catalog, &target, "job1", "users", "w2")
            .await
            .expect("restore");
        assert_eq!(restored, 1);
        assert_eq!(target.list_constraints("users").await.unwrap().len(), 1);

        // Second restore finds nothing pending
        let restored = restore_for_table(&catalog, &target, "job1", "users", "w2").await.unwrap();
        assert_eq!(restored, 0);
    }
}
