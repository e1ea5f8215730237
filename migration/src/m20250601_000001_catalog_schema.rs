use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

const JOB_STATUSES: [&str; 6] = [
    "pending",
    "planning",
    "running",
    "completed",
    "failed",
    "paused",
];
const TABLE_STATUSES: [&str; 4] = ["pending", "running", "completed", "failed"];
const CHUNK_STATUSES: [&str; 4] = ["pending", "running", "completed", "failed"];
const VALIDATION_STATUSES: [&str; 3] = ["pending", "validated", "failed"];
const WORKER_STATUSES: [&str; 3] = ["idle", "busy", "draining"];
const CONSTRAINT_TYPES: [&str; 3] = ["index", "foreign_key", "guard"];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create migration_jobs table
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Jobs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Jobs::SourceConfig))
                    .col(string(Jobs::TargetConfig))
                    .col(string(Jobs::Mapping))
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .string()
                            .not_null()
                            .default("pending")
                            .check(Expr::col(Jobs::Status).is_in(JOB_STATUSES)),
                    )
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(big_integer(Jobs::ChunkSize))
                    .col(big_integer(Jobs::InitialBatchSize))
                    .col(
                        ColumnDef::new(Jobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(Jobs::FailureThresholdPercent)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(Jobs::DropConstraints)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::Validate)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string_null(Jobs::OptimizationMethod))
                    .col(
                        ColumnDef::new(Jobs::TotalTables)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::TotalChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::FailedChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer_null(Jobs::PeakMemoryMb))
                    .col(big_integer_null(Jobs::TotalBytes))
                    .col(double_null(Jobs::AvgRowsPerSec))
                    .col(big_integer(Jobs::CreatedAt))
                    .col(big_integer_null(Jobs::StartedAt))
                    .col(big_integer_null(Jobs::CompletedAt))
                    .col(big_integer_null(Jobs::AutoFailedAt))
                    .col(string_null(Jobs::LastError))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_jobs_status")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .to_owned(),
            )
            .await?;

        // Create migration_tables table
        manager
            .create_table(
                Table::create()
                    .table(Tables::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tables::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Tables::JobId))
                    .col(string(Tables::TableName))
                    .col(string(Tables::TargetTable))
                    .col(string(Tables::PkColumn))
                    .col(
                        ColumnDef::new(Tables::TotalRows)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tables::TotalChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tables::CompletedChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tables::FailedChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tables::Status)
                            .string()
                            .not_null()
                            .default("pending")
                            .check(Expr::col(Tables::Status).is_in(TABLE_STATUSES)),
                    )
                    .col(string_null(Tables::LastError))
                    .col(big_integer(Tables::CreatedAt))
                    .col(big_integer_null(Tables::CompletedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tables_job")
                            .from(Tables::Table, Tables::JobId)
                            .to(Jobs::Table, Jobs::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tables_job")
                    .table(Tables::Table)
                    .col(Tables::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tables_status")
                    .table(Tables::Table)
                    .col(Tables::Status)
                    .to_owned(),
            )
            .await?;

        // Create migration_chunks table
        manager
            .create_table(
                Table::create()
                    .table(Chunks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Chunks::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Chunks::JobId))
                    .col(string(Chunks::TableId))
                    .col(string(Chunks::TableName))
                    .col(big_integer(Chunks::PkStart))
                    .col(big_integer(Chunks::PkEnd))
                    .col(
                        ColumnDef::new(Chunks::PkEndInclusive)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Chunks::Status)
                            .string()
                            .not_null()
                            .default("pending")
                            .check(Expr::col(Chunks::Status).is_in(CHUNK_STATUSES)),
                    )
                    .col(
                        ColumnDef::new(Chunks::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Chunks::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(string_null(Chunks::WorkerId))
                    .col(big_integer_null(Chunks::NextRetryAt))
                    .col(big_integer_null(Chunks::RowsProcessed))
                    .col(big_integer_null(Chunks::SourceRowCount))
                    .col(big_integer_null(Chunks::TargetRowCount))
                    .col(string_null(Chunks::Checksum))
                    .col(big_integer_null(Chunks::DurationMs))
                    .col(big_integer_null(Chunks::StartedAt))
                    .col(big_integer_null(Chunks::CompletedAt))
                    .col(big_integer_null(Chunks::LastHeartbeat))
                    .col(string_null(Chunks::LastError))
                    .col(
                        ColumnDef::new(Chunks::ValidationStatus)
                            .string()
                            .not_null()
                            .default("pending")
                            .check(Expr::col(Chunks::ValidationStatus).is_in(VALIDATION_STATUSES)),
                    )
                    .col(big_integer_null(Chunks::BatchSizeUsed))
                    .col(double_null(Chunks::ThroughputRowsPerSec))
                    .col(double_null(Chunks::ThroughputMbPerSec))
                    .col(big_integer_null(Chunks::MemoryPeakMb))
                    .col(big_integer_null(Chunks::InsertLatencyMs))
                    .col(big_integer(Chunks::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_chunks_job")
                            .from(Chunks::Table, Chunks::JobId)
                            .to(Jobs::Table, Jobs::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_chunks_table")
                            .from(Chunks::Table, Chunks::TableId)
                            .to(Tables::Table, Tables::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chunks_status_retry")
                    .table(Chunks::Table)
                    .col(Chunks::Status)
                    .col(Chunks::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chunks_status_heartbeat")
                    .table(Chunks::Table)
                    .col(Chunks::Status)
                    .col(Chunks::LastHeartbeat)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chunks_job")
                    .table(Chunks::Table)
                    .col(Chunks::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chunks_table")
                    .table(Chunks::Table)
                    .col(Chunks::TableId)
                    .to_owned(),
            )
            .await?;

        // Create worker_heartbeats table
        manager
            .create_table(
                Table::create()
                    .table(WorkerHeartbeats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkerHeartbeats::WorkerId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(big_integer(WorkerHeartbeats::LastSeen))
                    .col(string_null(WorkerHeartbeats::CurrentChunkId))
                    .col(
                        ColumnDef::new(WorkerHeartbeats::Status)
                            .string()
                            .not_null()
                            .default("idle")
                            .check(Expr::col(WorkerHeartbeats::Status).is_in(WORKER_STATUSES)),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_workers_last_seen")
                    .table(WorkerHeartbeats::Table)
                    .col(WorkerHeartbeats::LastSeen)
                    .to_owned(),
            )
            .await?;

        // Create chunk_execution_log table with backend-specific ID type
        let log_id = auto_pk(manager, ExecutionLog::Id);
        manager
            .create_table(
                Table::create()
                    .table(ExecutionLog::Table)
                    .if_not_exists()
                    .col(log_id)
                    .col(string(ExecutionLog::ChunkId))
                    .col(string_null(ExecutionLog::WorkerId))
                    .col(integer(ExecutionLog::AttemptNumber))
                    .col(string(ExecutionLog::Status))
                    .col(big_integer_null(ExecutionLog::RowsProcessed))
                    .col(big_integer_null(ExecutionLog::SourceRowCount))
                    .col(big_integer_null(ExecutionLog::TargetRowCount))
                    .col(big_integer_null(ExecutionLog::DurationMs))
                    .col(string_null(ExecutionLog::ErrorMessage))
                    .col(big_integer_null(ExecutionLog::StartedAt))
                    .col(big_integer(ExecutionLog::CompletedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_execution_log_chunk")
                    .table(ExecutionLog::Table)
                    .col(ExecutionLog::ChunkId)
                    .to_owned(),
            )
            .await?;

        // Create performance_metrics table
        let metric_id = auto_pk(manager, Metrics::Id);
        manager
            .create_table(
                Table::create()
                    .table(Metrics::Table)
                    .if_not_exists()
                    .col(metric_id)
                    .col(string(Metrics::JobId))
                    .col(string(Metrics::WorkerId))
                    .col(double(Metrics::RowsPerSecond))
                    .col(double(Metrics::MbPerSecond))
                    .col(big_integer(Metrics::MemoryUsageMb))
                    .col(big_integer(Metrics::InsertLatencyMs))
                    .col(big_integer(Metrics::CurrentBatchSize))
                    .col(big_integer(Metrics::RecordedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_metrics_job_recorded")
                    .table(Metrics::Table)
                    .col(Metrics::JobId)
                    .col(Metrics::RecordedAt)
                    .to_owned(),
            )
            .await?;

        // Create batch_size_history table
        let batch_id = auto_pk(manager, BatchHistory::Id);
        manager
            .create_table(
                Table::create()
                    .table(BatchHistory::Table)
                    .if_not_exists()
                    .col(batch_id)
                    .col(string(BatchHistory::JobId))
                    .col(string(BatchHistory::WorkerId))
                    .col(big_integer(BatchHistory::OldBatchSize))
                    .col(big_integer(BatchHistory::NewBatchSize))
                    .col(big_integer(BatchHistory::AvgLatencyMs))
                    .col(big_integer(BatchHistory::TargetLatencyMs))
                    .col(string(BatchHistory::Reason))
                    .col(big_integer(BatchHistory::RecordedAt))
                    .to_owned(),
            )
            .await?;

        // Create constraint_backup table
        let backup_id = auto_pk(manager, ConstraintBackup::Id);
        manager
            .create_table(
                Table::create()
                    .table(ConstraintBackup::Table)
                    .if_not_exists()
                    .col(backup_id)
                    .col(string(ConstraintBackup::JobId))
                    .col(string(ConstraintBackup::TableName))
                    .col(
                        ColumnDef::new(ConstraintBackup::ConstraintType)
                            .string()
                            .not_null()
                            .check(
                                Expr::col(ConstraintBackup::ConstraintType)
                                    .is_in(CONSTRAINT_TYPES),
                            ),
                    )
                    .col(string(ConstraintBackup::ConstraintName))
                    .col(string(ConstraintBackup::Definition))
                    .col(string(ConstraintBackup::UpdatedBy))
                    .col(big_integer_null(ConstraintBackup::DroppedAt))
                    .col(big_integer_null(ConstraintBackup::RestoredAt))
                    .to_owned(),
            )
            .await?;

        // The guard row per (job, table, name) serializes constraint drops
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_constraint_backup_guard")
                    .table(ConstraintBackup::Table)
                    .col(ConstraintBackup::JobId)
                    .col(ConstraintBackup::TableName)
                    .col(ConstraintBackup::ConstraintType)
                    .col(ConstraintBackup::ConstraintName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConstraintBackup::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(BatchHistory::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Metrics::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExecutionLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkerHeartbeats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Chunks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tables::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await?;
        Ok(())
    }
}

/// Auto-increment primary key with backend-specific integer width
fn auto_pk<T: IntoIden + 'static>(manager: &SchemaManager, col: T) -> ColumnDef {
    match manager.get_database_backend() {
        sea_orm::DatabaseBackend::Postgres => ColumnDef::new(col)
            .big_integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
        _ => ColumnDef::new(col)
            .integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
    }
}

#[derive(DeriveIden)]
enum Jobs {
    #[sea_orm(iden = "migration_jobs")]
    Table,
    Id,
    SourceConfig,
    TargetConfig,
    Mapping,
    Status,
    Priority,
    ChunkSize,
    InitialBatchSize,
    MaxRetries,
    FailureThresholdPercent,
    DropConstraints,
    Validate,
    OptimizationMethod,
    TotalTables,
    TotalChunks,
    CompletedChunks,
    FailedChunks,
    PeakMemoryMb,
    TotalBytes,
    AvgRowsPerSec,
    CreatedAt,
    StartedAt,
    CompletedAt,
    AutoFailedAt,
    LastError,
}

#[derive(DeriveIden)]
enum Tables {
    #[sea_orm(iden = "migration_tables")]
    Table,
    Id,
    JobId,
    TableName,
    TargetTable,
    PkColumn,
    TotalRows,
    TotalChunks,
    CompletedChunks,
    FailedChunks,
    Status,
    LastError,
    CreatedAt,
    CompletedAt,
}

#[derive(DeriveIden)]
enum Chunks {
    #[sea_orm(iden = "migration_chunks")]
    Table,
    Id,
    JobId,
    TableId,
    TableName,
    PkStart,
    PkEnd,
    PkEndInclusive,
    Status,
    RetryCount,
    MaxRetries,
    WorkerId,
    NextRetryAt,
    RowsProcessed,
    SourceRowCount,
    TargetRowCount,
    Checksum,
    DurationMs,
    StartedAt,
    CompletedAt,
    LastHeartbeat,
    LastError,
    ValidationStatus,
    BatchSizeUsed,
    ThroughputRowsPerSec,
    ThroughputMbPerSec,
    MemoryPeakMb,
    InsertLatencyMs,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WorkerHeartbeats {
    Table,
    WorkerId,
    LastSeen,
    CurrentChunkId,
    Status,
}

#[derive(DeriveIden)]
enum ExecutionLog {
    #[sea_orm(iden = "chunk_execution_log")]
    Table,
    Id,
    ChunkId,
    WorkerId,
    AttemptNumber,
    Status,
    RowsProcessed,
    SourceRowCount,
    TargetRowCount,
    DurationMs,
    ErrorMessage,
    StartedAt,
    CompletedAt,
}

#[derive(DeriveIden)]
enum Metrics {
    #[sea_orm(iden = "performance_metrics")]
    Table,
    Id,
    JobId,
    WorkerId,
    RowsPerSecond,
    MbPerSecond,
    MemoryUsageMb,
    InsertLatencyMs,
    CurrentBatchSize,
    RecordedAt,
}

#[derive(DeriveIden)]
enum BatchHistory {
    #[sea_orm(iden = "batch_size_history")]
    Table,
    Id,
    JobId,
    WorkerId,
    OldBatchSize,
    NewBatchSize,
    AvgLatencyMs,
    TargetLatencyMs,
    Reason,
    RecordedAt,
}

#[derive(DeriveIden)]
enum ConstraintBackup {
    #[sea_orm(iden = "constraint_backup")]
    Table,
    Id,
    JobId,
    TableName,
    ConstraintType,
    ConstraintName,
    Definition,
    UpdatedBy,
    DroppedAt,
    RestoredAt,
}
