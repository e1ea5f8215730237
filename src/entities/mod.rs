pub mod batch_adjustment;
pub mod chunk;
pub mod constraint_backup;
pub mod execution_log;
pub mod job;
pub mod performance_metric;
pub mod table;
pub mod worker;

pub use batch_adjustment::Entity as BatchAdjustment;
pub use chunk::Entity as Chunk;
pub use constraint_backup::Entity as ConstraintBackup;
pub use execution_log::Entity as ExecutionLog;
pub use job::Entity as Job;
pub use performance_metric::Entity as PerformanceMetric;
pub use table::Entity as Table;
pub use worker::Entity as Worker;
