use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::MigrateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Planning,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "planning" => Some(JobStatus::Planning),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Running => "running",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

pub type TableStatus = ChunkStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Validated => "validated",
            ValidationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Draining => "draining",
        }
    }
}

/// Connection descriptor for a source or target database.
///
/// The password is an opaque secret: Debug output redacts it and it must
/// never reach a log line.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls: bool,
    /// "postgres" | "mysql" | "sqlite"; inferred from host syntax when absent
    #[serde(default)]
    pub driver: Option<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("driver", &self.driver)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Resolve the driver: explicit hint wins, then descriptor syntax.
    pub fn driver_name(&self) -> &str {
        if let Some(driver) = &self.driver {
            return driver.as_str();
        }
        if self.host.starts_with("postgresql://") || self.host.starts_with("postgres://") {
            "postgres"
        } else if self.host.starts_with("mysql://") {
            "mysql"
        } else if self.host.starts_with("sqlite:") || self.database.ends_with(".db") {
            "sqlite"
        } else {
            "postgres"
        }
    }

    fn default_port(&self) -> u16 {
        match self.driver_name() {
            "mysql" => 3306,
            _ => 5432,
        }
    }

    /// Build the connection URL the driver expects.
    pub fn url(&self) -> Result<String, MigrateError> {
        // Pass a fully-formed URL through untouched
        if self.host.contains("://") {
            return Ok(self.host.clone());
        }
        match self.driver_name() {
            "sqlite" => Ok(format!("sqlite://{}?mode=rwc", self.database)),
            "mysql" => Ok(format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username,
                self.password,
                self.host,
                self.port.unwrap_or_else(|| self.default_port()),
                self.database
            )),
            "postgres" => Ok(format!(
                "postgresql://{}:{}@{}:{}/{}{}",
                self.username,
                self.password,
                self.host,
                self.port.unwrap_or_else(|| self.default_port()),
                self.database,
                if self.tls { "?sslmode=require" } else { "" }
            )),
            other => Err(MigrateError::Spec(format!("unknown driver hint: {other}"))),
        }
    }
}

/// Per-table mapping entry. Missing fields mean "same name, one-to-one".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMapping {
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
    /// Opaque per-column transform expressions, evaluated by the adapter
    #[serde(default)]
    pub transforms: BTreeMap<String, String>,
}

impl TableMapping {
    pub fn target_table_for(&self, source_table: &str) -> String {
        self.target_table
            .clone()
            .unwrap_or_else(|| source_table.to_string())
    }

    pub fn target_column(&self, source_column: &str) -> String {
        self.column_mapping
            .get(source_column)
            .cloned()
            .unwrap_or_else(|| source_column.to_string())
    }
}

/// The job spec document (`massdriver plan <job.yaml>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: ConnectionDescriptor,
    pub target: ConnectionDescriptor,
    /// source table name -> mapping; empty means migrate every discovered table
    #[serde(default)]
    pub tables: BTreeMap<String, TableMapping>,
    #[serde(default)]
    pub chunk_size: Option<i64>,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub failure_threshold_percent: Option<i32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub drop_constraints: bool,
    #[serde(default)]
    pub validate: bool,
}

impl JobSpec {
    pub fn from_yaml(text: &str) -> Result<Self, MigrateError> {
        let spec: JobSpec = serde_yaml::from_str(text)?;
        if spec.source.host.is_empty() {
            return Err(MigrateError::Spec("source host is required".into()));
        }
        if spec.target.host.is_empty() {
            return Err(MigrateError::Spec("target host is required".into()));
        }
        if let Some(size) = spec.chunk_size {
            if size < 1 {
                return Err(MigrateError::Spec(format!("chunk_size must be positive, got {size}")));
            }
        }
        Ok(spec)
    }

    pub fn mapping_for(&self, source_table: &str) -> TableMapping {
        self.tables.get(source_table).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let desc = ConnectionDescriptor {
            host: "db.internal".into(),
            port: Some(5432),
            database: "app".into(),
            username: "migrator".into(),
            password: "hunter2".into(),
            tls: false,
            driver: Some("postgres".into()),
        };
        let rendered = format!("{desc:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn url_defaults_port_by_driver() {
        let desc = ConnectionDescriptor {
            host: "db.internal".into(),
            port: None,
            database: "app".into(),
            username: "u".into(),
            password: "p".into(),
            tls: false,
            driver: Some("mysql".into()),
        };
        assert_eq!(desc.url().unwrap(), "mysql://u:p@db.internal:3306/app");
    }

    #[test]
    fn driver_inferred_from_url_syntax() {
        let desc = ConnectionDescriptor {
            host: "postgresql://u:p@h:5/db".into(),
            port: None,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            tls: false,
            driver: None,
        };
        assert_eq!(desc.driver_name(), "postgres");
        assert_eq!(desc.url().unwrap(), "postgresql://u:p@h:5/db");
    }

    #[test]
    fn job_spec_rejects_missing_source() {
        let yaml = "source:\n  host: \"\"\n  database: a\ntarget:\n  host: h\n  database: b\n";
        assert!(JobSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn mapping_defaults_are_identity() {
        let mapping = TableMapping::default();
        assert_eq!(mapping.target_table_for("users"), "users");
        assert_eq!(mapping.target_column("email"), "email");
    }
}
