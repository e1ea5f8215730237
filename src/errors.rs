use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(massdriver::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(massdriver::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(massdriver::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Job spec error: {0}")]
    #[diagnostic(code(massdriver::spec))]
    Spec(String),

    #[error("Catalog error: {0}")]
    #[diagnostic(code(massdriver::catalog))]
    Db(#[from] sea_orm::DbErr),

    #[error(transparent)]
    #[diagnostic(code(massdriver::adapter))]
    Adapter(#[from] AdapterError),

    #[error("chunk {0} is no longer owned by this worker")]
    #[diagnostic(code(massdriver::ownership))]
    OwnershipLost(String),

    #[error("not found: {0}")]
    #[diagnostic(code(massdriver::not_found))]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(massdriver::other))]
    Other(String),
}

impl From<serde_yaml::Error> for MigrateError {
    fn from(value: serde_yaml::Error) -> Self {
        MigrateError::Spec(value.to_string())
    }
}

/// Failure kinds observed at the source/target database boundary.
///
/// `ConnectionLost` and `Timeout` are retried inside the adapter with bounded
/// exponential back-off; everything else surfaces immediately. `AuthFailed`,
/// `TypeMismatch`, and `ConstraintViolation` are terminal for the chunk.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum AdapterError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Unknown(String),
}

impl AdapterError {
    /// Classify a driver error by its message. sea-orm flattens the
    /// underlying sqlx error into text, so the kind has to be sniffed.
    pub fn classify(err: &sea_orm::DbErr) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("password") || lower.contains("authentication") || lower.contains("access denied")
        {
            AdapterError::AuthFailed(msg)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            AdapterError::Timeout(msg)
        } else if lower.contains("connection") || lower.contains("connect") || lower.contains("broken pipe")
        {
            AdapterError::ConnectionLost(msg)
        } else if lower.contains("unique") || lower.contains("foreign key") || lower.contains("constraint")
        {
            AdapterError::ConstraintViolation(msg)
        } else if lower.contains("no such table")
            || lower.contains("does not exist")
            || lower.contains("doesn't exist")
        {
            AdapterError::NotFound(msg)
        } else if lower.contains("type") || lower.contains("invalid input syntax") {
            AdapterError::TypeMismatch(msg)
        } else {
            AdapterError::Unknown(msg)
        }
    }

    /// Only these kinds are retried adapter-internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::ConnectionLost(_) | AdapterError::Timeout(_))
    }

    /// Terminal kinds exhaust the chunk immediately, regardless of the
    /// remaining retry budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdapterError::AuthFailed(_)
                | AdapterError::TypeMismatch(_)
                | AdapterError::ConstraintViolation(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::ConnectionLost(_) => "connection_lost",
            AdapterError::AuthFailed(_) => "auth_failed",
            AdapterError::NotFound(_) => "not_found",
            AdapterError::TypeMismatch(_) => "type_mismatch",
            AdapterError::ConstraintViolation(_) => "constraint_violation",
            AdapterError::Timeout(_) => "timeout",
            AdapterError::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_picks_auth_over_connection() {
        let err = sea_orm::DbErr::Custom("FATAL: password authentication failed".into());
        assert!(matches!(AdapterError::classify(&err), AdapterError::AuthFailed(_)));
    }

    #[test]
    fn classify_constraint_violation() {
        let err = sea_orm::DbErr::Custom("UNIQUE constraint failed: users.id".into());
        let kind = AdapterError::classify(&err);
        assert!(matches!(kind, AdapterError::ConstraintViolation(_)));
        assert!(kind.is_terminal());
        assert!(!kind.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable_not_terminal() {
        let err = sea_orm::DbErr::Custom("statement timed out".into());
        let kind = AdapterError::classify(&err);
        assert!(kind.is_retryable());
        assert!(!kind.is_terminal());
    }
}
