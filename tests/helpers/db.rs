use sea_orm::{Database, DatabaseConnection};
use migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Catalog database on a temp file with migrations applied; the file lives
/// as long as the struct.
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}
