use portcullis::keys::KeyPair;
use portcullis::settings::Settings;
use portcullis::web::{self, AppState};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::sync::OnceLock;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
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

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// One RSA pair for the whole test binary.
fn shared_key_pair() -> KeyPair {
    static PAIR: OnceLock<KeyPair> = OnceLock::new();
    PAIR.get_or_init(|| {
        KeyPair::generate(&Settings::default().keys.key_id, 2048)
            .expect("Failed to generate test key pair")
    })
    .clone()
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.host = "localhost".to_string();
    settings.server.port = 8080;
    settings
}

/// Router and state over a fresh database, with the signing key pre-seeded.
pub struct TestApp {
    pub db: TestDb,
    pub state: AppState,
}

impl TestApp {
    pub fn router(&self) -> axum::Router {
        web::router(self.state.clone())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.connection()
    }
}

pub async fn test_app() -> TestApp {
    test_app_with(test_settings()).await
}

pub async fn test_app_with(settings: Settings) -> TestApp {
    let db = TestDb::new().await;
    let state = AppState::new(settings, db.connection().clone());
    state
        .keys
        .seed(shared_key_pair())
        .await
        .expect("Failed to seed key pair");
    TestApp { db, state }
}
