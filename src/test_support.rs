//! Fixtures shared by the unit tests.

use crate::keys::{KeyManager, KeyPair};
use crate::settings::Settings;
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::sync::OnceLock;
use tempfile::NamedTempFile;

/// Test database helper that keeps temp file alive
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

/// One RSA pair per test binary; generating 2048-bit keys per test is slow.
pub fn shared_key_pair() -> KeyPair {
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

pub async fn seeded_key_manager(db: &DatabaseConnection, settings: &Settings) -> KeyManager {
    let km = KeyManager::new(
        db.clone(),
        settings.keys.clone(),
        settings.database.io_timeout(),
    );
    km.seed(shared_key_pair())
        .await
        .expect("Failed to seed key pair");
    km
}
