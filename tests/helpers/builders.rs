use portcullis::storage;
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    enabled: bool,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::User {
        let user = storage::create_user(db, &self.username, &self.password)
            .await
            .expect("Failed to create test user");

        if !self.enabled {
            storage::set_user_enabled(db, &user.subject, false)
                .await
                .expect("Failed to disable test user");
        }
        user
    }
}

/// Builder for creating test OAuth clients
pub struct ClientBuilder {
    client_id: Option<String>,
    name: Option<String>,
    redirect_uri: Option<String>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            client_id: None,
            name: Some("Test Client".to_string()),
            redirect_uri: Some("http://localhost:3000/callback".to_string()),
        }
    }

    pub fn with_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uri = Some(uri.to_string());
        self
    }

    pub fn without_redirect_uri(mut self) -> Self {
        self.redirect_uri = None;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Client {
        storage::create_client(
            db,
            storage::NewClient {
                client_id: self.client_id,
                client_secret: None,
                redirect_uri: self.redirect_uri,
                name: self.name,
            },
        )
        .await
        .expect("Failed to create test client")
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
