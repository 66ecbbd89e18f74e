use crate::entities;
use crate::errors::CrabError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::{Rng, RngCore};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewClient {
    /// Caller-chosen id; a random one is generated when absent
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: i64,
    pub enabled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub client_id: String,
    pub subject: String,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuthCode {
    pub client_id: String,
    pub subject: String,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Session metadata for an issued access token that carries a refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSession {
    pub refresh_token: String,
    pub access_token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Denied,
    Consumed,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Denied => "denied",
            DeviceStatus::Consumed => "consumed",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = CrabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "approved" => Ok(DeviceStatus::Approved),
            "denied" => Ok(DeviceStatus::Denied),
            "consumed" => Ok(DeviceStatus::Consumed),
            other => Err(CrabError::Other(format!("unknown device status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub status: DeviceStatus,
    pub subject: Option<String>,
    pub expires_in: i64,
    pub interval: i64,
    pub last_poll_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceAuthorization {
    /// Expiry is derived, never stored.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.created_at + self.expires_in
    }
}

impl From<entities::client::Model> for Client {
    fn from(m: entities::client::Model) -> Self {
        Self {
            client_id: m.client_id,
            client_secret: m.client_secret,
            redirect_uri: m.redirect_uri,
            name: m.name,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

impl From<entities::user::Model> for User {
    fn from(m: entities::user::Model) -> Self {
        Self {
            subject: m.subject,
            username: m.username,
            password_hash: m.password_hash,
            created_at: m.created_at,
            enabled: m.enabled,
        }
    }
}

impl From<entities::auth_code::Model> for AuthCode {
    fn from(m: entities::auth_code::Model) -> Self {
        Self {
            code: m.code,
            client_id: m.client_id,
            subject: m.subject,
            redirect_uri: m.redirect_uri,
            scope: m.scope,
            code_challenge: m.code_challenge,
            code_challenge_method: m.code_challenge_method,
            created_at: m.created_at,
            expires_at: m.expires_at,
            consumed: m.consumed,
        }
    }
}

impl From<entities::token::Model> for TokenSession {
    fn from(m: entities::token::Model) -> Self {
        Self {
            refresh_token: m.refresh_token,
            access_token: m.access_token,
            client_id: m.client_id,
            subject: m.subject,
            scope: m.scope,
            created_at: m.created_at,
            expires_at: m.expires_at,
            revoked: m.revoked,
        }
    }
}

impl TryFrom<entities::device_authorization::Model> for DeviceAuthorization {
    type Error = CrabError;

    fn try_from(m: entities::device_authorization::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            device_code: m.device_code,
            user_code: m.user_code,
            client_id: m.client_id,
            scope: m.scope,
            verification_uri: m.verification_uri,
            verification_uri_complete: m.verification_uri_complete,
            status: m.status.parse()?,
            subject: m.subject,
            expires_in: m.expires_in,
            interval: m.interval,
            last_poll_at: m.last_poll_at,
            created_at: m.created_at,
            updated_at: m.updated_at,
        })
    }
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, CrabError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Bounds a store call; an elapsed deadline becomes `CrabError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CrabError>
where
    F: Future<Output = Result<T, CrabError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CrabError::Timeout(limit))?
}

/// 192-bit random identifier, base64url without padding.
pub fn random_id() -> String {
    random_token(24)
}

pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64ct::Base64UrlUnpadded::encode_string(&buf)
}

/// Symbols a person can read back without confusion: no vowels, no `l`, no `0`/`1`.
pub const USER_CODE_ALPHABET: &[u8] = b"bcdfghjkmnpqrstvwxyz23456789";

/// 8-symbol user code in format xxxx-xxxx, about 38 bits of entropy.
/// `gen_range` samples uniformly, so no symbol is favoured.
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);

    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }

    code
}

// Clients

pub async fn create_client(db: &DatabaseConnection, input: NewClient) -> Result<Client, CrabError> {
    let client_id = input.client_id.unwrap_or_else(random_id);
    let now = Utc::now().timestamp();

    let client = entities::client::ActiveModel {
        client_id: Set(client_id),
        client_secret: Set(input.client_secret),
        redirect_uri: Set(input.redirect_uri),
        name: Set(input.name),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let model = client.insert(db).await?;
    Ok(model.into())
}

pub async fn get_client(
    db: &DatabaseConnection,
    client_id: &str,
) -> Result<Option<Client>, CrabError> {
    use entities::client::{Column, Entity};

    let model = Entity::find()
        .filter(Column::ClientId.eq(client_id))
        .one(db)
        .await?;
    Ok(model.map(Client::from))
}

/// Registers `client_id` unless it already exists; concurrent callers converge on one row.
pub async fn ensure_client(db: &DatabaseConnection, client_id: &str) -> Result<Client, CrabError> {
    use entities::client::{Column, Entity};

    let now = Utc::now().timestamp();
    let client = entities::client::ActiveModel {
        client_id: Set(client_id.to_string()),
        client_secret: Set(None),
        redirect_uri: Set(None),
        name: Set(Some(client_id.to_string())),
        created_at: Set(now),
        updated_at: Set(now),
    };

    Entity::insert(client)
        .on_conflict(OnConflict::column(Column::ClientId).do_nothing().to_owned())
        .exec_without_returning(db)
        .await?;

    get_client(db, client_id)
        .await?
        .ok_or_else(|| CrabError::Other(format!("client {client_id} vanished after insert")))
}

// Users

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<User, CrabError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CrabError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject),
        username: Set(username.to_string()),
        password_hash: Set(password_hash),
        created_at: Set(created_at),
        enabled: Set(1),
    };

    let model = user.insert(db).await?;
    Ok(model.into())
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<User>, CrabError> {
    use entities::user::{Column, Entity};

    let model = Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?;
    Ok(model.map(User::from))
}

/// Returns the user when the password matches an enabled account.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<User>, CrabError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_username(db, username).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| CrabError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user))
    } else {
        Ok(None)
    }
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    subject: &str,
    enabled: bool,
) -> Result<(), CrabError> {
    use entities::user::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Enabled, Expr::value(if enabled { 1 } else { 0 }))
        .filter(Column::Subject.eq(subject))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn count_users(db: &DatabaseConnection) -> Result<u64, CrabError> {
    Ok(entities::User::find().count(db).await?)
}

// Key-value properties

pub async fn get_property(
    db: &DatabaseConnection,
    owner: &str,
    key: &str,
) -> Result<Option<Value>, CrabError> {
    use entities::property::{Column, Entity};

    let now = Utc::now().timestamp();
    let Some(model) = Entity::find()
        .filter(Column::Owner.eq(owner))
        .filter(Column::Key.eq(key))
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    if model.expires_at.is_some_and(|exp| exp <= now) {
        return Ok(None);
    }
    let json: Value = serde_json::from_str(&model.value)?;
    Ok(Some(json))
}

/// Upserts a property; `ttl_secs` bounds how long reads will see it.
pub async fn set_property(
    db: &DatabaseConnection,
    owner: &str,
    key: &str,
    value: &Value,
    ttl_secs: Option<i64>,
) -> Result<(), CrabError> {
    use entities::property::{Column, Entity};

    let now = Utc::now().timestamp();
    let json = serde_json::to_string(value)?;

    let property = entities::property::ActiveModel {
        owner: Set(owner.to_string()),
        key: Set(key.to_string()),
        value: Set(json),
        updated_at: Set(now),
        expires_at: Set(ttl_secs.map(|ttl| now + ttl)),
    };

    Entity::insert(property)
        .on_conflict(
            OnConflict::columns([Column::Owner, Column::Key])
                .update_columns([Column::Value, Column::UpdatedAt, Column::ExpiresAt])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

/// Atomic insert-if-absent. Returns `true` when this call wrote the value.
pub async fn insert_property_if_absent(
    db: &DatabaseConnection,
    owner: &str,
    key: &str,
    value: &Value,
) -> Result<bool, CrabError> {
    use entities::property::{Column, Entity};

    let now = Utc::now().timestamp();
    // an expired entry must not block the slot
    Entity::delete_many()
        .filter(Column::Owner.eq(owner))
        .filter(Column::Key.eq(key))
        .filter(Column::ExpiresAt.lte(now))
        .exec(db)
        .await?;

    let property = entities::property::ActiveModel {
        owner: Set(owner.to_string()),
        key: Set(key.to_string()),
        value: Set(serde_json::to_string(value)?),
        updated_at: Set(now),
        expires_at: Set(None),
    };

    let inserted = Entity::insert(property)
        .on_conflict(
            OnConflict::columns([Column::Owner, Column::Key])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(inserted == 1)
}

pub async fn delete_property(
    db: &DatabaseConnection,
    owner: &str,
    key: &str,
) -> Result<(), CrabError> {
    use entities::property::{Column, Entity};

    Entity::delete_many()
        .filter(Column::Owner.eq(owner))
        .filter(Column::Key.eq(key))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn cleanup_expired_properties(db: &DatabaseConnection) -> Result<u64, CrabError> {
    use entities::property::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lte(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// Authorization codes

pub async fn issue_auth_code(
    db: &DatabaseConnection,
    input: NewAuthCode,
    ttl_secs: i64,
) -> Result<AuthCode, CrabError> {
    let now = Utc::now().timestamp();

    let auth_code = entities::auth_code::ActiveModel {
        code: Set(random_id()),
        client_id: Set(input.client_id),
        subject: Set(input.subject),
        redirect_uri: Set(input.redirect_uri),
        scope: Set(input.scope),
        code_challenge: Set(input.code_challenge),
        code_challenge_method: Set(input.code_challenge_method),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
        consumed: Set(0),
    };

    let model = auth_code.insert(db).await?;
    Ok(model.into())
}

/// Marks the code spent and returns it, or `None` when it is unknown, expired or already used.
///
/// The flip is a single conditional update, so of two concurrent callers
/// exactly one observes a changed row.
pub async fn consume_auth_code(
    db: &DatabaseConnection,
    code: &str,
) -> Result<Option<AuthCode>, CrabError> {
    use entities::auth_code::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::update_many()
        .col_expr(Column::Consumed, Expr::value(1))
        .filter(Column::Code.eq(code))
        .filter(Column::Consumed.eq(0))
        .filter(Column::ExpiresAt.gt(now))
        .exec(db)
        .await?;

    if result.rows_affected != 1 {
        return Ok(None);
    }

    let model = Entity::find().filter(Column::Code.eq(code)).one(db).await?;
    Ok(model.map(AuthCode::from))
}

pub async fn cleanup_expired_auth_codes(db: &DatabaseConnection) -> Result<u64, CrabError> {
    use entities::auth_code::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lte(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// Token sessions

pub async fn create_token_session(
    db: &DatabaseConnection,
    access_token: &str,
    client_id: &str,
    subject: &str,
    scope: Option<String>,
    ttl_secs: i64,
) -> Result<TokenSession, CrabError> {
    let now = Utc::now().timestamp();

    let session = entities::token::ActiveModel {
        refresh_token: Set(random_id()),
        access_token: Set(access_token.to_string()),
        client_id: Set(client_id.to_string()),
        subject: Set(subject.to_string()),
        scope: Set(scope),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
        revoked: Set(0),
    };

    let model = session.insert(db).await?;
    Ok(model.into())
}

/// Live session for `refresh_token`; revoked or expired sessions read as `None`.
pub async fn get_token_session(
    db: &DatabaseConnection,
    refresh_token: &str,
) -> Result<Option<TokenSession>, CrabError> {
    use entities::token::{Column, Entity};

    let Some(model) = Entity::find()
        .filter(Column::RefreshToken.eq(refresh_token))
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let now = Utc::now().timestamp();
    if model.revoked != 0 || now >= model.expires_at {
        return Ok(None);
    }
    Ok(Some(model.into()))
}

/// Records a re-issued access token against an unrevoked session.
pub async fn update_session_access_token(
    db: &DatabaseConnection,
    refresh_token: &str,
    access_token: &str,
) -> Result<bool, CrabError> {
    use entities::token::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::AccessToken, Expr::value(access_token))
        .filter(Column::RefreshToken.eq(refresh_token))
        .filter(Column::Revoked.eq(0))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn revoke_token_session(
    db: &DatabaseConnection,
    refresh_token: &str,
) -> Result<(), CrabError> {
    use entities::token::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Revoked, Expr::value(1))
        .filter(Column::RefreshToken.eq(refresh_token))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn cleanup_expired_token_sessions(db: &DatabaseConnection) -> Result<u64, CrabError> {
    use entities::token::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lte(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// Device Authorization Grant (RFC 8628)

fn device_expired_condition(now: i64) -> Condition {
    use entities::device_authorization::Column;

    Condition::all().add(
        Expr::expr(Expr::col(Column::CreatedAt).add(Expr::col(Column::ExpiresIn))).lte(now),
    )
}

/// Inserts a new record unless its user code is taken. Returns `true` on insert.
pub async fn insert_device_authorization(
    db: &DatabaseConnection,
    record: &DeviceAuthorization,
) -> Result<bool, CrabError> {
    use entities::device_authorization::{Column, Entity};

    let model = entities::device_authorization::ActiveModel {
        device_code: Set(record.device_code.clone()),
        user_code: Set(record.user_code.clone()),
        client_id: Set(record.client_id.clone()),
        scope: Set(record.scope.clone()),
        verification_uri: Set(record.verification_uri.clone()),
        verification_uri_complete: Set(record.verification_uri_complete.clone()),
        status: Set(record.status.as_str().to_string()),
        subject: Set(record.subject.clone()),
        expires_in: Set(record.expires_in),
        interval: Set(record.interval),
        last_poll_at: Set(record.last_poll_at),
        created_at: Set(record.created_at),
        updated_at: Set(record.updated_at),
    };

    let inserted = Entity::insert(model)
        .on_conflict(OnConflict::column(Column::UserCode).do_nothing().to_owned())
        .exec_without_returning(db)
        .await?;
    Ok(inserted == 1)
}

/// Frees a user code held by an expired record.
pub async fn purge_expired_user_code(
    db: &DatabaseConnection,
    user_code: &str,
    now: i64,
) -> Result<u64, CrabError> {
    use entities::device_authorization::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::UserCode.eq(user_code))
        .filter(device_expired_condition(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn get_device_by_device_code(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<DeviceAuthorization>, CrabError> {
    use entities::device_authorization::{Column, Entity};

    Entity::find()
        .filter(Column::DeviceCode.eq(device_code))
        .one(db)
        .await?
        .map(DeviceAuthorization::try_from)
        .transpose()
}

pub async fn get_device_by_user_code(
    db: &DatabaseConnection,
    user_code: &str,
) -> Result<Option<DeviceAuthorization>, CrabError> {
    use entities::device_authorization::{Column, Entity};

    Entity::find()
        .filter(Column::UserCode.eq(user_code))
        .one(db)
        .await?
        .map(DeviceAuthorization::try_from)
        .transpose()
}

/// Conditional status change `from -> to` on an unexpired record.
///
/// `subject` is bound when given. Returns `false` if the record was not in
/// `from` (or had expired) at the moment of the update.
pub async fn transition_device_status(
    db: &DatabaseConnection,
    device_code: &str,
    from: DeviceStatus,
    to: DeviceStatus,
    subject: Option<&str>,
    now: i64,
) -> Result<bool, CrabError> {
    use entities::device_authorization::{Column, Entity};

    let mut update = Entity::update_many()
        .col_expr(Column::Status, Expr::value(to.as_str()))
        .col_expr(Column::UpdatedAt, Expr::value(now));
    if let Some(subject) = subject {
        update = update.col_expr(Column::Subject, Expr::value(subject));
    }

    let result = update
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq(from.as_str()))
        .filter(device_expired_condition(now).not())
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

fn last_poll_matches(observed: Option<i64>) -> Condition {
    use entities::device_authorization::Column;

    match observed {
        Some(at) => Condition::all().add(Column::LastPollAt.eq(at)),
        None => Condition::all().add(Column::LastPollAt.is_null()),
    }
}

/// Compare-and-set of `last_poll_at` on a pending record.
pub async fn record_device_poll(
    db: &DatabaseConnection,
    device_code: &str,
    observed_last_poll: Option<i64>,
    now: i64,
) -> Result<bool, CrabError> {
    use entities::device_authorization::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::LastPollAt, Expr::value(now))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq(DeviceStatus::Pending.as_str()))
        .filter(last_poll_matches(observed_last_poll))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Widens the polling interval by `step` seconds and records the poll.
pub async fn slow_down_device(
    db: &DatabaseConnection,
    device_code: &str,
    observed_last_poll: Option<i64>,
    step: i64,
    now: i64,
) -> Result<bool, CrabError> {
    use entities::device_authorization::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Interval, Expr::col(Column::Interval).add(step))
        .col_expr(Column::LastPollAt, Expr::value(now))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq(DeviceStatus::Pending.as_str()))
        .filter(last_poll_matches(observed_last_poll))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn cleanup_expired_device_authorizations(
    db: &DatabaseConnection,
) -> Result<u64, CrabError> {
    use entities::device_authorization::Entity;

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(device_expired_condition(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
