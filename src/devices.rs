//! Device Authorization Grant (RFC 8628) state machine.
//!
//! ```text
//! pending --approve--> approved --token issued--> consumed
//! pending --deny-----> denied
//! any     --created_at + expires_in elapses--> expired (derived, never stored)
//! ```

use crate::errors::{CrabError, ErrorCode, OAuthError};
use crate::settings::Settings;
use crate::storage::{self, DeviceAuthorization, DeviceStatus};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use std::time::Duration;

/// Seconds added to the polling interval on every `slow_down`.
pub const SLOW_DOWN_STEP_SECS: i64 = 5;

const USER_CODE_ATTEMPTS: usize = 8;

/// An approved authorization that this poll consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedDevice {
    pub subject: String,
    pub scope: Option<String>,
}

#[derive(Clone)]
pub struct DeviceStore {
    db: DatabaseConnection,
    verification_uri: String,
    expires_in: i64,
    interval: i64,
    io_timeout: Duration,
}

/// Outcome of a user's approve or deny.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// This call moved the record out of `pending`
    Settled(DeviceAuthorization),
    /// The record was already in the requested state; nothing changed
    Unchanged(DeviceAuthorization),
}

impl Settlement {
    pub fn record(&self) -> &DeviceAuthorization {
        match self {
            Settlement::Settled(r) | Settlement::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> DeviceAuthorization {
        match self {
            Settlement::Settled(r) | Settlement::Unchanged(r) => r,
        }
    }
}

/// Canonical form of a user-typed code: trimmed, lowercase, `xxxx-xxxx`.
pub fn normalize_user_code(input: &str) -> String {
    let code = input.trim().to_ascii_lowercase();
    // anything non-ASCII cannot be a user code; leave it for the lookup to miss
    if code.len() == 8 && code.is_ascii() && !code.contains('-') {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code
    }
}

impl DeviceStore {
    pub fn new(db: DatabaseConnection, settings: &Settings) -> Self {
        Self {
            db,
            verification_uri: settings.verification_uri(),
            expires_in: crate::settings::ttl_secs(settings.device.expires_in_secs),
            interval: crate::settings::ttl_secs(settings.device.interval_secs),
            io_timeout: settings.database.io_timeout(),
        }
    }

    pub async fn create(
        &self,
        client_id: &str,
        scope: Option<String>,
    ) -> Result<DeviceAuthorization, CrabError> {
        let now = Utc::now().timestamp();
        let device_code = storage::random_token(32);

        for _ in 0..USER_CODE_ATTEMPTS {
            let user_code = storage::generate_user_code();
            let record = DeviceAuthorization {
                device_code: device_code.clone(),
                verification_uri_complete: Some(format!(
                    "{}?user_code={}",
                    self.verification_uri, user_code
                )),
                user_code,
                client_id: client_id.to_string(),
                scope: scope.clone(),
                verification_uri: self.verification_uri.clone(),
                status: DeviceStatus::Pending,
                subject: None,
                expires_in: self.expires_in,
                interval: self.interval,
                last_poll_at: None,
                created_at: now,
                updated_at: now,
            };

            let inserted = storage::with_timeout(self.io_timeout, async {
                storage::purge_expired_user_code(&self.db, &record.user_code, now).await?;
                storage::insert_device_authorization(&self.db, &record).await
            })
            .await?;
            if inserted {
                tracing::info!(client_id = %client_id, user_code = %record.user_code, "Created device authorization");
                return Ok(record);
            }
            tracing::debug!(user_code = %record.user_code, "User code collision, drawing another");
        }

        Err(CrabError::Other(
            "could not allocate a unique user code".to_string(),
        ))
    }

    /// Pending or settled record for a user code; expired records read as `None`.
    pub async fn lookup_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorization>, CrabError> {
        let now = Utc::now().timestamp();
        let record = self.fetch_by_user_code(&normalize_user_code(user_code)).await?;
        Ok(record.filter(|r| !r.is_expired_at(now)))
    }

    pub async fn approve(
        &self,
        user_code: &str,
        subject: &str,
    ) -> Result<Settlement, OAuthError> {
        self.settle_by_user(user_code, DeviceStatus::Approved, Some(subject))
            .await
    }

    pub async fn deny(&self, user_code: &str) -> Result<Settlement, OAuthError> {
        self.settle_by_user(user_code, DeviceStatus::Denied, None)
            .await
    }

    async fn settle_by_user(
        &self,
        user_code: &str,
        target: DeviceStatus,
        subject: Option<&str>,
    ) -> Result<Settlement, OAuthError> {
        let user_code = normalize_user_code(user_code);
        let now = Utc::now().timestamp();

        // the second pass only runs if another request moved the record under us
        for _ in 0..2 {
            let record = self
                .fetch_by_user_code(&user_code)
                .await?
                .ok_or_else(|| OAuthError::invalid_grant("unknown user code"))?;
            if record.is_expired_at(now) {
                return Err(OAuthError::new(
                    ErrorCode::ExpiredToken,
                    "device authorization has expired",
                ));
            }

            match record.status {
                s if s == target => {
                    // only the user who approved may repeat the approval
                    if subject.is_some() && record.subject.as_deref() != subject {
                        return Err(OAuthError::invalid_grant(
                            "device authorization was approved by another user",
                        ));
                    }
                    return Ok(Settlement::Unchanged(record));
                }
                DeviceStatus::Pending => {
                    let moved = storage::with_timeout(
                        self.io_timeout,
                        storage::transition_device_status(
                            &self.db,
                            &record.device_code,
                            DeviceStatus::Pending,
                            target,
                            subject,
                            now,
                        ),
                    )
                    .await?;
                    if moved {
                        tracing::info!(user_code = %user_code, status = %target, "Device authorization settled");
                        return Ok(Settlement::Settled(DeviceAuthorization {
                            status: target,
                            subject: subject.map(str::to_string).or(record.subject),
                            updated_at: now,
                            ..record
                        }));
                    }
                }
                DeviceStatus::Denied => {
                    return Err(OAuthError::new(
                        ErrorCode::AccessDenied,
                        "device authorization was denied",
                    ))
                }
                DeviceStatus::Approved => {
                    return Err(OAuthError::invalid_grant(
                        "device authorization was already approved",
                    ))
                }
                DeviceStatus::Consumed => {
                    return Err(OAuthError::invalid_grant(
                        "device authorization was already used",
                    ))
                }
            }
        }

        Err(OAuthError::invalid_grant(
            "device authorization changed concurrently",
        ))
    }

    pub async fn poll_by_device_code(
        &self,
        device_code: &str,
        client_id: &str,
    ) -> Result<ApprovedDevice, OAuthError> {
        self.poll_at(device_code, client_id, Utc::now().timestamp())
            .await
    }

    /// Poll as of `now` (unix seconds).
    pub async fn poll_at(
        &self,
        device_code: &str,
        client_id: &str,
        now: i64,
    ) -> Result<ApprovedDevice, OAuthError> {
        let record = self.fetch_for_poll(device_code, client_id, now).await?;
        if record.status != DeviceStatus::Pending {
            return self.settle_poll(record, now).await;
        }

        if let Some(last) = record.last_poll_at {
            if now - last < record.interval {
                storage::with_timeout(
                    self.io_timeout,
                    storage::slow_down_device(
                        &self.db,
                        device_code,
                        record.last_poll_at,
                        SLOW_DOWN_STEP_SECS,
                        now,
                    ),
                )
                .await?;
                return Err(slow_down(record.interval + SLOW_DOWN_STEP_SECS));
            }
        }

        let recorded = storage::with_timeout(
            self.io_timeout,
            storage::record_device_poll(&self.db, device_code, record.last_poll_at, now),
        )
        .await?;
        if recorded {
            return Err(OAuthError::new(
                ErrorCode::AuthorizationPending,
                "the user has not yet completed authorization",
            ));
        }

        // lost the compare-and-set: a concurrent poll or a consent step won
        let current = self.fetch_for_poll(device_code, client_id, now).await?;
        match current.status {
            DeviceStatus::Pending => Err(slow_down(current.interval)),
            _ => self.settle_poll(current, now).await,
        }
    }

    async fn settle_poll(
        &self,
        record: DeviceAuthorization,
        now: i64,
    ) -> Result<ApprovedDevice, OAuthError> {
        match record.status {
            DeviceStatus::Pending => Err(slow_down(record.interval)),
            DeviceStatus::Denied => Err(OAuthError::new(
                ErrorCode::AccessDenied,
                "the user denied the authorization request",
            )),
            DeviceStatus::Consumed => Err(OAuthError::invalid_grant(
                "device code was already used",
            )),
            DeviceStatus::Approved => {
                let subject = record.subject.clone().ok_or_else(|| {
                    CrabError::Other(format!(
                        "approved device authorization {} has no subject",
                        record.user_code
                    ))
                })?;
                let consumed = storage::with_timeout(
                    self.io_timeout,
                    storage::transition_device_status(
                        &self.db,
                        &record.device_code,
                        DeviceStatus::Approved,
                        DeviceStatus::Consumed,
                        None,
                        now,
                    ),
                )
                .await?;
                if !consumed {
                    return Err(OAuthError::invalid_grant("device code was already used"));
                }
                tracing::info!(client_id = %record.client_id, "Device code exchanged");
                Ok(ApprovedDevice {
                    subject,
                    scope: record.scope,
                })
            }
        }
    }

    async fn fetch_for_poll(
        &self,
        device_code: &str,
        client_id: &str,
        now: i64,
    ) -> Result<DeviceAuthorization, OAuthError> {
        let record = storage::with_timeout(
            self.io_timeout,
            storage::get_device_by_device_code(&self.db, device_code),
        )
        .await?
        .ok_or_else(|| OAuthError::invalid_grant("unknown device code"))?;

        if record.client_id != client_id {
            return Err(OAuthError::invalid_grant(
                "device code was issued to another client",
            ));
        }
        if record.is_expired_at(now) {
            return Err(OAuthError::new(
                ErrorCode::ExpiredToken,
                "device code has expired",
            ));
        }
        Ok(record)
    }

    async fn fetch_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthorization>, CrabError> {
        storage::with_timeout(
            self.io_timeout,
            storage::get_device_by_user_code(&self.db, user_code),
        )
        .await
    }
}

fn slow_down(interval: i64) -> OAuthError {
    OAuthError::new(
        ErrorCode::SlowDown,
        format!("polling too fast; wait at least {interval} seconds between requests"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_settings, TestDb};
    use sea_orm::sea_query::Expr;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

    fn store(test_db: &TestDb) -> DeviceStore {
        DeviceStore::new(test_db.connection().clone(), &test_settings())
    }

    async fn backdate(test_db: &TestDb, device_code: &str, secs: i64) {
        use crate::entities::device_authorization::{Column, Entity};
        Entity::update_many()
            .col_expr(Column::CreatedAt, Expr::col(Column::CreatedAt).sub(secs))
            .filter(Column::DeviceCode.eq(device_code))
            .exec(test_db.connection())
            .await
            .unwrap();
    }

    #[test]
    fn test_normalize_user_code() {
        assert_eq!(normalize_user_code("  BCDF-GHJK "), "bcdf-ghjk");
        assert_eq!(normalize_user_code("bcdfghjk"), "bcdf-ghjk");
        assert_eq!(normalize_user_code("bc"), "bc");
        // 8 bytes but not 8 characters
        assert_eq!(normalize_user_code("aa\u{20ac}bcd"), "aa\u{20ac}bcd");
    }

    #[tokio::test]
    async fn test_non_ascii_user_code_is_unknown() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        devices.create("c1", None).await.unwrap();

        assert!(devices.lookup_by_user_code("aa€bcd").await.unwrap().is_none());
        let err = devices.approve("aa€bcd", "user-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_second_user_cannot_reapprove() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();

        devices.approve(&record.user_code, "user-a").await.unwrap();
        let err = devices.approve(&record.user_code, "user-b").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);

        let grant = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap();
        assert_eq!(grant.subject, "user-a");
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);

        let record = devices.create("c1", Some("read".to_string())).await.unwrap();
        assert_eq!(record.status, DeviceStatus::Pending);
        assert_eq!(record.expires_in, 1800);
        assert_eq!(record.interval, 5);
        assert_eq!(record.device_code.len(), 43);
        assert_ne!(record.device_code, record.user_code);
        assert_eq!(
            record.verification_uri,
            "http://localhost:8080/oauth/consent-form"
        );
        assert_eq!(
            record.verification_uri_complete.as_deref(),
            Some(format!("{}?user_code={}", record.verification_uri, record.user_code).as_str())
        );
    }

    #[tokio::test]
    async fn test_lookup_accepts_sloppy_input() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();

        let typed = format!(" {} ", record.user_code.to_uppercase());
        let found = devices.lookup_by_user_code(&typed).await.unwrap().unwrap();
        assert_eq!(found.device_code, record.device_code);
        assert!(devices.lookup_by_user_code("zzzz-zzzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_record_is_not_found_and_cannot_be_polled() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();
        backdate(&test_db, &record.device_code, 1800).await;

        assert!(devices
            .lookup_by_user_code(&record.user_code)
            .await
            .unwrap()
            .is_none());
        let err = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExpiredToken);
        let err = devices.approve(&record.user_code, "user-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExpiredToken);
    }

    #[tokio::test]
    async fn test_pending_then_approved_then_consumed() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", Some("read".to_string())).await.unwrap();

        let err = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationPending);

        let approved = devices.approve(&record.user_code, "user-1").await.unwrap();
        assert!(matches!(approved, Settlement::Settled(_)));
        assert_eq!(approved.record().status, DeviceStatus::Approved);
        // approving twice is a no-op
        let again = devices.approve(&record.user_code, "user-1").await.unwrap();
        assert!(matches!(again, Settlement::Unchanged(_)));

        let grant = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap();
        assert_eq!(
            grant,
            ApprovedDevice {
                subject: "user-1".to_string(),
                scope: Some("read".to_string()),
            }
        );

        let err = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_denied_yields_access_denied() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();

        devices.deny(&record.user_code).await.unwrap();
        devices.deny(&record.user_code).await.unwrap();

        let err = devices
            .poll_by_device_code(&record.device_code, "c1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);

        let err = devices.approve(&record.user_code, "user-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn test_approved_record_cannot_be_denied() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();

        devices.approve(&record.user_code, "user-1").await.unwrap();
        let err = devices.deny(&record.user_code).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_polling_too_fast_slows_down() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();
        let t0 = record.created_at;

        let first = devices.poll_at(&record.device_code, "c1", t0).await.unwrap_err();
        assert_eq!(first.code(), ErrorCode::AuthorizationPending);

        let fast = devices
            .poll_at(&record.device_code, "c1", t0 + 2)
            .await
            .unwrap_err();
        assert_eq!(fast.code(), ErrorCode::SlowDown);

        let stored = storage::get_device_by_device_code(test_db.connection(), &record.device_code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.interval, 10);

        // the old interval is no longer enough
        let still_fast = devices
            .poll_at(&record.device_code, "c1", t0 + 9)
            .await
            .unwrap_err();
        assert_eq!(still_fast.code(), ErrorCode::SlowDown);

        let patient = devices
            .poll_at(&record.device_code, "c1", t0 + 9 + 15)
            .await
            .unwrap_err();
        assert_eq!(patient.code(), ErrorCode::AuthorizationPending);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_device_codes() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();

        let err = devices.poll_by_device_code("nope", "c1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);

        let err = devices
            .poll_by_device_code(&record.device_code, "c2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_concurrent_exchange_has_one_winner() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);
        let record = devices.create("c1", None).await.unwrap();
        devices.approve(&record.user_code, "user-1").await.unwrap();

        let (a, b) = tokio::join!(
            devices.poll_by_device_code(&record.device_code, "c1"),
            devices.poll_by_device_code(&record.device_code, "c1"),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn test_user_codes_unique_among_live_records() {
        let test_db = TestDb::new().await;
        let devices = store(&test_db);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..25 {
            let record = devices.create("c1", None).await.unwrap();
            assert!(seen.insert(record.user_code));
        }
    }
}
