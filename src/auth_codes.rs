use crate::errors::{CrabError, OAuthError};
use crate::pkce::{self, CodeChallengeMethod};
use crate::storage::{self, AuthCode, NewAuthCode};
use sea_orm::DatabaseConnection;
use std::time::Duration;

/// What a successful redemption yields to the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemedCode {
    pub subject: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CodeRequest {
    pub client_id: String,
    pub subject: String,
    pub redirect_uri: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub scope: Option<String>,
}

#[derive(Clone)]
pub struct AuthCodeStore {
    db: DatabaseConnection,
    ttl_secs: i64,
    io_timeout: Duration,
}

impl AuthCodeStore {
    pub fn new(db: DatabaseConnection, ttl_secs: u64, io_timeout: Duration) -> Self {
        Self {
            db,
            ttl_secs: crate::settings::ttl_secs(ttl_secs),
            io_timeout,
        }
    }

    pub async fn issue(&self, req: CodeRequest) -> Result<AuthCode, CrabError> {
        // a challenge without an explicit method is plain (RFC 7636 §4.3)
        let method = req
            .code_challenge
            .as_ref()
            .map(|_| req.code_challenge_method.unwrap_or(CodeChallengeMethod::Plain));

        let input = NewAuthCode {
            client_id: req.client_id,
            subject: req.subject,
            redirect_uri: req.redirect_uri,
            scope: req.scope,
            code_challenge: req.code_challenge,
            code_challenge_method: method.map(|m| m.as_str().to_string()),
        };
        let code = storage::with_timeout(
            self.io_timeout,
            storage::issue_auth_code(&self.db, input, self.ttl_secs),
        )
        .await?;
        tracing::debug!(client_id = %code.client_id, "Issued authorization code");
        Ok(code)
    }

    /// Spends `code` and checks it against the presenting client.
    ///
    /// The code is consumed before any other check, so a failed attempt
    /// still burns it.
    pub async fn redeem(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
        client_id: &str,
        code_verifier: Option<&str>,
    ) -> Result<RedeemedCode, OAuthError> {
        let record = storage::with_timeout(self.io_timeout, storage::consume_auth_code(&self.db, code))
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("authorization code is invalid, expired or already used"))?;

        if record.client_id != client_id {
            tracing::warn!(expected = %record.client_id, got = %client_id, "Authorization code presented by another client");
            return Err(OAuthError::invalid_grant("client_id mismatch"));
        }
        if let Some(stored) = record.redirect_uri.as_deref() {
            if redirect_uri != Some(stored) {
                return Err(OAuthError::invalid_grant("redirect_uri mismatch"));
            }
        }
        pkce::check(
            record.code_challenge.as_deref(),
            record.code_challenge_method.as_deref(),
            code_verifier,
        )?;

        Ok(RedeemedCode {
            subject: record.subject,
            scope: record.scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::pkce::derive_challenge;
    use crate::test_support::TestDb;

    const VERIFIER: &str = "dBjftJeZ4CVP-1B5dYhKdsj9sLsR0sqBTgjw0mxSU-s";

    fn store(test_db: &TestDb) -> AuthCodeStore {
        AuthCodeStore::new(test_db.connection().clone(), 3600, Duration::from_secs(5))
    }

    fn s256_request() -> CodeRequest {
        CodeRequest {
            client_id: "c1".to_string(),
            subject: "user-1".to_string(),
            redirect_uri: Some("http://localhost:3000/cb".to_string()),
            code_challenge: Some(derive_challenge(VERIFIER, CodeChallengeMethod::S256)),
            code_challenge_method: Some(CodeChallengeMethod::S256),
            scope: Some("read write".to_string()),
        }
    }

    #[tokio::test]
    async fn test_issue_then_redeem() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);

        let code = codes.issue(s256_request()).await.unwrap();
        assert_eq!(code.expires_at - code.created_at, 3600);
        assert!(code.code.len() >= 32);

        let redeemed = codes
            .redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER))
            .await
            .unwrap();
        assert_eq!(
            redeemed,
            RedeemedCode {
                subject: "user-1".to_string(),
                scope: Some("read write".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_second_redemption_fails() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);
        let code = codes.issue(s256_request()).await.unwrap();

        codes
            .redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER))
            .await
            .unwrap();
        let err = codes
            .redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_yield_one_winner() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);
        let code = codes.issue(s256_request()).await.unwrap();

        let (a, b) = tokio::join!(
            codes.redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER)),
            codes.redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER)),
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_pkce_failures_are_invalid_grant() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);

        let missing = codes.issue(s256_request()).await.unwrap();
        let err = codes
            .redeem(&missing.code, Some("http://localhost:3000/cb"), "c1", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);

        let wrong = codes.issue(s256_request()).await.unwrap();
        let err = codes
            .redeem(&wrong.code, Some("http://localhost:3000/cb"), "c1", Some("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_client_and_redirect_mismatch() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);

        let code = codes.issue(s256_request()).await.unwrap();
        let err = codes
            .redeem(&code.code, Some("http://localhost:3000/cb"), "c2", Some(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.error_description.as_deref(), Some("client_id mismatch"));

        let code = codes.issue(s256_request()).await.unwrap();
        let err = codes
            .redeem(&code.code, Some("http://evil.example/cb"), "c1", Some(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.error_description.as_deref(), Some("redirect_uri mismatch"));
    }

    #[tokio::test]
    async fn test_challenge_defaults_to_plain() {
        let test_db = TestDb::new().await;
        let codes = store(&test_db);

        let code = codes
            .issue(CodeRequest {
                client_id: "c1".to_string(),
                subject: "user-1".to_string(),
                code_challenge: Some("plain-verifier".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(code.code_challenge_method.as_deref(), Some("plain"));

        assert!(codes
            .redeem(&code.code, None, "c1", Some("plain-verifier"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_code_is_invalid_grant() {
        let test_db = TestDb::new().await;
        let codes = AuthCodeStore::new(test_db.connection().clone(), 0, Duration::from_secs(5));

        let code = codes.issue(s256_request()).await.unwrap();
        let err = codes
            .redeem(&code.code, Some("http://localhost:3000/cb"), "c1", Some(VERIFIER))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }
}
