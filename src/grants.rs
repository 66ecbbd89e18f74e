//! Grant processing: token endpoint dispatch, the authorization endpoint,
//! device authorization and device-flow consent.
//!
//! Token requests arrive as a flat form of optional fields and are turned
//! into one [`TokenRequest`] variant per grant before any handler runs.

use crate::auth_codes::{AuthCodeStore, CodeRequest};
use crate::devices::{DeviceStore, Settlement};
use crate::errors::{CrabError, ErrorCode, OAuthError};
use crate::pkce::CodeChallengeMethod;
use crate::settings::Settings;
use crate::storage;
use crate::tokens::{TokenLifetime, TokenService};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Raw token endpoint input; every field optional until the grant is known.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub scope: Option<String>,
    pub device_code: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCodeRequest {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    pub username: String,
    pub password: String,
    pub scope: Option<String>,
    pub client_id: Option<String>,
}

impl std::fmt::Debug for PasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("scope", &self.scope)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeRequest {
    pub device_code: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    AuthorizationCode(AuthorizationCodeRequest),
    Password(PasswordRequest),
    DeviceCode(DeviceCodeRequest),
    RefreshToken(RefreshTokenRequest),
}

fn required(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("missing {name}")))
}

fn optional(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<TokenForm> for TokenRequest {
    type Error = OAuthError;

    fn try_from(form: TokenForm) -> Result<Self, Self::Error> {
        let grant_type = required(form.grant_type, "grant_type")?;
        match grant_type.as_str() {
            "authorization_code" => Ok(TokenRequest::AuthorizationCode(
                AuthorizationCodeRequest {
                    code: required(form.code, "code")?,
                    client_id: required(form.client_id, "client_id")?,
                    redirect_uri: optional(form.redirect_uri),
                    code_verifier: optional(form.code_verifier),
                },
            )),
            "password" => Ok(TokenRequest::Password(PasswordRequest {
                username: required(form.username, "username")?,
                password: required(form.password, "password")?,
                scope: optional(form.scope),
                client_id: optional(form.client_id),
            })),
            DEVICE_CODE_GRANT_TYPE => Ok(TokenRequest::DeviceCode(DeviceCodeRequest {
                device_code: required(form.device_code, "device_code")?,
                client_id: required(form.client_id, "client_id")?,
            })),
            "refresh_token" => Ok(TokenRequest::RefreshToken(RefreshTokenRequest {
                refresh_token: required(form.refresh_token, "refresh_token")?,
                client_id: optional(form.client_id),
            })),
            other => Err(OAuthError::invalid_request(format!(
                "unsupported grant_type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeQuery {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Where the browser goes after an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// Not signed in yet; come back to the original URL afterwards
    SignIn(String),
    /// The client or redirect URI cannot be trusted, so errors stay on our origin
    ErrorPage(String),
    /// Back to the client's redirect URI with a code, token or error
    Client(String),
}

impl AuthorizeOutcome {
    pub fn location(&self) -> &str {
        match self {
            AuthorizeOutcome::SignIn(l)
            | AuthorizeOutcome::ErrorPage(l)
            | AuthorizeOutcome::Client(l) => l,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConsentOutcome {
    Approved {
        code: String,
        scope: Option<String>,
        state: Option<String>,
    },
    Denied {
        status: &'static str,
    },
    /// Repeat approval by the same user; no new code is minted
    Unchanged {
        status: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    pub interval: i64,
}

pub fn url_append_query(mut base: String, params: &[(&str, String)]) -> String {
    let qs = serde_urlencoded::to_string(params).unwrap_or_default();
    if base.contains('?') {
        base.push('&');
    } else {
        base.push('?');
    }
    base.push_str(&qs);
    base
}

fn url_append_fragment(mut base: String, params: &[(&str, String)]) -> String {
    let fragment = serde_urlencoded::to_string(params).unwrap_or_default();
    base.push('#');
    base.push_str(&fragment);
    base
}

fn error_params(error: ErrorCode, desc: &str, state: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![("error", error.as_str().to_string())];
    if !desc.is_empty() {
        params.push(("error_description", desc.to_string()));
    }
    if let Some(s) = state {
        params.push(("state", s.to_string()));
    }
    params
}

#[derive(Clone)]
pub struct GrantDispatcher {
    db: DatabaseConnection,
    settings: Arc<Settings>,
    tokens: TokenService,
    codes: AuthCodeStore,
    devices: DeviceStore,
}

impl GrantDispatcher {
    pub fn new(db: DatabaseConnection, settings: Arc<Settings>, tokens: TokenService) -> Self {
        let io_timeout = settings.database.io_timeout();
        Self {
            codes: AuthCodeStore::new(db.clone(), settings.tokens.auth_code_ttl_secs, io_timeout),
            devices: DeviceStore::new(db.clone(), &settings),
            db,
            settings,
            tokens,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    pub fn codes(&self) -> &AuthCodeStore {
        &self.codes
    }

    fn io_timeout(&self) -> Duration {
        self.settings.database.io_timeout()
    }

    pub async fn handle_token_request(
        &self,
        request: TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        match request {
            TokenRequest::AuthorizationCode(req) => self.authorization_code_grant(req).await,
            TokenRequest::Password(req) => self.password_grant(req).await,
            TokenRequest::DeviceCode(req) => self.device_code_grant(req).await,
            TokenRequest::RefreshToken(req) => self.refresh_token_grant(req).await,
        }
    }

    async fn authorization_code_grant(
        &self,
        req: AuthorizationCodeRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let redeemed = self
            .codes
            .redeem(
                &req.code,
                req.redirect_uri.as_deref(),
                &req.client_id,
                req.code_verifier.as_deref(),
            )
            .await?;
        tracing::info!(client_id = %req.client_id, "Authorization code exchanged");
        self.issue_with_session(&req.client_id, &redeemed.subject, redeemed.scope)
            .await
    }

    async fn password_grant(&self, req: PasswordRequest) -> Result<TokenResponse, OAuthError> {
        let user = storage::with_timeout(
            self.io_timeout(),
            storage::verify_user_password(&self.db, &req.username, &req.password),
        )
        .await?
        .ok_or_else(|| {
            tracing::warn!(username = %req.username, "Password grant with bad credentials");
            OAuthError::invalid_grant("invalid username or password")
        })?;

        let mut claims = BTreeMap::from([("username".to_string(), user.username.clone())]);
        if let Some(scope) = &req.scope {
            claims.insert("scope".to_string(), scope.clone());
        }
        let signed = self
            .tokens
            .sign(&user.subject, &claims, TokenLifetime::Password)
            .await?;

        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: signed.expires_in,
            refresh_token: None,
            scope: req.scope,
        })
    }

    async fn device_code_grant(&self, req: DeviceCodeRequest) -> Result<TokenResponse, OAuthError> {
        let approved = self
            .devices
            .poll_by_device_code(&req.device_code, &req.client_id)
            .await?;
        self.issue_with_session(&req.client_id, &approved.subject, approved.scope)
            .await
    }

    async fn refresh_token_grant(
        &self,
        req: RefreshTokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let session = storage::with_timeout(
            self.io_timeout(),
            storage::get_token_session(&self.db, &req.refresh_token),
        )
        .await?
        .ok_or_else(|| OAuthError::invalid_grant("refresh token is invalid, expired or revoked"))?;

        if let Some(client_id) = &req.client_id {
            if *client_id != session.client_id {
                return Err(OAuthError::invalid_grant("client_id mismatch"));
            }
        }

        let signed = self
            .tokens
            .sign(
                &session.subject,
                &scope_claims(session.scope.as_deref()),
                TokenLifetime::Standard,
            )
            .await?;
        let still_live = storage::with_timeout(
            self.io_timeout(),
            storage::update_session_access_token(&self.db, &session.refresh_token, &signed.token),
        )
        .await?;
        if !still_live {
            return Err(OAuthError::invalid_grant("refresh token was revoked"));
        }

        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: signed.expires_in,
            refresh_token: Some(session.refresh_token),
            scope: session.scope,
        })
    }

    async fn issue_with_session(
        &self,
        client_id: &str,
        subject: &str,
        scope: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let signed = self
            .tokens
            .sign(subject, &scope_claims(scope.as_deref()), TokenLifetime::Standard)
            .await?;
        let session = storage::with_timeout(
            self.io_timeout(),
            storage::create_token_session(
                &self.db,
                &signed.token,
                client_id,
                subject,
                scope.clone(),
                crate::settings::ttl_secs(self.settings.tokens.refresh_ttl_secs),
            ),
        )
        .await?;

        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: signed.expires_in,
            refresh_token: Some(session.refresh_token),
            scope,
        })
    }

    pub async fn handle_device_authorization(
        &self,
        client_id: Option<String>,
        scope: Option<String>,
    ) -> Result<DeviceAuthorizationResponse, OAuthError> {
        let client_id = required(client_id, "client_id")?;
        let known = storage::with_timeout(
            self.io_timeout(),
            storage::get_client(&self.db, &client_id),
        )
        .await?;
        if known.is_none() {
            if !self.settings.device.auto_register_clients {
                return Err(OAuthError::new(ErrorCode::InvalidClient, "unknown client"));
            }
            storage::with_timeout(self.io_timeout(), storage::ensure_client(&self.db, &client_id))
                .await?;
            tracing::info!(client_id = %client_id, "Auto-registered device client");
        }

        let record = self.devices.create(&client_id, optional(scope)).await?;
        Ok(DeviceAuthorizationResponse {
            device_code: record.device_code,
            user_code: record.user_code,
            verification_uri: record.verification_uri,
            verification_uri_complete: record.verification_uri_complete,
            expires_in: record.expires_in,
            interval: record.interval,
        })
    }

    /// Authorization endpoint. `original_url` is the request path and query,
    /// replayed after sign-in; `subject` is the signed-in user, if any.
    pub async fn handle_authorization_request(
        &self,
        query: &AuthorizeQuery,
        original_url: &str,
        subject: Option<&str>,
    ) -> Result<AuthorizeOutcome, CrabError> {
        let Some(subject) = subject else {
            return Ok(AuthorizeOutcome::SignIn(url_append_query(
                self.settings.server.sign_in_path.clone(),
                &[("redirect", original_url.to_string())],
            )));
        };

        let Some(client_id) = query.client_id.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(self.error_page(ErrorCode::InvalidRequest, "missing client_id"));
        };
        let Some(client) = storage::with_timeout(
            self.io_timeout(),
            storage::get_client(&self.db, client_id),
        )
        .await?
        else {
            return Ok(self.error_page(ErrorCode::InvalidClient, "unknown client"));
        };

        let redirect_uri = match (query.redirect_uri.as_deref(), client.redirect_uri.as_deref()) {
            (Some(asked), Some(registered)) if asked != registered => {
                return Ok(self.error_page(ErrorCode::InvalidRequest, "redirect_uri mismatch"));
            }
            (_, Some(registered)) => registered.to_string(),
            // device-only and auto-registered clients have nowhere to be redirected
            (_, None) => {
                return Ok(self.error_page(
                    ErrorCode::InvalidRequest,
                    "client has no registered redirect_uri",
                ));
            }
        };
        let state = query.state.as_deref();

        match query.response_type.as_deref() {
            Some("code") => {
                let method = match query.code_challenge_method.as_deref() {
                    Some(m) => match m.parse::<CodeChallengeMethod>() {
                        Ok(m) => Some(m),
                        Err(e) => {
                            let desc = e.error_description.unwrap_or_default();
                            return Ok(AuthorizeOutcome::Client(url_append_query(
                                redirect_uri,
                                &error_params(ErrorCode::InvalidRequest, &desc, state),
                            )));
                        }
                    },
                    None => None,
                };

                let code = self
                    .codes
                    .issue(CodeRequest {
                        client_id: client.client_id.clone(),
                        subject: subject.to_string(),
                        redirect_uri: Some(redirect_uri.clone()),
                        code_challenge: query.code_challenge.clone(),
                        code_challenge_method: method,
                        scope: query.scope.clone(),
                    })
                    .await?;

                let mut params = vec![("code", code.code)];
                if let Some(s) = state {
                    params.push(("state", s.to_string()));
                }
                if let Some(scope) = &query.scope {
                    params.push(("scope", scope.clone()));
                }
                Ok(AuthorizeOutcome::Client(url_append_query(redirect_uri, &params)))
            }
            Some("token") => {
                let signed = self
                    .tokens
                    .sign(
                        subject,
                        &scope_claims(query.scope.as_deref()),
                        TokenLifetime::Standard,
                    )
                    .await?;
                let mut params = vec![
                    ("access_token", signed.token),
                    ("token_type", "Bearer".to_string()),
                    ("expires_in", signed.expires_in.to_string()),
                ];
                if let Some(s) = state {
                    params.push(("state", s.to_string()));
                }
                Ok(AuthorizeOutcome::Client(url_append_fragment(redirect_uri, &params)))
            }
            None => Ok(AuthorizeOutcome::Client(url_append_query(
                redirect_uri,
                &error_params(ErrorCode::InvalidRequest, "missing response_type", state),
            ))),
            Some(other) => {
                tracing::debug!(response_type = %other, "Unsupported response_type");
                Ok(AuthorizeOutcome::Client(url_append_query(
                    redirect_uri,
                    &error_params(
                        ErrorCode::UnsupportedResponseType,
                        "response_type must be code or token",
                        state,
                    ),
                )))
            }
        }
    }

    fn error_page(&self, error: ErrorCode, desc: &str) -> AuthorizeOutcome {
        AuthorizeOutcome::ErrorPage(url_append_query(
            self.settings.server.error_path.clone(),
            &error_params(error, desc, None),
        ))
    }

    /// Device-flow consent: settles the authorization named by `otp` (the user code).
    ///
    /// A first approval also mints an authorization code bound to the
    /// device's client and scope.
    pub async fn handle_consent(
        &self,
        otp: &str,
        subject: &str,
        decision: ConsentDecision,
        state: Option<String>,
    ) -> Result<ConsentOutcome, OAuthError> {
        match decision {
            ConsentDecision::Deny => {
                self.devices.deny(otp).await?;
                Ok(ConsentOutcome::Denied { status: "denied" })
            }
            ConsentDecision::Approve => {
                let record = match self.devices.approve(otp, subject).await? {
                    Settlement::Settled(record) => record,
                    Settlement::Unchanged(_) => {
                        return Ok(ConsentOutcome::Unchanged { status: "approved" })
                    }
                };
                let code = self
                    .codes
                    .issue(CodeRequest {
                        client_id: record.client_id.clone(),
                        subject: subject.to_string(),
                        scope: record.scope.clone(),
                        ..Default::default()
                    })
                    .await?;
                Ok(ConsentOutcome::Approved {
                    code: code.code,
                    scope: record.scope,
                    state,
                })
            }
        }
    }
}

fn scope_claims(scope: Option<&str>) -> BTreeMap<String, String> {
    scope
        .map(|s| BTreeMap::from([("scope".to_string(), s.to_string())]))
        .unwrap_or_default()
}
