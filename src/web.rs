//! HTTP surface of the authorization server.
//!
//! Handlers stay thin: they extract input, hand it to the [`GrantDispatcher`]
//! or [`TokenService`], and shape the response. Protocol failures render
//! through [`OAuthError`]'s `IntoResponse`.
use crate::errors::{ErrorCode, OAuthError};
use crate::grants::{
    AuthorizeQuery, ConsentDecision, GrantDispatcher, TokenForm, TokenRequest,
};
use crate::keys::KeyManager;
use crate::session::{self, TokenCookie};
use crate::settings::Settings;
use crate::tokens::{self, TokenService};
use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub keys: KeyManager,
    pub tokens: TokenService,
    pub grants: GrantDispatcher,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection) -> Self {
        let settings = Arc::new(settings);
        let keys = KeyManager::new(
            db.clone(),
            settings.keys.clone(),
            settings.database.io_timeout(),
        );
        let tokens = TokenService::new(keys.clone(), &settings);
        let grants = GrantDispatcher::new(db.clone(), settings.clone(), tokens.clone());
        Self {
            settings,
            db,
            keys,
            tokens,
            grants,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'; form-action 'self'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/oauth2/device/code", post(device_authorization))
        .route("/device_authorization", post(device_authorization))
        .route("/oauth2/auth", get(authorize))
        .route("/oauth2/token", post(token))
        .route("/oauth2/consent", post(consent))
        .route("/oauth2/userInfo", get(userinfo).post(userinfo))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    // Warm the key so the first token request does not pay for RSA generation.
    let kid = state.keys.signing_key().await.into_diagnostic()?.kid().to_string();
    tracing::info!(%kid, issuer = %state.settings.issuer(), "Signing key ready");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Public API listening");
    axum::serve(listener, router(state)).await.into_diagnostic()?;
    Ok(())
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.settings.issuer();
    let metadata = json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{}/oauth2/auth", issuer),
        "token_endpoint": format!("{}/oauth2/token", issuer),
        "device_authorization_endpoint": format!("{}/oauth2/device/code", issuer),
        "userinfo_endpoint": format!("{}/oauth2/userInfo", issuer),
        "jwks_uri": format!("{}/.well-known/jwks.json", issuer),
        "response_types_supported": ["code", "token"],
        "grant_types_supported": [
            "authorization_code",
            "password",
            "refresh_token",
            crate::grants::DEVICE_CODE_GRANT_TYPE,
        ],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [state.settings.keys.alg],
        "token_endpoint_auth_methods_supported": ["none"],
        "code_challenge_methods_supported": ["plain", "S256"],
    });
    Json(metadata)
}

async fn jwks_handler(State(state): State<AppState>) -> Result<Response, OAuthError> {
    let jwks = state.keys.jwks_json().await?;
    Ok(Json(jwks).into_response())
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

fn no_store_headers() -> Vec<(&'static str, String)> {
    vec![
        ("cache-control", "no-store".to_string()),
        ("pragma", "no-cache".to_string()),
    ]
}

/// Form bodies are parsed whatever the declared content type, so a bad body
/// still gets an OAuth error rather than an extractor rejection.
fn parse_form<T: DeserializeOwned>(body: &[u8]) -> Result<T, OAuthError> {
    serde_urlencoded::from_bytes(body)
        .map_err(|e| OAuthError::invalid_request(format!("malformed form body: {e}")))
}

/// Body fields win; the query string fills whatever the body left out.
fn merge_forms(body: TokenForm, query: TokenForm) -> TokenForm {
    TokenForm {
        grant_type: body.grant_type.or(query.grant_type),
        code: body.code.or(query.code),
        redirect_uri: body.redirect_uri.or(query.redirect_uri),
        client_id: body.client_id.or(query.client_id),
        code_verifier: body.code_verifier.or(query.code_verifier),
        username: body.username.or(query.username),
        password: body.password.or(query.password),
        scope: body.scope.or(query.scope),
        device_code: body.device_code.or(query.device_code),
        refresh_token: body.refresh_token.or(query.refresh_token),
    }
}

async fn token(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, OAuthError> {
    let body_form: TokenForm = parse_form(&body)?;
    let query_form: TokenForm = match query.as_deref() {
        Some(q) => serde_urlencoded::from_str(q)
            .map_err(|e| OAuthError::invalid_request(format!("malformed query: {e}")))?,
        None => TokenForm::default(),
    };

    let request = TokenRequest::try_from(merge_forms(body_form, query_form))?;
    let sets_cookie = matches!(request, TokenRequest::Password(_));
    let resp = state.grants.handle_token_request(request).await?;

    let mut headers = no_store_headers();
    if sets_cookie {
        let cookie = TokenCookie::new(resp.access_token.clone());
        headers.push((
            "set-cookie",
            cookie.to_cookie_header(&state.settings, resp.expires_in),
        ));
    }
    let value = serde_json::to_value(&resp).map_err(crate::errors::CrabError::from)?;
    Ok(json_with_headers(StatusCode::OK, value, &headers))
}

#[derive(Debug, Default, Deserialize)]
struct DeviceAuthorizationForm {
    client_id: Option<String>,
    scope: Option<String>,
}

async fn device_authorization(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, OAuthError> {
    let req: DeviceAuthorizationForm = parse_form(&body)?;
    let resp = state
        .grants
        .handle_device_authorization(req.client_id, req.scope)
        .await?;
    let value = serde_json::to_value(&resp).map_err(crate::errors::CrabError::from)?;
    Ok(json_with_headers(StatusCode::OK, value, &no_store_headers()))
}

/// Subject of the caller's access token, if it presented a valid one.
async fn authenticated_subject(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let token = session::presented_token(headers)?;
    match state.tokens.verify(&token).await {
        Ok(claims) => Some(claims.subject),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring invalid presented token");
            None
        }
    }
}

async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Result<Response, OAuthError> {
    let query: AuthorizeQuery = match query.as_deref() {
        Some(q) => serde_urlencoded::from_str(q)
            .map_err(|e| OAuthError::invalid_request(format!("malformed query: {e}")))?,
        None => AuthorizeQuery::default(),
    };
    let original = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let subject = authenticated_subject(&state, &headers).await;
    let outcome = state
        .grants
        .handle_authorization_request(&query, &original, subject.as_deref())
        .await?;
    let location = HeaderValue::from_str(outcome.location())
        .map_err(|e| crate::errors::CrabError::Other(format!("bad redirect location: {e}")))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[derive(Debug, Deserialize)]
struct ConsentForm {
    otp: Option<String>,
    decision: Option<String>,
    state: Option<String>,
}

async fn consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, OAuthError> {
    let form: ConsentForm = parse_form(&body)?;
    let subject = authenticated_subject(&state, &headers)
        .await
        .ok_or_else(|| OAuthError::invalid_token("sign in before granting consent"))?;
    let otp = form
        .otp
        .filter(|o| !o.is_empty())
        .ok_or_else(|| OAuthError::invalid_request("missing otp"))?;
    let decision = match form.decision.as_deref() {
        Some("approve") => ConsentDecision::Approve,
        Some("deny") => ConsentDecision::Deny,
        _ => {
            return Err(OAuthError::invalid_request(
                "decision must be approve or deny",
            ))
        }
    };

    let outcome = state
        .grants
        .handle_consent(&otp, &subject, decision, form.state)
        .await?;
    tracing::info!(subject = %subject, ?decision, "Device consent recorded");
    let value = serde_json::to_value(&outcome).map_err(crate::errors::CrabError::from)?;
    Ok(json_with_headers(StatusCode::OK, value, &no_store_headers()))
}

async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, OAuthError> {
    let token = session::presented_token(&headers)
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidToken, "no access token presented"))?;
    let verified = state.tokens.verify(&token).await?;
    let unverified = tokens::decode_unsafe(&token)?;

    let body = json!({
        "header": unverified.header,
        "claims": Value::Object(verified.payload),
    });
    Ok((
        StatusCode::OK,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(body),
    )
        .into_response())
}
