use crate::errors::{CrabError, OAuthError};
use crate::keys::KeyManager;
use crate::settings::{Settings, Tokens};
use base64ct::Encoding;
use josekit::jws::JwsHeader;
use josekit::jwt::{self, JwtPayload};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Claims the service sets itself; callers cannot override them.
const REGISTERED_CLAIMS: [&str; 7] = ["sub", "iss", "aud", "iat", "exp", "nbf", "jti"];

/// Access-token lifetime policy, declared by each grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLifetime {
    /// `tokens.access_ttl_secs`, two minutes by default
    Standard,
    /// `tokens.password_access_ttl_secs`, fifteen minutes by default
    Password,
}

impl TokenLifetime {
    pub fn ttl(&self, cfg: &Tokens) -> Duration {
        match self {
            TokenLifetime::Standard => Duration::from_secs(cfg.access_ttl_secs),
            TokenLifetime::Password => Duration::from_secs(cfg.password_access_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    pub subject: String,
    /// String-valued claims other than the registered ones
    pub claims: BTreeMap<String, String>,
    pub issued_at: Option<SystemTime>,
    pub expires_at: SystemTime,
    /// Full payload as signed
    pub payload: Map<String, Value>,
}

/// Header and payload of a token whose signature has NOT been checked.
#[derive(Debug, Clone, Serialize)]
pub struct UnverifiedToken {
    pub header: Value,
    pub payload: Value,
}

#[derive(Clone)]
pub struct TokenService {
    keys: KeyManager,
    audience: String,
    ttl: Tokens,
}

impl TokenService {
    pub fn new(keys: KeyManager, settings: &Settings) -> Self {
        Self {
            keys,
            audience: settings.token_audience(),
            ttl: settings.tokens.clone(),
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn ttl(&self, lifetime: TokenLifetime) -> Duration {
        lifetime.ttl(&self.ttl)
    }

    pub async fn sign(
        &self,
        subject: &str,
        claims: &BTreeMap<String, String>,
        lifetime: TokenLifetime,
    ) -> Result<SignedToken, CrabError> {
        self.sign_at(subject, claims, lifetime, SystemTime::now()).await
    }

    pub async fn sign_at(
        &self,
        subject: &str,
        claims: &BTreeMap<String, String>,
        lifetime: TokenLifetime,
        now: SystemTime,
    ) -> Result<SignedToken, CrabError> {
        let key = self.keys.signing_key().await?;
        let ttl = self.ttl(lifetime);

        // second precision so `iat`/`exp` survive the round trip unchanged
        let now = truncate_to_secs(now);
        let mut payload = JwtPayload::new();
        payload.set_subject(subject);
        for (name, value) in claims {
            if REGISTERED_CLAIMS.contains(&name.as_str()) {
                tracing::debug!(claim = %name, "Ignoring attempt to override registered claim");
                continue;
            }
            payload.set_claim(name, Some(Value::String(value.clone())))?;
        }
        payload.set_issued_at(&now);
        payload.set_issuer(&self.audience);
        payload.set_audience(vec![self.audience.clone()]);
        payload.set_expires_at(&(now + ttl));

        let mut header = JwsHeader::new();
        header.set_algorithm("RS256");
        header.set_token_type("JWT");
        header.set_key_id(key.kid());

        let token = jwt::encode_with_signer(&payload, &header, &key.signer)?;
        Ok(SignedToken {
            token,
            expires_in: ttl.as_secs(),
        })
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, OAuthError> {
        self.verify_at(token, SystemTime::now()).await
    }

    /// Verifies `token` as of `now`. Every token defect is `invalid_token`;
    /// only a store failure while resolving the key is `infrastructure_error`.
    pub async fn verify_at(&self, token: &str, now: SystemTime) -> Result<VerifiedClaims, OAuthError> {
        let unverified = decode_unsafe(token)?;
        let key = self.keys.signing_key().await?;

        match unverified.header.get("alg").and_then(Value::as_str) {
            Some("RS256") => {}
            Some(other) => {
                return Err(OAuthError::invalid_token(format!(
                    "unsupported algorithm {other}"
                )))
            }
            None => return Err(OAuthError::invalid_token("token header has no alg")),
        }
        match unverified.header.get("kid").and_then(Value::as_str) {
            Some(kid) if kid == key.kid() => {}
            Some(kid) => {
                return Err(OAuthError::invalid_token(format!("unknown key id {kid}")));
            }
            None => return Err(OAuthError::invalid_token("token header has no kid")),
        }

        let (payload, _header) = jwt::decode_with_verifier(token, &key.verifier)
            .map_err(|_| OAuthError::invalid_token("signature verification failed"))?;

        let expires_at = payload
            .expires_at()
            .ok_or_else(|| OAuthError::invalid_token("token has no exp"))?;
        if now >= expires_at {
            return Err(OAuthError::invalid_token("token expired"));
        }
        if payload.issuer() != Some(self.audience.as_str()) {
            return Err(OAuthError::invalid_token("issuer mismatch"));
        }
        let audience_ok = payload
            .audience()
            .is_some_and(|aud| aud.iter().any(|a| *a == self.audience));
        if !audience_ok {
            return Err(OAuthError::invalid_token("audience mismatch"));
        }
        let subject = payload
            .subject()
            .ok_or_else(|| OAuthError::invalid_token("token has no sub"))?
            .to_string();

        let claims = payload
            .claims_set()
            .iter()
            .filter(|(name, _)| !REGISTERED_CLAIMS.contains(&name.as_str()))
            .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
            .collect();

        Ok(VerifiedClaims {
            subject,
            claims,
            issued_at: payload.issued_at(),
            expires_at,
            payload: payload.claims_set().clone(),
        })
    }
}

fn truncate_to_secs(t: SystemTime) -> SystemTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_secs(d.as_secs()),
        Err(_) => t,
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Value, OAuthError> {
    let bytes = base64ct::Base64UrlUnpadded::decode_vec(segment)
        .map_err(|_| OAuthError::invalid_token(format!("token {what} is not base64url")))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| OAuthError::invalid_token(format!("token {what} is not JSON")))
}

/// Decodes header and payload WITHOUT checking the signature.
///
/// For diagnostics and display only. Never base an authorization decision
/// on the result; use [`TokenService::verify`] for that.
pub fn decode_unsafe(token: &str) -> Result<UnverifiedToken, OAuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(OAuthError::invalid_token("malformed token"));
    };

    Ok(UnverifiedToken {
        header: decode_segment(header, "header")?,
        payload: decode_segment(payload, "payload")?,
    })
}
