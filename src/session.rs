use crate::settings::Settings;
use axum::http::{header, HeaderMap};

pub const TOKEN_COOKIE_NAME: &str = "__token";

/// The access token a browser or client presents to `/oauth2/userInfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenCookie {
    pub access_token: String,
}

impl TokenCookie {
    pub fn new(access_token: String) -> Self {
        Self { access_token }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;

        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie
                .strip_prefix(TOKEN_COOKIE_NAME)
                .and_then(|s| s.strip_prefix('='))
            {
                if !value.is_empty() {
                    return Some(Self::new(value.to_string()));
                }
            }
        }
        None
    }

    pub fn to_cookie_header(&self, settings: &Settings, max_age: u64) -> String {
        let secure = settings.issuer().starts_with("https://");

        format!(
            "{}={}; HttpOnly; {}SameSite=Strict; Path=/; Max-Age={}",
            TOKEN_COOKIE_NAME,
            self.access_token,
            if secure { "Secure; " } else { "" },
            max_age
        )
    }
}

/// Bearer credential from `Authorization`, falling back to the `__token` cookie.
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            h.strip_prefix("Bearer ")
                .or_else(|| h.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    bearer.or_else(|| TokenCookie::from_headers(headers).map(|c| c.access_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; __token=abc.def.ghi; other=1"),
        );
        assert_eq!(
            TokenCookie::from_headers(&headers),
            Some(TokenCookie::new("abc.def.ghi".to_string()))
        );

        headers.insert(header::COOKIE, HeaderValue::from_static("__tokenx=1; __token="));
        assert_eq!(TokenCookie::from_headers(&headers), None);
    }

    #[test]
    fn test_bearer_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("__token=from-cookie"));
        assert_eq!(presented_token(&headers).as_deref(), Some("from-cookie"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(presented_token(&headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_cookie_header_attributes() {
        let mut settings = Settings::default();
        let cookie = TokenCookie::new("tok".to_string());

        let plain = cookie.to_cookie_header(&settings, 900);
        assert_eq!(plain, "__token=tok; HttpOnly; SameSite=Strict; Path=/; Max-Age=900");

        settings.server.public_base_url = Some("https://id.example.com".to_string());
        assert!(cookie.to_cookie_header(&settings, 900).contains("Secure; "));
    }
}
