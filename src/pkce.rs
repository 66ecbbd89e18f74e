//! Proof Key for Code Exchange (RFC 7636).
//!
//! A code issued with a `code_challenge` can only be redeemed by a request
//! presenting a `code_verifier` that derives the same challenge.

use crate::errors::OAuthError;
use base64ct::Encoding;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    Plain,
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::Plain => "plain",
            CodeChallengeMethod::S256 => "S256",
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(CodeChallengeMethod::Plain),
            "S256" => Ok(CodeChallengeMethod::S256),
            other => Err(OAuthError::invalid_request(format!(
                "unsupported code_challenge_method {other}"
            ))),
        }
    }
}

pub fn derive_challenge(verifier: &str, method: CodeChallengeMethod) -> String {
    match method {
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => {
            let digest = Sha256::digest(verifier.as_bytes());
            base64ct::Base64UrlUnpadded::encode_string(&digest)
        }
    }
}

/// Recomputes the challenge from `verifier` and compares it in constant time.
pub fn verify(stored_challenge: &str, method: CodeChallengeMethod, verifier: &str) -> bool {
    let derived = derive_challenge(verifier, method);
    derived.as_bytes().ct_eq(stored_challenge.as_bytes()).into()
}

/// Enforces PKCE for a redemption.
///
/// No stored challenge means the code was issued without PKCE. A stored
/// challenge without a verifier is never skipped.
pub fn check(
    stored_challenge: Option<&str>,
    stored_method: Option<&str>,
    verifier: Option<&str>,
) -> Result<(), OAuthError> {
    let Some(challenge) = stored_challenge else {
        return Ok(());
    };
    let method = match stored_method {
        Some(m) => m
            .parse::<CodeChallengeMethod>()
            .map_err(|_| OAuthError::invalid_grant("stored code_challenge_method is invalid"))?,
        None => CodeChallengeMethod::Plain,
    };
    let verifier =
        verifier.ok_or_else(|| OAuthError::invalid_grant("code_verifier is required"))?;
    if verify(challenge, method, verifier) {
        Ok(())
    } else {
        Err(OAuthError::invalid_grant("code_verifier does not match"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use proptest::prelude::*;

    // RFC 7636 Appendix B
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-1B5dYhKdsj9sLsR0sqBTgjw0mxSU-s";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_s256_matches_rfc_vector() {
        assert_eq!(
            derive_challenge(RFC_VERIFIER, CodeChallengeMethod::S256),
            RFC_CHALLENGE
        );
        assert!(verify(RFC_CHALLENGE, CodeChallengeMethod::S256, RFC_VERIFIER));
    }

    #[test]
    fn test_plain_is_identity() {
        assert_eq!(derive_challenge("abc", CodeChallengeMethod::Plain), "abc");
        assert!(verify("abc", CodeChallengeMethod::Plain, "abc"));
        assert!(!verify("abc", CodeChallengeMethod::Plain, "abd"));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(
            "S256".parse::<CodeChallengeMethod>().unwrap(),
            CodeChallengeMethod::S256
        );
        assert_eq!(
            "plain".parse::<CodeChallengeMethod>().unwrap(),
            CodeChallengeMethod::Plain
        );
        let err = "s256".parse::<CodeChallengeMethod>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_check_without_stored_challenge_passes() {
        assert!(check(None, None, None).is_ok());
        assert!(check(None, None, Some("anything")).is_ok());
    }

    #[test]
    fn test_check_missing_verifier_is_invalid_grant() {
        let err = check(Some(RFC_CHALLENGE), Some("S256"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[test]
    fn test_check_mismatch_is_invalid_grant() {
        let err = check(Some(RFC_CHALLENGE), Some("S256"), Some("wrong")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
        assert!(check(Some(RFC_CHALLENGE), Some("S256"), Some(RFC_VERIFIER)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_s256_roundtrip_verifies(verifier in "[A-Za-z0-9._~-]{43,128}") {
            let challenge = derive_challenge(&verifier, CodeChallengeMethod::S256);
            prop_assert!(verify(&challenge, CodeChallengeMethod::S256, &verifier));
        }

        #[test]
        fn prop_single_bit_flip_fails(
            verifier in "[A-Za-z0-9._~-]{43,128}",
            pos in any::<prop::sample::Index>(),
            bit in 0u8..7,
        ) {
            let challenge = derive_challenge(&verifier, CodeChallengeMethod::S256);
            let mut bytes = verifier.clone().into_bytes();
            let i = pos.index(bytes.len());
            bytes[i] ^= 1 << bit;
            // flipping one of the low 7 bits of an ASCII byte stays ASCII
            let mutated = String::from_utf8(bytes).unwrap();
            prop_assert!(!verify(&challenge, CodeChallengeMethod::S256, &mutated));
        }
    }
}
