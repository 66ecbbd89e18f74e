//! Portcullis - OAuth2 authorization server
//!
//! Authorization code (with PKCE), device authorization, password and
//! refresh grants, issuing RS256 access tokens. The library exposes all
//! modules so integration tests can drive the router in-process.

pub mod auth_codes;
pub mod devices;
pub mod entities;
pub mod errors;
pub mod grants;
pub mod jobs;
pub mod keys;
pub mod pkce;
pub mod session;
pub mod settings;
pub mod storage;
pub mod tokens;
pub mod web;

#[cfg(test)]
mod test_support;
