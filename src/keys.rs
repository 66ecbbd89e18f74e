//! Signing key custody.
//!
//! The RS256 key pair lives in the key-value store under owner `key_pairs`
//! and key = configured kid. The first caller to find the slot empty
//! generates a pair and offers it with an atomic insert-if-absent; every
//! caller then adopts whatever the store holds. Nothing is ever signed with
//! a key that was not persisted first.

use crate::errors::CrabError;
use crate::settings::Keys;
use crate::storage;
use josekit::jwk::Jwk;
use josekit::jws::alg::rsassa::{RsassaJwsSigner, RsassaJwsVerifier};
use josekit::jws::RS256;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const KEY_PAIR_OWNER: &str = "key_pairs";

/// Persisted form of the signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub id: String,
    /// PKCS#8 PEM
    pub private_key: String,
    /// SPKI PEM
    pub public_key: String,
}

impl KeyPair {
    /// Generates a fresh RSA pair. CPU-bound; call from a blocking context.
    pub fn generate(id: &str, bits: usize) -> Result<Self, CrabError> {
        let bits = u32::try_from(bits)
            .map_err(|_| CrabError::Other(format!("RSA modulus of {bits} bits is out of range")))?;
        let pair = RS256.generate_key_pair(bits)?;
        Ok(Self {
            id: id.to_string(),
            private_key: pem_to_string(pair.to_pem_private_key())?,
            public_key: pem_to_string(pair.to_pem_public_key())?,
        })
    }
}

fn pem_to_string(pem: Vec<u8>) -> Result<String, CrabError> {
    String::from_utf8(pem).map_err(|e| CrabError::Jose(format!("PEM is not UTF-8: {e}")))
}

/// A persisted key pair with its parsed signer, verifier and public JWK.
pub struct SigningKey {
    pub pair: KeyPair,
    pub jwk: Jwk,
    pub signer: RsassaJwsSigner,
    pub verifier: RsassaJwsVerifier,
}

impl SigningKey {
    fn from_pair(pair: KeyPair, alg: &str) -> Result<Self, CrabError> {
        let signer = RS256.signer_from_pem(pair.private_key.as_bytes())?;
        let verifier = RS256.verifier_from_pem(pair.public_key.as_bytes())?;

        let mut jwk = RS256
            .key_pair_from_pem(pair.private_key.as_bytes())?
            .to_jwk_public_key();
        jwk.set_key_id(&pair.id);
        jwk.set_algorithm(alg);
        jwk.set_key_use("sig");

        Ok(Self {
            pair,
            jwk,
            signer,
            verifier,
        })
    }

    pub fn kid(&self) -> &str {
        &self.pair.id
    }
}

#[derive(Clone)]
pub struct KeyManager {
    db: DatabaseConnection,
    cfg: Keys,
    io_timeout: Duration,
    // std lock: only ever held for a clone of the Arc, never across an await
    cache: Arc<RwLock<Option<Arc<SigningKey>>>>,
}

impl KeyManager {
    pub fn new(db: DatabaseConnection, cfg: Keys, io_timeout: Duration) -> Self {
        Self {
            db,
            cfg,
            io_timeout,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.cfg.key_id
    }

    pub async fn get_or_create_key_pair(&self) -> Result<KeyPair, CrabError> {
        Ok(self.signing_key().await?.pair.clone())
    }

    pub async fn public_jwk(&self) -> Result<Jwk, CrabError> {
        Ok(self.signing_key().await?.jwk.clone())
    }

    pub async fn jwks_json(&self) -> Result<Value, CrabError> {
        let jwk = self.public_jwk().await?;
        Ok(json!({ "keys": [serde_json::to_value(jwk)?] }))
    }

    /// Offers `pair` as the signing key and returns whichever pair the store holds afterwards.
    pub async fn seed(&self, pair: KeyPair) -> Result<KeyPair, CrabError> {
        if pair.id != self.cfg.key_id {
            return Err(CrabError::BadRequest(format!(
                "seeded key id {} does not match configured key id {}",
                pair.id, self.cfg.key_id
            )));
        }
        let key = self.offer_and_adopt(pair).await?;
        Ok(key.pair.clone())
    }

    /// Resolves the active key, bootstrapping it on first use.
    pub async fn signing_key(&self) -> Result<Arc<SigningKey>, CrabError> {
        if let Some(key) = self.cached() {
            return Ok(key);
        }

        if let Some(pair) = self.load().await? {
            return self.install(pair);
        }

        tracing::info!(kid = %self.cfg.key_id, bits = self.cfg.rsa_bits, "Generating signing key pair");
        let kid = self.cfg.key_id.clone();
        let bits = self.cfg.rsa_bits;
        let fresh = tokio::task::spawn_blocking(move || KeyPair::generate(&kid, bits))
            .await
            .map_err(|e| CrabError::Other(format!("key generation task failed: {e}")))??;

        self.offer_and_adopt(fresh).await
    }

    async fn offer_and_adopt(&self, candidate: KeyPair) -> Result<Arc<SigningKey>, CrabError> {
        let value = serde_json::to_value(&candidate)?;
        let won = storage::with_timeout(
            self.io_timeout,
            storage::insert_property_if_absent(&self.db, KEY_PAIR_OWNER, &candidate.id, &value),
        )
        .await?;

        let persisted = self.load().await?.ok_or_else(|| {
            CrabError::Other(format!(
                "signing key {} missing right after insert",
                candidate.id
            ))
        })?;

        if won {
            tracing::info!(kid = %persisted.id, "Persisted new signing key pair");
        } else if persisted != candidate {
            tracing::debug!(kid = %persisted.id, "Lost key bootstrap race; adopting persisted key pair");
        }
        self.install(persisted)
    }

    async fn load(&self) -> Result<Option<KeyPair>, CrabError> {
        let value = storage::with_timeout(
            self.io_timeout,
            storage::get_property(&self.db, KEY_PAIR_OWNER, &self.cfg.key_id),
        )
        .await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    fn cached(&self) -> Option<Arc<SigningKey>> {
        match self.cache.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, pair: KeyPair) -> Result<Arc<SigningKey>, CrabError> {
        let key = Arc::new(SigningKey::from_pair(pair, &self.cfg.alg)?);
        let mut guard = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // every installed pair was read back from the store, so the first one wins
        match guard.as_ref() {
            Some(existing) => Ok(existing.clone()),
            None => {
                *guard = Some(key.clone());
                Ok(key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{shared_key_pair, TestDb};
    use sea_orm::Database;
    use tempfile::NamedTempFile;

    fn manager(db: &DatabaseConnection) -> KeyManager {
        KeyManager::new(db.clone(), Keys::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_seeded_key_is_persisted_and_used() {
        let test_db = TestDb::new().await;
        let km = manager(test_db.connection());

        let seeded = km.seed(shared_key_pair()).await.unwrap();
        assert_eq!(seeded, shared_key_pair());
        assert_eq!(km.get_or_create_key_pair().await.unwrap(), shared_key_pair());

        let stored = storage::get_property(test_db.connection(), KEY_PAIR_OWNER, km.key_id())
            .await
            .unwrap()
            .expect("key pair should be persisted");
        let stored: KeyPair = serde_json::from_value(stored).unwrap();
        assert_eq!(stored, shared_key_pair());
    }

    #[tokio::test]
    async fn test_second_seed_adopts_first() {
        let test_db = TestDb::new().await;
        let km = manager(test_db.connection());
        km.seed(shared_key_pair()).await.unwrap();

        let other = KeyPair {
            public_key: "not used".to_string(),
            ..shared_key_pair()
        };
        let adopted = manager(test_db.connection()).seed(other).await.unwrap();
        assert_eq!(adopted, shared_key_pair());
    }

    #[tokio::test]
    async fn test_seed_rejects_foreign_kid() {
        let test_db = TestDb::new().await;
        let km = manager(test_db.connection());
        let foreign = KeyPair {
            id: "someone-else".to_string(),
            ..shared_key_pair()
        };
        assert!(matches!(km.seed(foreign).await, Err(CrabError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_generates_and_persists_once() {
        let test_db = TestDb::new().await;
        let km = manager(test_db.connection());

        let first = km.get_or_create_key_pair().await.unwrap();
        assert!(first.private_key.contains("BEGIN PRIVATE KEY"));
        assert!(first.public_key.contains("BEGIN PUBLIC KEY"));

        // a fresh manager (new process) reads the same pair back
        let again = manager(test_db.connection())
            .get_or_create_key_pair()
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_converges() {
        let test_db = TestDb::new().await;
        let a = manager(test_db.connection());
        let b = manager(test_db.connection());

        let (ka, kb) = tokio::join!(a.get_or_create_key_pair(), b.get_or_create_key_pair());
        let (ka, kb) = (ka.unwrap(), kb.unwrap());
        assert_eq!(ka, kb);

        let persisted = manager(test_db.connection())
            .get_or_create_key_pair()
            .await
            .unwrap();
        assert_eq!(ka, persisted);
    }

    #[tokio::test]
    async fn test_public_jwk_fields() {
        let test_db = TestDb::new().await;
        let km = manager(test_db.connection());
        km.seed(shared_key_pair()).await.unwrap();

        let jwk = km.public_jwk().await.unwrap();
        assert_eq!(jwk.key_type(), "RSA");
        assert_eq!(jwk.key_id(), Some("portcullis-signing-key"));
        assert_eq!(jwk.algorithm(), Some("RS256"));
        assert_eq!(jwk.key_use(), Some("sig"));
        assert!(jwk.parameter("d").is_none(), "private exponent must not leak");

        let jwks = km.jwks_json().await.unwrap();
        assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
        assert_eq!(jwks["keys"][0]["kid"], "portcullis-signing-key");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_without_fallback() {
        // no migrations: the properties table does not exist
        let temp_file = NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
        let db = Database::connect(&url).await.unwrap();

        let km = manager(&db);
        assert!(matches!(
            km.get_or_create_key_pair().await,
            Err(CrabError::Db(_))
        ));
        assert!(km.cached().is_none());
    }
}
