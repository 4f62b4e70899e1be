use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use multibase::Base;
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    SecretKey,
};
use rand::RngCore;
use serde_json::{Map, Value as Json};
use tokio::sync::Mutex;

use super::{jwe, jwk::PublicJwk};

/// Key management collaborator. Holds private keys and performs raw operations with them;
/// the engine never sees private key material.
#[async_trait]
pub trait KeyManagement: Debug + Send + Sync {
    /// Create a new P-256 key and return its id.
    async fn create_key(&self) -> Result<String>;

    async fn delete_key(&self, key_id: &str) -> Result<()>;

    async fn random_bytes(&self, len: usize) -> Result<Vec<u8>>;

    async fn public_key(&self, key_id: &str) -> Result<PublicJwk>;

    /// ES256 signature (`r || s`) over `payload`.
    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a compact ECDH-ES JWE addressed to `key_id`, returning the protected header
    /// and the plaintext.
    async fn decrypt_jwe(&self, key_id: &str, compact: &str)
        -> Result<(Map<String, Json>, Vec<u8>)>;
}

/// The key id of a public key: base58btc of its compressed SEC1 encoding.
///
/// This is also the identifier older wallets used for their keys, see
/// [legacy_key_id_from_fingerprint].
pub fn key_id_for(jwk: &PublicJwk) -> Result<String> {
    Ok(Base::Base58Btc.encode(jwk.to_sec1_compressed()?))
}

/// Multicodec prefix of a compressed P-256 public key (`p256-pub`, varint 0x1200).
const P256_MULTICODEC: [u8; 2] = [0x80, 0x24];

/// Translate a did:key style fingerprint (`z` + base58btc(multicodec || key)) into the
/// bare key id. Returns `None` if `kid` is not such a fingerprint.
pub fn legacy_key_id_from_fingerprint(kid: &str) -> Option<String> {
    let fingerprint = kid.rsplit_once('#').map(|(_, f)| f).unwrap_or(kid);
    let (base, bytes) = multibase::decode(fingerprint).ok()?;
    if base != Base::Base58Btc {
        return None;
    }
    let raw = bytes.strip_prefix(&P256_MULTICODEC)?;
    Some(Base::Base58Btc.encode(raw))
}

/// A local in-memory key store. Not for production use!
///
/// # Warning
/// Keys are kept unencrypted in process memory and are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyManagement {
    keys: Arc<Mutex<BTreeMap<String, SecretKey>>>,
}

impl MemoryKeyManagement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import an existing key, for example one matching a certificate fixture.
    pub async fn import(&self, key: SecretKey) -> Result<String> {
        let key_id = key_id_for(&PublicJwk::from_p256(&key.public_key())?)?;
        self.keys.lock().await.insert(key_id.clone(), key);
        Ok(key_id)
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.keys.lock().await.contains_key(key_id)
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.keys.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn secret(&self, key_id: &str) -> Result<SecretKey> {
        self.keys
            .lock()
            .await
            .get(key_id)
            .cloned()
            .with_context(|| format!("unknown key '{key_id}'"))
    }
}

#[async_trait]
impl KeyManagement for MemoryKeyManagement {
    async fn create_key(&self) -> Result<String> {
        self.import(SecretKey::random(&mut rand::rngs::OsRng)).await
    }

    async fn delete_key(&self, key_id: &str) -> Result<()> {
        self.keys
            .lock()
            .await
            .remove(key_id)
            .map(|_| ())
            .with_context(|| format!("unknown key '{key_id}'"))
    }

    async fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    async fn public_key(&self, key_id: &str) -> Result<PublicJwk> {
        PublicJwk::from_p256(&self.secret(key_id).await?.public_key())
    }

    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let key = SigningKey::from(self.secret(key_id).await?);
        let signature: Signature = key.sign(payload);
        Ok(signature.to_bytes().to_vec())
    }

    async fn decrypt_jwe(
        &self,
        key_id: &str,
        compact: &str,
    ) -> Result<(Map<String, Json>, Vec<u8>)> {
        let secret = self.secret(key_id).await?;
        jwe::decrypt(compact, secret.to_jwk_string().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{
        did::{did_key_url, split_did_url},
        jwe::{encrypt, JweOptions, DEFAULT_ENC},
        jwt::{assemble, signing_input, DecodedJwt},
    };
    use serde_json::json;

    #[tokio::test]
    async fn fingerprint_translates_to_key_id() {
        let kms = MemoryKeyManagement::new();
        let key_id = kms.create_key().await.unwrap();
        let jwk = kms.public_key(&key_id).await.unwrap();

        let did_url = did_key_url(&jwk).unwrap();
        let (_, fingerprint) = split_did_url(&did_url).unwrap();
        assert_eq!(
            legacy_key_id_from_fingerprint(fingerprint).as_deref(),
            Some(key_id.as_str())
        );
        assert_eq!(
            legacy_key_id_from_fingerprint(&did_url).as_deref(),
            Some(key_id.as_str())
        );
        assert_eq!(legacy_key_id_from_fingerprint(&key_id), None);
    }

    #[tokio::test]
    async fn sign_decrypt_and_delete() {
        let kms = MemoryKeyManagement::new();
        let key_id = kms.create_key().await.unwrap();
        assert_eq!(kms.len().await, 1);
        let jwk = kms.public_key(&key_id).await.unwrap();

        let Json::Object(header) = json!({"alg": "ES256"}) else {
            unreachable!()
        };
        let input = signing_input(&header, &Map::new()).unwrap();
        let sig = kms.sign(&key_id, input.as_bytes()).await.unwrap();
        DecodedJwt::decode(&assemble(&input, &sig))
            .unwrap()
            .verify(&jwk)
            .unwrap();

        let compact = encrypt(b"secret", &jwk, DEFAULT_ENC, &JweOptions::default()).unwrap();
        let (_, plaintext) = kms.decrypt_jwe(&key_id, &compact).await.unwrap();
        assert_eq!(plaintext, b"secret");

        kms.delete_key(&key_id).await.unwrap();
        assert!(kms.is_empty().await);
        assert!(kms.sign(&key_id, b"payload").await.is_err());
        assert!(kms.decrypt_jwe(&key_id, &compact).await.is_err());
        assert_eq!(kms.random_bytes(16).await.unwrap().len(), 16);
    }
}
