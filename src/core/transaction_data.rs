use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::utils::{b64url_encode, b64url_json, sha256_b64url, NonEmptyVec};

/// Hash algorithm used when no `transaction_data_hashes_alg` is given.
pub const DEFAULT_HASH_ALG: &str = "sha-256";

/// A transaction data entry of an authorization request.
///
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-5.1>
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionData {
    #[serde(rename = "type")]
    data_type: String,
    /// Ids of the credential queries (or input descriptors) whose key binding must cover
    /// this entry.
    credential_ids: NonEmptyVec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_data_hashes_alg: Option<NonEmptyVec<String>>,
    /// Type specific members.
    #[serde(flatten)]
    details: Map<String, Json>,
}

impl TransactionData {
    pub fn new(data_type: impl Into<String>, credential_ids: NonEmptyVec<String>) -> Self {
        Self {
            data_type: data_type.into(),
            credential_ids,
            transaction_data_hashes_alg: None,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Json) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn credential_ids(&self) -> &[String] {
        &self.credential_ids
    }

    pub fn details(&self) -> &Map<String, Json> {
        &self.details
    }

    pub fn hash_algs(&self) -> Vec<&str> {
        match &self.transaction_data_hashes_alg {
            Some(algs) => algs.iter().map(String::as_str).collect(),
            None => vec![DEFAULT_HASH_ALG],
        }
    }

    pub fn binds(&self, credential_id: &str) -> bool {
        self.credential_ids.iter().any(|id| id == credential_id)
    }

    /// The base64url encoded JSON string sent in the request.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("failed to serialize transaction data")?;
        Ok(b64url_encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        b64url_json(encoded).context("transaction data entry is not valid")
    }
}

/// Hash of one encoded transaction data entry, as carried in a key binding proof.
pub fn hash_encoded(encoded: &str, alg: &str) -> Result<String> {
    match alg {
        "sha-256" => Ok(sha256_b64url(encoded)),
        other => bail!("unsupported transaction data hash algorithm '{other}'"),
    }
}

/// The hash binding recorded in a verified result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionDataHash {
    pub credential_id: String,
    pub encoded: String,
    pub hash: String,
    pub hash_alg: String,
}
