use serde::{Deserialize, Serialize};

use crate::trust::jwk::PublicJwk;

/// The cryptographic material a holder commits to when requesting credentials.
///
/// Every key yields one credential instance, so the key count is what batch issuance limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HolderBinding {
    /// DID URLs of the verification methods the credentials bind to.
    Did { did_urls: Vec<String> },
    Jwk { keys: Vec<PublicJwk> },
    /// Keys enumerated by a verified key attestation.
    Attestation {
        key_attestation: String,
        keys: Vec<PublicJwk>,
        key_storage: Vec<String>,
        user_authentication: Vec<String>,
    },
}

/// The binding of a single credential instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CredentialBinding {
    Did { did_url: String },
    Jwk { jwk: PublicJwk },
}

impl HolderBinding {
    pub fn method(&self) -> &'static str {
        match self {
            HolderBinding::Did { .. } => "did",
            HolderBinding::Jwk { .. } => "jwk",
            HolderBinding::Attestation { .. } => "attestation",
        }
    }

    pub fn key_count(&self) -> usize {
        match self {
            HolderBinding::Did { did_urls } => did_urls.len(),
            HolderBinding::Jwk { keys } | HolderBinding::Attestation { keys, .. } => keys.len(),
        }
    }

    /// One binding per credential instance, in the order the holder supplied them.
    pub fn credential_bindings(&self) -> Vec<CredentialBinding> {
        match self {
            HolderBinding::Did { did_urls } => did_urls
                .iter()
                .map(|did_url| CredentialBinding::Did {
                    did_url: did_url.clone(),
                })
                .collect(),
            HolderBinding::Jwk { keys } | HolderBinding::Attestation { keys, .. } => keys
                .iter()
                .map(|jwk| CredentialBinding::Jwk { jwk: jwk.clone() })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn one_credential_binding_per_key() {
        let binding: HolderBinding = serde_json::from_value(json!({
            "method": "did",
            "did_urls": ["did:example:1#a", "did:example:1#b"]
        }))
        .unwrap();
        assert_eq!(binding.method(), "did");
        assert_eq!(binding.key_count(), 2);
        assert_eq!(
            binding.credential_bindings()[1],
            CredentialBinding::Did {
                did_url: "did:example:1#b".into()
            }
        );
    }
}
