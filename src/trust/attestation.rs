use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use super::{
    jwk::PublicJwk, JwtSigner, JwtVerification, TrustCallbacks, TrustPolicy, VerificationPurpose,
    VerifiedJwt,
};
use crate::error::{Error, ErrorCode, OrTrustError, Result};

pub const KEY_ATTESTATION_TYP: &str = "key-attestation+jwt";
pub const CLIENT_ATTESTATION_TYP: &str = "oauth-client-attestation+jwt";
pub const CLIENT_ATTESTATION_POP_TYP: &str = "oauth-client-attestation-pop+jwt";

/// Minimum assurance a credential configuration demands from key attestations.
///
/// An attestation satisfies a list if it declares at least one of its values. Empty lists
/// impose nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttestationRequirements {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_storage: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_authentication: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyAttestation {
    pub attested_keys: Vec<PublicJwk>,
    pub key_storage: Vec<String>,
    pub user_authentication: Vec<String>,
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClientAttestation {
    pub client_id: String,
    /// Key the wallet instance proves possession of.
    pub cnf: PublicJwk,
    pub wallet_provider: Option<String>,
}

fn string_list(jwt: &VerifiedJwt, claim: &str) -> Vec<String> {
    match jwt.payload.get(claim) {
        Some(Json::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Json::String(value)) => vec![value.clone()],
        _ => vec![],
    }
}

fn meets(declared: &[String], accepted: &[String]) -> bool {
    accepted.is_empty() || declared.iter().any(|level| accepted.contains(level))
}

fn ensure_certificate_signed(jwt: &VerifiedJwt, what: &str) -> Result<()> {
    match jwt.signer {
        JwtSigner::X5c { .. } => Ok(()),
        _ => Err(Error::trust(format!(
            "{what} must be signed by a wallet provider certificate, was '{}'",
            jwt.signer.method()
        ))),
    }
}

impl TrustCallbacks {
    /// Verify a key attestation and check it against `requirements`.
    pub async fn validate_key_attestation(
        &self,
        attestation: &str,
        policy: &TrustPolicy,
        requirements: &KeyAttestationRequirements,
    ) -> Result<VerifiedKeyAttestation> {
        let jwt = self
            .verify_jwt(
                attestation,
                &JwtVerification::for_purpose(VerificationPurpose::KeyAttestation),
                policy,
            )
            .await?;
        ensure_certificate_signed(&jwt, "key attestation")?;
        if jwt.typ() != Some(KEY_ATTESTATION_TYP) {
            return Err(Error::client(
                ErrorCode::InvalidProof,
                format!("key attestation must have typ '{KEY_ATTESTATION_TYP}'"),
            ));
        }

        let attested_keys: Vec<PublicJwk> = jwt
            .payload
            .get("attested_keys")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .or_trust("invalid 'attested_keys'")?
            .unwrap_or_default();
        if attested_keys.is_empty() {
            return Err(Error::client(
                ErrorCode::InvalidProof,
                "key attestation does not attest any keys",
            ));
        }

        let key_storage = string_list(&jwt, "key_storage");
        let user_authentication = string_list(&jwt, "user_authentication");
        if !meets(&key_storage, &requirements.key_storage) {
            return Err(Error::client(
                ErrorCode::InvalidProof,
                format!(
                    "key attestation 'key_storage' {key_storage:?} does not meet the required {:?}",
                    requirements.key_storage
                ),
            ));
        }
        if !meets(&user_authentication, &requirements.user_authentication) {
            return Err(Error::client(
                ErrorCode::InvalidProof,
                format!(
                    "key attestation 'user_authentication' {user_authentication:?} does not meet the required {:?}",
                    requirements.user_authentication
                ),
            ));
        }
        debug!(keys = attested_keys.len(), "validated key attestation");

        Ok(VerifiedKeyAttestation {
            nonce: jwt.claim_str("nonce").map(str::to_string),
            attested_keys,
            key_storage,
            user_authentication,
        })
    }

    /// Verify an `OAuth-Client-Attestation` and its proof of possession.
    pub async fn validate_client_attestation(
        &self,
        attestation: &str,
        pop: &str,
        policy: &TrustPolicy,
        audience: &str,
        nonce: Option<&str>,
    ) -> Result<VerifiedClientAttestation> {
        let invalid_client = |description: String| Error::client(ErrorCode::InvalidClient, description);

        let jwt = self
            .verify_jwt(
                attestation,
                &JwtVerification::for_purpose(VerificationPurpose::ClientAttestation),
                policy,
            )
            .await?;
        ensure_certificate_signed(&jwt, "client attestation")?;
        if jwt.typ() != Some(CLIENT_ATTESTATION_TYP) {
            return Err(invalid_client(format!(
                "client attestation must have typ '{CLIENT_ATTESTATION_TYP}'"
            )));
        }
        if !jwt.payload.contains_key("exp") {
            return Err(invalid_client("client attestation has no 'exp'".into()));
        }
        let client_id = jwt
            .claim_str("sub")
            .ok_or_else(|| invalid_client("client attestation has no 'sub'".into()))?
            .to_string();
        let cnf: PublicJwk = jwt
            .payload
            .get("cnf")
            .and_then(|cnf| cnf.get("jwk"))
            .cloned()
            .ok_or_else(|| invalid_client("client attestation has no 'cnf.jwk'".into()))
            .and_then(|jwk| {
                serde_json::from_value(jwk)
                    .map_err(|e| invalid_client(format!("invalid 'cnf.jwk': {e}")))
            })?;

        let pop = self
            .verify_jwt(pop, &JwtVerification::with_jwk(cnf.clone()), policy)
            .await?;
        if pop.typ() != Some(CLIENT_ATTESTATION_POP_TYP) {
            return Err(invalid_client(format!(
                "client attestation proof must have typ '{CLIENT_ATTESTATION_POP_TYP}'"
            )));
        }
        if pop.claim_str("iss") != Some(client_id.as_str()) {
            return Err(invalid_client(
                "client attestation proof 'iss' does not match the attested client".into(),
            ));
        }
        if !pop.has_audience(audience) {
            return Err(Error::trust(format!(
                "client attestation proof is not intended for '{audience}'"
            )));
        }
        if pop.claim_str("jti").is_none() {
            return Err(invalid_client("client attestation proof has no 'jti'".into()));
        }
        if let Some(expected) = nonce {
            if pop.claim_str("nonce") != Some(expected) {
                return Err(invalid_client("client attestation proof nonce mismatch".into()));
            }
        }

        Ok(VerifiedClientAttestation {
            client_id,
            cnf,
            wallet_provider: jwt.claim_str("iss").map(str::to_string),
        })
    }
}
