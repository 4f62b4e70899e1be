use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    dpop::DpopProof,
    session::{DeferredTransaction, IssuanceSession},
    CredentialConfiguration, IssuanceEvent, Issuer, MappedCredential, MappingContext,
    PROOF_TYPE_ATTESTATION, PROOF_TYPE_JWT,
};
use crate::{
    codec::CredentialToSign,
    core::holder_binding::{CredentialBinding, HolderBinding},
    error::{Error, ErrorCode, Result},
    session::Versioned,
    trust::{
        attestation::{KeyAttestationRequirements, VerifiedKeyAttestation},
        jwk::PublicJwk,
        JwtSigner, JwtVerification,
    },
    utils::{later, now, random_id, unix_now},
};

pub const PROOF_JWT_TYP: &str = "openid4vci-proof+jwt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "proof_type", rename_all = "snake_case")]
pub enum Proof {
    Jwt { jwt: String },
    Attestation { attestation: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proofs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jwt: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub credential_configuration_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proofs: Option<Proofs>,
}

impl CredentialRequest {
    pub fn new(credential_configuration_id: impl Into<String>) -> Self {
        Self {
            credential_configuration_id: credential_configuration_id.into(),
            proof: None,
            proofs: None,
        }
    }

    /// `(jwt proofs, attestation proofs)`, merging `proof` and `proofs`.
    fn proofs(&self) -> Result<(Vec<&str>, Vec<&str>)> {
        match (&self.proof, &self.proofs) {
            (Some(_), Some(_)) => Err(Error::client(
                ErrorCode::InvalidCredentialRequest,
                "only one of 'proof' and 'proofs' may be present",
            )),
            (Some(Proof::Jwt { jwt }), None) => Ok((vec![jwt.as_str()], vec![])),
            (Some(Proof::Attestation { attestation }), None) => {
                Ok((vec![], vec![attestation.as_str()]))
            }
            (None, Some(proofs)) => Ok((
                proofs.jwt.iter().map(String::as_str).collect(),
                proofs.attestation.iter().map(String::as_str).collect(),
            )),
            (None, None) => Ok((vec![], vec![])),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub credential: String,
}

/// Either the issued credentials or a `transaction_id` to poll with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<IssuedCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_nonce_expires_in: Option<u64>,
}

impl CredentialResponse {
    pub fn is_deferred(&self) -> bool {
        self.transaction_id.is_some()
    }
}

fn invalid_proof(description: impl Into<String>) -> Error {
    Error::client(ErrorCode::InvalidProof, description)
}

/// Whether a DID or JWK binding is allowed by `cryptographic_binding_methods_supported`.
fn binding_method_supported(supported: &[String], binding: &CredentialBinding) -> bool {
    if supported.is_empty() {
        return true;
    }
    match binding {
        CredentialBinding::Jwk { .. } => supported.iter().any(|m| m == "jwk"),
        CredentialBinding::Did { did_url } => supported.iter().any(|m| {
            m == "did" || (m.starts_with("did:") && did_url.starts_with(&format!("{m}:")))
        }),
    }
}

/// Configurations granted by the scope of an authorization, if any.
fn scoped_configuration_ids(issuer: &Issuer, session: &IssuanceSession) -> Vec<String> {
    let scopes: Vec<String> = session
        .authorization
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    issuer.record.configurations_for_scopes(&scopes)
}

impl Issuer {
    /// Handle a credential request made with an access token issued for a session.
    ///
    /// Problems with the request itself are returned without touching the session. Once
    /// the request is accepted, failures move the session to `Error`.
    #[instrument(skip_all, fields(configuration = request.credential_configuration_id))]
    pub async fn request_credentials(
        &self,
        access_token: &str,
        dpop: Option<&DpopProof>,
        request: CredentialRequest,
    ) -> Result<CredentialResponse> {
        let mut versioned = self.authorize_access_token(access_token, dpop).await?;
        let session = &versioned.session;
        let configuration_id = request.credential_configuration_id.as_str();

        let scoped = scoped_configuration_ids(self, session);
        if !session
            .granted_configuration_ids(&scoped)
            .contains(&configuration_id)
        {
            return Err(Error::client(
                ErrorCode::InvalidCredentialRequest,
                format!("credential configuration '{configuration_id}' was not offered or granted"),
            ));
        }
        if session
            .issued_configurations
            .iter()
            .any(|id| id == configuration_id)
        {
            return Err(Error::client(
                ErrorCode::InvalidCredentialRequest,
                format!("credentials for '{configuration_id}' were already issued"),
            ));
        }
        let configuration = self.record.configuration(configuration_id)?;
        let binding = self.holder_binding(session, configuration, &request).await?;
        if let Some(binding) = &binding {
            let max = self.record.batch_size();
            if binding.key_count() > max {
                return Err(invalid_proof(format!(
                    "Issuer supports issuing a batch of maximum {max} credential(s). Binding keys contain {} key(s).",
                    binding.key_count()
                )));
            }
        }

        versioned.session.apply(IssuanceEvent::CredentialRequested)?;
        let versioned = self.save(versioned).await?;
        let configuration_id = request.credential_configuration_id.clone();
        match self
            .issue(versioned.clone(), configuration_id, request, binding, None)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => Err(self.fail(versioned, e).await),
        }
    }

    /// Poll for credentials of a deferred credential request.
    #[instrument(skip_all)]
    pub async fn request_deferred_credentials(
        &self,
        access_token: &str,
        dpop: Option<&DpopProof>,
        transaction_id: &str,
    ) -> Result<CredentialResponse> {
        let mut versioned = self.authorize_access_token(access_token, dpop).await?;
        let transaction = versioned
            .session
            .deferred_transactions
            .remove(transaction_id)
            .ok_or_else(|| {
                Error::client(
                    ErrorCode::InvalidTransactionId,
                    format!("unknown transaction id '{transaction_id}'"),
                )
            })?;
        versioned.session.apply(IssuanceEvent::CredentialRequested)?;
        let versioned = self.save(versioned).await?;
        match self
            .issue(
                versioned.clone(),
                transaction.configuration_id,
                transaction.request,
                transaction.binding,
                Some(transaction_id.to_string()),
            )
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => Err(self.fail(versioned, e).await),
        }
    }

    async fn issue(
        &self,
        mut versioned: Versioned<IssuanceSession>,
        configuration_id: String,
        request: CredentialRequest,
        binding: Option<HolderBinding>,
        transaction_id: Option<String>,
    ) -> Result<CredentialResponse> {
        let configuration = self.record.configuration(&configuration_id)?;
        let mapped = self
            .mapper
            .map(MappingContext {
                session: &versioned.session,
                configuration_id: &configuration_id,
                configuration,
                binding: binding.as_ref(),
                transaction_id: transaction_id.as_deref(),
            })
            .await?;

        let template = match mapped {
            MappedCredential::Issue(template) => template,
            MappedCredential::Defer { interval_secs } => {
                let transaction_id = transaction_id.unwrap_or_else(|| random_id(32));
                versioned.session.deferred_transactions.insert(
                    transaction_id.clone(),
                    DeferredTransaction {
                        configuration_id,
                        request,
                        binding,
                    },
                );
                versioned.session.apply(IssuanceEvent::Deferred)?;
                let versioned = self.save(versioned).await?;
                info!(session = versioned.session.id, "deferred credential issuance");
                return Ok(CredentialResponse {
                    transaction_id: Some(transaction_id),
                    interval: Some(interval_secs.unwrap_or(self.config.deferred_interval_secs)),
                    ..Default::default()
                });
            }
        };

        let codec = self.codecs.get(&configuration.format)?;
        let targets: Vec<Option<CredentialBinding>> = match &binding {
            Some(binding) => binding.credential_bindings().into_iter().map(Some).collect(),
            None => vec![None],
        };
        let mut credentials = Vec::with_capacity(targets.len());
        for target in targets {
            let credential = codec
                .sign(
                    &self.trust,
                    CredentialToSign {
                        payload: template.payload.clone(),
                        disclosure_frame: template.disclosure_frame.clone(),
                        binding: target,
                        issuer: template.issuer.clone(),
                    },
                )
                .await?;
            credentials.push(credential);
        }

        let session = &mut versioned.session;
        session.issued_configurations.push(configuration_id);
        session.issued_credentials.extend(credentials.iter().cloned());
        let notification_id = random_id(32);
        session.notifications.insert(notification_id.clone(), None);
        let c_nonce = random_id(32);
        if let Some(token) = session.access_token.as_mut() {
            token.c_nonce = c_nonce.clone();
            token.c_nonce_expires_at = later(now(), self.config.c_nonce_lifetime());
        }
        let complete = session.all_issued();
        session.apply(IssuanceEvent::CredentialsIssued { complete })?;
        let versioned = self.save(versioned).await?;
        info!(
            session = versioned.session.id,
            count = credentials.len(),
            complete,
            "issued credentials"
        );

        Ok(CredentialResponse {
            credentials: credentials
                .into_iter()
                .map(|credential| IssuedCredential { credential })
                .collect(),
            notification_id: Some(notification_id),
            c_nonce: Some(c_nonce),
            c_nonce_expires_in: Some(self.config.c_nonce_lifetime_secs),
            ..Default::default()
        })
    }

    /// The keys the holder proved possession of, `None` for configurations without
    /// holder binding.
    async fn holder_binding(
        &self,
        session: &IssuanceSession,
        configuration: &CredentialConfiguration,
        request: &CredentialRequest,
    ) -> Result<Option<HolderBinding>> {
        let (jwt_proofs, attestation_proofs) = request.proofs()?;
        if configuration.proof_types_supported.is_empty() {
            return Ok(None);
        }
        let c_nonce = session
            .access_token
            .as_ref()
            .filter(|token| token.c_nonce_expires_at > now())
            .map(|token| token.c_nonce.as_str());

        if !attestation_proofs.is_empty() {
            let Some(metadata) = configuration.proof_types_supported.get(PROOF_TYPE_ATTESTATION)
            else {
                return Err(invalid_proof(format!(
                    "proof type '{PROOF_TYPE_ATTESTATION}' is not supported for this credential"
                )));
            };
            let Some(requirements) = &metadata.key_attestations_required else {
                return Err(Error::server(format!(
                    "proof type '{PROOF_TYPE_ATTESTATION}' requires 'key_attestations_required' in the credential configuration"
                )));
            };
            if attestation_proofs.len() != 1 || !jwt_proofs.is_empty() {
                return Err(invalid_proof("exactly one attestation proof is expected"));
            }
            let attestation = attestation_proofs[0];
            let verified = self.key_attestation(attestation, requirements).await?;
            if verified.nonce.is_none() || verified.nonce.as_deref() != c_nonce {
                return Err(invalid_proof("key attestation 'nonce' does not match the c_nonce"));
            }
            return Ok(Some(attestation_binding(attestation, verified)));
        }

        if jwt_proofs.is_empty() {
            return Err(invalid_proof("missing proof of possession"));
        }
        let Some(metadata) = configuration.proof_types_supported.get(PROOF_TYPE_JWT) else {
            if configuration
                .proof_types_supported
                .contains_key(PROOF_TYPE_ATTESTATION)
            {
                return Err(invalid_proof(format!(
                    "credential configuration requires key attestations, use proof type '{PROOF_TYPE_ATTESTATION}'"
                )));
            }
            return Err(invalid_proof(format!(
                "proof type '{PROOF_TYPE_JWT}' is not supported for this credential"
            )));
        };

        let mut bindings = Vec::with_capacity(jwt_proofs.len());
        let mut attested = None;
        for jwt in jwt_proofs {
            let (binding, key_attestation) = self.verify_jwt_proof(jwt, c_nonce).await?;
            if let Some(key_attestation) = key_attestation {
                let requirements = metadata.key_attestations_required.clone().unwrap_or_default();
                let verified = self.key_attestation(&key_attestation, &requirements).await?;
                let CredentialBinding::Jwk { jwk } = &binding else {
                    return Err(invalid_proof(
                        "a proof with 'key_attestation' must be signed with an attested jwk",
                    ));
                };
                if !verified.attested_keys.iter().any(|key| key.same_key(jwk)) {
                    return Err(invalid_proof("proof key is not one of the attested keys"));
                }
                attested = Some(attestation_binding(&key_attestation, verified));
            }
            if !binding_method_supported(&configuration.cryptographic_binding_methods_supported, &binding)
            {
                return Err(invalid_proof(format!(
                    "binding method is not one of {:?}",
                    configuration.cryptographic_binding_methods_supported
                )));
            }
            bindings.push(binding);
        }

        if let Some(attested) = attested {
            if bindings.len() != 1 {
                return Err(invalid_proof(
                    "a proof with 'key_attestation' must be the only proof",
                ));
            }
            return Ok(Some(attested));
        }
        if metadata.key_attestations_required.is_some() {
            return Err(invalid_proof(format!(
                "credential configuration requires key attestations, use proof type '{PROOF_TYPE_ATTESTATION}' or a 'key_attestation' header"
            )));
        }

        let binding = match &bindings[0] {
            CredentialBinding::Did { .. } => HolderBinding::Did {
                did_urls: bindings
                    .into_iter()
                    .map(|b| match b {
                        CredentialBinding::Did { did_url } => Ok(did_url),
                        CredentialBinding::Jwk { .. } => Err(mixed_bindings()),
                    })
                    .collect::<Result<_>>()?,
            },
            CredentialBinding::Jwk { .. } => HolderBinding::Jwk {
                keys: bindings
                    .into_iter()
                    .map(|b| match b {
                        CredentialBinding::Jwk { jwk } => Ok(jwk),
                        CredentialBinding::Did { .. } => Err(mixed_bindings()),
                    })
                    .collect::<Result<_>>()?,
            },
        };
        Ok(Some(binding))
    }

    /// Verify a jwt proof, returning its binding and `key_attestation` header.
    async fn verify_jwt_proof(
        &self,
        jwt: &str,
        c_nonce: Option<&str>,
    ) -> Result<(CredentialBinding, Option<String>)> {
        let verified = self
            .trust
            .verify_jwt(jwt, &JwtVerification::default(), &self.policy)
            .await
            .map_err(|e| invalid_proof(e.to_string()))?;
        if verified.typ() != Some(PROOF_JWT_TYP) {
            return Err(invalid_proof(format!("proof must have typ '{PROOF_JWT_TYP}'")));
        }
        if !verified.has_audience(&self.record.issuer_id) {
            return Err(invalid_proof("proof 'aud' must be the credential issuer"));
        }
        if c_nonce.is_none() || verified.claim_str("nonce") != c_nonce {
            return Err(invalid_proof("proof 'nonce' does not match a valid c_nonce"));
        }
        let iat = verified.payload.get("iat").and_then(|v| v.as_i64());
        if iat.map_or(true, |iat| iat > unix_now() + 60) {
            return Err(invalid_proof("proof 'iat' is missing or in the future"));
        }
        let binding = match verified.signer {
            JwtSigner::Did { did_url } => CredentialBinding::Did { did_url },
            JwtSigner::Jwk { jwk } => CredentialBinding::Jwk { jwk },
            other => {
                return Err(invalid_proof(format!(
                    "proofs signed with '{}' are not supported",
                    other.method()
                )))
            }
        };
        let key_attestation = verified
            .header
            .get("key_attestation")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        debug!(method = binding_method(&binding), "verified proof of possession");
        Ok((binding, key_attestation))
    }

    async fn key_attestation(
        &self,
        attestation: &str,
        requirements: &KeyAttestationRequirements,
    ) -> Result<VerifiedKeyAttestation> {
        self.trust
            .validate_key_attestation(attestation, &self.policy, requirements)
            .await
            .map_err(|e| match e {
                Error::Trust(reason) => invalid_proof(format!("invalid key attestation: {reason}")),
                other => other,
            })
    }
}

fn binding_method(binding: &CredentialBinding) -> &'static str {
    match binding {
        CredentialBinding::Did { .. } => "did",
        CredentialBinding::Jwk { .. } => "jwk",
    }
}

fn mixed_bindings() -> Error {
    invalid_proof("all proofs must use the same binding method")
}

fn attestation_binding(attestation: &str, verified: VerifiedKeyAttestation) -> HolderBinding {
    let keys: Vec<PublicJwk> = verified.attested_keys;
    HolderBinding::Attestation {
        key_attestation: attestation.to_string(),
        keys,
        key_storage: verified.key_storage,
        user_authentication: verified.user_authentication,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_and_batch_proofs() {
        let request: CredentialRequest = serde_json::from_value(json!({
            "credential_configuration_id": "PID",
            "proof": {"proof_type": "jwt", "jwt": "a.b.c"}
        }))
        .unwrap();
        assert_eq!(request.proofs().unwrap(), (vec!["a.b.c"], vec![]));

        let request: CredentialRequest = serde_json::from_value(json!({
            "credential_configuration_id": "PID",
            "proofs": {"jwt": ["a.b.c", "d.e.f"]}
        }))
        .unwrap();
        assert_eq!(request.proofs().unwrap().0.len(), 2);

        let both = CredentialRequest {
            proof: Some(Proof::Attestation {
                attestation: "x".into(),
            }),
            proofs: Some(Proofs::default()),
            ..CredentialRequest::new("PID")
        };
        assert_eq!(
            both.proofs().unwrap_err().code(),
            Some(ErrorCode::InvalidCredentialRequest)
        );
    }

    #[test]
    fn binding_methods() {
        let did = CredentialBinding::Did {
            did_url: "did:key:z6Mk#z6Mk".into(),
        };
        assert!(binding_method_supported(&[], &did));
        assert!(binding_method_supported(&["did:key".into()], &did));
        assert!(!binding_method_supported(&["did:web".into()], &did));
        assert!(!binding_method_supported(&["jwk".into()], &did));
    }

    #[test]
    fn deferred_response_wire_format() {
        let response = CredentialResponse {
            transaction_id: Some("tx".into()),
            interval: Some(5),
            ..Default::default()
        };
        assert!(response.is_deferred());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"transaction_id": "tx", "interval": 5})
        );
    }
}
