//! The issuance state machine and its authorization/token orchestration.
//!
//! Every operation loads the [IssuanceSession] it acts on, validates the transition,
//! and writes the new state back with a compare-and-swap. Nothing is kept in memory
//! between calls, so flows may pause for as long as the session lives.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::warn;

use crate::{
    codec::CodecRegistry,
    config::EngineConfig,
    core::{credential_format::ClaimFormatDesignation, holder_binding::HolderBinding},
    error::{Error, Result},
    query::CredentialQuery,
    session::{SessionStore, Versioned},
    trust::{attestation::KeyAttestationRequirements, JwtSigner, TrustCallbacks, TrustPolicy},
    utils::now,
    verifier::{ResponseMode, Verifier},
};

pub mod authorization;
pub mod chained;
pub mod credential;
pub mod dpop;
pub mod metadata;
pub mod notification;
pub mod offer;
pub mod par;
pub mod session;
pub mod token;

pub use chained::ChainedAuthorizationServer;
pub use session::{IssuanceEvent, IssuanceSession, IssuanceState};

/// Proof type of JWT proofs of possession.
pub const PROOF_TYPE_JWT: &str = "jwt";
/// Proof type of key attestations used as proof of possession.
pub const PROOF_TYPE_ATTESTATION: &str = "attestation";

/// Issuer metadata and policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerRecord {
    /// The `credential_issuer` identifier.
    pub issuer_id: String,
    /// Signs access tokens.
    pub access_token_signer: JwtSigner,
    pub credential_configurations: BTreeMap<String, CredentialConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_credential_issuance: Option<BatchCredentialIssuance>,
    #[serde(default)]
    pub authorization: AuthorizationPolicy,
}

impl IssuerRecord {
    pub fn configuration(&self, id: &str) -> Result<&CredentialConfiguration> {
        self.credential_configurations
            .get(id)
            .ok_or_else(|| Error::invalid_request(format!("unknown credential configuration '{id}'")))
    }

    /// Most credentials one request may ask for.
    pub fn batch_size(&self) -> usize {
        self.batch_credential_issuance
            .as_ref()
            .map(|batch| batch.batch_size)
            .unwrap_or(1)
    }

    /// Configuration ids whose `scope` is one of `scopes`.
    pub fn configurations_for_scopes(&self, scopes: &[String]) -> Vec<String> {
        self.credential_configurations
            .iter()
            .filter(|(_, c)| c.scope.as_ref().is_some_and(|s| scopes.contains(s)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfiguration {
    pub format: ClaimFormatDesignation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// `did`, `did:<method>` or `jwk`. Empty accepts any binding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cryptographic_binding_methods_supported: Vec<String>,
    /// Keyed by proof type. Empty issues credentials without holder binding.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proof_types_supported: BTreeMap<String, ProofTypeMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProofTypeMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proof_signing_alg_values_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_attestations_required: Option<KeyAttestationRequirements>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCredentialIssuance {
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationPolicy {
    pub require_dpop: bool,
    pub require_wallet_attestation: bool,
    /// Query the wallet must answer before an authorization code is released.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_during_issuance: Option<PresentationDuringIssuanceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chained: Option<ChainedAuthorizationServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationDuringIssuanceConfig {
    pub query: CredentialQuery,
    pub signer: JwtSigner,
    #[serde(default = "default_presentation_response_mode")]
    pub response_mode: ResponseMode,
}

fn default_presentation_response_mode() -> ResponseMode {
    ResponseMode::DirectPostJwt
}

/// Everything the credential mapper gets to see.
#[derive(Debug)]
pub struct MappingContext<'a> {
    pub session: &'a IssuanceSession,
    pub configuration_id: &'a str,
    pub configuration: &'a CredentialConfiguration,
    pub binding: Option<&'a HolderBinding>,
    /// Set when resuming a deferred request.
    pub transaction_id: Option<&'a str>,
}

/// The credential to issue, signed once per holder key.
#[derive(Debug, Clone)]
pub struct CredentialTemplate {
    pub payload: Map<String, Json>,
    pub disclosure_frame: Option<Json>,
    pub issuer: JwtSigner,
}

#[derive(Debug, Clone)]
pub enum MappedCredential {
    Issue(CredentialTemplate),
    /// Not ready yet, the wallet should poll the deferred endpoint.
    Defer { interval_secs: Option<u64> },
}

/// Application hook deciding what goes into issued credentials.
#[async_trait]
pub trait CredentialMapper: Debug + Send + Sync {
    async fn map(&self, context: MappingContext<'_>) -> anyhow::Result<MappedCredential>;
}

/// An OpenID4VCI credential issuer, including its authorization server.
#[derive(Debug, Clone)]
pub struct Issuer {
    config: EngineConfig,
    record: IssuerRecord,
    trust: TrustCallbacks,
    policy: TrustPolicy,
    codecs: CodecRegistry,
    mapper: Arc<dyn CredentialMapper>,
    sessions: Arc<dyn SessionStore<IssuanceSession>>,
    verifier: Option<Verifier>,
}

impl Issuer {
    pub fn builder() -> IssuerBuilder {
        IssuerBuilder::default()
    }

    pub fn record(&self) -> &IssuerRecord {
        &self.record
    }

    pub async fn find_session(&self, id: &str) -> Result<IssuanceSession> {
        Ok(self.sessions.get(id).await?.session)
    }

    /// Move every session past its expiry to `Expired`. Returns how many were.
    #[tracing::instrument(skip_all)]
    pub async fn expire_sessions(&self) -> Result<usize> {
        let now = now();
        let stale = self
            .sessions
            .find(&|session: &IssuanceSession| session.is_expired(now))
            .await?;
        let mut expired = 0;
        for (id, mut versioned) in stale {
            versioned.session.apply(IssuanceEvent::Expired)?;
            match self
                .sessions
                .compare_and_swap(&id, versioned.revision, versioned.session)
                .await
            {
                Ok(_) => expired += 1,
                Err(Error::Conflict(_)) => warn!(session = id, "session changed while expiring"),
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Reject sessions past their expiry, recording the expiry.
    async fn ensure_active(
        &self,
        mut versioned: Versioned<IssuanceSession>,
    ) -> Result<Versioned<IssuanceSession>> {
        if versioned.session.is_expired(now()) {
            let id = versioned.session.id.clone();
            versioned.session.apply(IssuanceEvent::Expired)?;
            self.sessions
                .compare_and_swap(&id, versioned.revision, versioned.session)
                .await?;
            return Err(Error::Expired(format!("issuance session '{id}'")));
        }
        if versioned.session.state.is_terminal() {
            return Err(Error::invalid_request(format!(
                "issuance session '{}' is {:?}",
                versioned.session.id, versioned.session.state
            )));
        }
        Ok(versioned)
    }

    async fn save(&self, versioned: Versioned<IssuanceSession>) -> Result<Versioned<IssuanceSession>> {
        let revision = self
            .sessions
            .compare_and_swap(&versioned.session.id, versioned.revision, versioned.session.clone())
            .await?;
        Ok(Versioned {
            revision,
            session: versioned.session,
        })
    }

    /// Record `error` on the session and move it to `Error`, then return the error.
    async fn fail(&self, mut versioned: Versioned<IssuanceSession>, error: Error) -> Error {
        versioned.session.errors.push(error.to_string());
        if versioned.session.apply(IssuanceEvent::Failed).is_ok() {
            if let Err(e) = self.save(versioned).await {
                warn!("unable to record issuance failure: {e}");
            }
        }
        error
    }
}

/// Builder struct for [Issuer].
#[derive(Debug, Clone, Default)]
pub struct IssuerBuilder {
    config: EngineConfig,
    record: Option<IssuerRecord>,
    trust: Option<TrustCallbacks>,
    policy: TrustPolicy,
    codecs: CodecRegistry,
    mapper: Option<Arc<dyn CredentialMapper>>,
    sessions: Option<Arc<dyn SessionStore<IssuanceSession>>>,
    verifier: Option<Verifier>,
}

impl IssuerBuilder {
    pub fn build(self) -> Result<Issuer> {
        let Some(record) = self.record else {
            return Err(Error::server("issuer record is required, see `with_record`"));
        };
        let Some(trust) = self.trust else {
            return Err(Error::server("trust callbacks are required, see `with_trust`"));
        };
        let Some(mapper) = self.mapper else {
            return Err(Error::server("credential mapper is required, see `with_mapper`"));
        };
        let Some(sessions) = self.sessions else {
            return Err(Error::server("session store is required, see `with_session_store`"));
        };
        if record.authorization.presentation_during_issuance.is_some() && self.verifier.is_none() {
            return Err(Error::server(
                "presentation during issuance requires a verifier, see `with_verifier`",
            ));
        }
        Ok(Issuer {
            trust: trust.with_config(&self.config),
            config: self.config,
            record,
            policy: self.policy,
            codecs: self.codecs,
            mapper,
            sessions,
            verifier: self.verifier,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_record(mut self, record: IssuerRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_trust(mut self, trust: TrustCallbacks) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Trusted wallet provider certificates for key and client attestations.
    pub fn with_trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn CredentialMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore<IssuanceSession>>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Verifier used for presentation during issuance.
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }
}
