//! The OpenID4VP verifier (relying party).

use std::{fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
    codec::CodecRegistry,
    config::EngineConfig,
    error::{Error, Result},
    session::{SessionStore, Versioned},
    trust::{TrustCallbacks, TrustPolicy},
    utils::now,
};

pub mod request;
pub mod response;
pub mod session;

pub use request::{
    AuthorizationRequestObject, ClientMetadata, CreateAuthorizationRequestOptions,
    CreatedAuthorizationRequest, RequestDelivery, ResponseMode,
};
pub use response::AuthorizationResponse;
pub use session::{
    VerificationEvent, VerificationSession, VerificationState, VerifiedCredential, VerifiedResult,
};

fn default_enc_values() -> Vec<String> {
    vec!["A128GCM".into(), "A256GCM".into()]
}

/// Verifier metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierRecord {
    /// Path segment of the verifier's endpoints below the base url.
    pub verifier_id: String,
    /// Content encryptions offered for encrypted responses, most preferred first.
    #[serde(default = "default_enc_values")]
    pub encrypted_response_enc_values_supported: Vec<String>,
}

impl VerifierRecord {
    pub fn new(verifier_id: impl Into<String>) -> Self {
        Self {
            verifier_id: verifier_id.into(),
            encrypted_response_enc_values_supported: default_enc_values(),
        }
    }
}

/// An OpenID4VP verifier, also known as the client.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: EngineConfig,
    record: VerifierRecord,
    trust: TrustCallbacks,
    policy: TrustPolicy,
    codecs: CodecRegistry,
    sessions: Arc<dyn SessionStore<VerificationSession>>,
}

impl Verifier {
    /// Build a new verifier.
    pub fn builder() -> VerifierBuilder {
        VerifierBuilder::default()
    }

    pub fn record(&self) -> &VerifierRecord {
        &self.record
    }

    /// Current state of a verification session, for polling by the application frontend.
    pub async fn find_session(&self, id: &str) -> Result<VerificationSession> {
        Ok(self.sessions.get(id).await?.session)
    }

    /// Move every pending session past its expiry to `Expired`. Returns how many were.
    #[tracing::instrument(skip_all)]
    pub async fn expire_sessions(&self) -> Result<usize> {
        let now = now();
        let stale = self
            .sessions
            .find(&|session: &VerificationSession| session.is_expired(now))
            .await?;
        let mut expired = 0;
        for (id, mut versioned) in stale {
            versioned.session.apply(VerificationEvent::Expired)?;
            match self
                .sessions
                .compare_and_swap(&id, versioned.revision, versioned.session.clone())
                .await
            {
                Ok(_) => {
                    self.release_encryption_key(&versioned.session).await;
                    expired += 1;
                }
                Err(Error::Conflict(_)) => warn!(session = id, "session changed while expiring"),
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .endpoint(path)
            .map_err(|e| Error::server(format!("invalid endpoint '{path}': {e}")))
    }

    /// Reject sessions that no longer wait for a response, recording an expiry.
    async fn ensure_pending(
        &self,
        mut versioned: Versioned<VerificationSession>,
    ) -> Result<Versioned<VerificationSession>> {
        if versioned.session.is_expired(now()) {
            let id = versioned.session.id.clone();
            versioned.session.apply(VerificationEvent::Expired)?;
            self.sessions
                .compare_and_swap(&id, versioned.revision, versioned.session.clone())
                .await?;
            self.release_encryption_key(&versioned.session).await;
            return Err(Error::Expired(format!("verification session '{id}'")));
        }
        if !versioned.session.state.is_pending() {
            return Err(Error::invalid_request(format!(
                "Invalid session: verification session '{}' is {:?}",
                versioned.session.id, versioned.session.state
            )));
        }
        Ok(versioned)
    }

    async fn save(
        &self,
        versioned: Versioned<VerificationSession>,
    ) -> Result<Versioned<VerificationSession>> {
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
    async fn fail(&self, mut versioned: Versioned<VerificationSession>, error: Error) -> Error {
        versioned.session.error_message = Some(error.to_string());
        if versioned.session.apply(VerificationEvent::Failed).is_ok() {
            match self.save(versioned).await {
                Ok(saved) => self.release_encryption_key(&saved.session).await,
                Err(e) => warn!("unable to record verification failure: {e}"),
            }
        }
        error
    }

    /// Delete the response encryption key of a session that reached a terminal state.
    async fn release_encryption_key(&self, session: &VerificationSession) {
        if let Some(key_id) = &session.encryption_key_id {
            self.delete_encryption_key(key_id).await;
        }
    }

    async fn delete_encryption_key(&self, key_id: &str) {
        match self.trust.kms().delete_key(key_id).await {
            Ok(()) => debug!(key_id, "deleted response encryption key"),
            Err(e) => warn!(key_id, "unable to delete response encryption key: {e:#}"),
        }
    }
}

/// Builder struct for [Verifier].
#[derive(Debug, Clone, Default)]
pub struct VerifierBuilder {
    config: EngineConfig,
    record: Option<VerifierRecord>,
    trust: Option<TrustCallbacks>,
    policy: TrustPolicy,
    codecs: CodecRegistry,
    sessions: Option<Arc<dyn SessionStore<VerificationSession>>>,
}

impl VerifierBuilder {
    pub fn build(self) -> Result<Verifier> {
        let Some(record) = self.record else {
            return Err(Error::server("verifier record is required, see `with_record`"));
        };
        let Some(trust) = self.trust else {
            return Err(Error::server("trust callbacks are required, see `with_trust`"));
        };
        let Some(sessions) = self.sessions else {
            return Err(Error::server("session store is required, see `with_session_store`"));
        };
        Ok(Verifier {
            trust: trust.with_config(&self.config),
            config: self.config,
            record,
            policy: self.policy,
            codecs: self.codecs,
            sessions,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_record(mut self, record: VerifierRecord) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_trust(mut self, trust: TrustCallbacks) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Trusted issuer certificates and federation anchors for received presentations.
    pub fn with_trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_session_store(
        mut self,
        sessions: Arc<dyn SessionStore<VerificationSession>>,
    ) -> Self {
        self.sessions = Some(sessions);
        self
    }
}
