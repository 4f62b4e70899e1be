use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::request::AuthorizationRequestObject;
use crate::{
    config::ProtocolVersion,
    core::{credential_format::ClaimFormatDesignation, transaction_data::TransactionDataHash},
    error::{Error, Result},
    query::{CredentialQuery, QueryMatch},
    trust::JwtSigner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    RequestCreated,
    RequestUriRetrieved,
    ResponseVerified,
    Error,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationEvent {
    RequestUriRetrieved,
    ResponseVerified,
    Failed,
    Expired,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::ResponseVerified | VerificationState::Error | VerificationState::Expired
        )
    }

    /// Whether the session still waits for the wallet's response.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            VerificationState::RequestCreated | VerificationState::RequestUriRetrieved
        )
    }

    pub fn next(self, event: VerificationEvent) -> Result<VerificationState> {
        use VerificationEvent as E;
        use VerificationState as S;

        if self.is_terminal() {
            return Err(Error::invalid_request(format!(
                "verification session is {self:?}, no further transitions are allowed"
            )));
        }
        Ok(match event {
            E::RequestUriRetrieved => S::RequestUriRetrieved,
            E::ResponseVerified => S::ResponseVerified,
            E::Failed => S::Error,
            E::Expired => S::Expired,
        })
    }
}

/// A presentation that passed verification, as recorded in the [VerifiedResult].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedCredential {
    pub format: ClaimFormatDesignation,
    pub presentation: String,
    /// Claims the holder disclosed.
    pub claims: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
}

/// Outcome of a successful response verification. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedResult {
    /// Verified presentations keyed by credential query or input descriptor id.
    pub presentations: BTreeMap<String, Vec<VerifiedCredential>>,
    pub query_match: QueryMatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transaction_data: Vec<TransactionDataHash>,
}

/// One authorization request lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub id: String,
    pub verifier_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_correlation_id: Option<String>,
    pub state: VerificationState,
    pub protocol_version: ProtocolVersion,
    pub signer: JwtSigner,
    /// The query the response is matched against. Never taken from the response.
    pub query: CredentialQuery,
    pub request: AuthorizationRequestObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_jwt: Option<String>,
    /// Set when the request is passed by reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,
    /// KMS key id of the response encryption key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_result: Option<VerifiedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationSession {
    pub fn apply(&mut self, event: VerificationEvent) -> Result<()> {
        let next = self.state.next(event)?;
        tracing::debug!(session = self.id, from = ?self.state, to = ?next, "verification transition");
        self.state = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_pending() && self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_sessions_are_final() {
        let state = VerificationState::RequestCreated
            .next(VerificationEvent::RequestUriRetrieved)
            .unwrap()
            .next(VerificationEvent::ResponseVerified)
            .unwrap();
        assert_eq!(state, VerificationState::ResponseVerified);
        assert!(state.next(VerificationEvent::ResponseVerified).is_err());
        assert!(state.next(VerificationEvent::Failed).is_err());
        assert!(VerificationState::Error
            .next(VerificationEvent::Expired)
            .is_err());
    }
}
