use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::{
    credential::CredentialRequest, notification::NotificationEvent, offer::CredentialOfferPayload,
};
use crate::{
    core::holder_binding::HolderBinding,
    error::{Error, Result},
    verifier::VerifiedResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceState {
    OfferCreated,
    OfferUriRetrieved,
    AuthorizationInitiated,
    AuthorizationGranted,
    AccessTokenRequested,
    AccessTokenCreated,
    CredentialRequestReceived,
    /// Some of the offered configurations were issued, the access token may be used again.
    CredentialsPartiallyIssued,
    Deferred,
    Completed,
    Error,
    Expired,
}

/// Inputs that move an issuance session forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceEvent {
    OfferUriRetrieved,
    AuthorizationStarted,
    AuthorizationGranted,
    TokenRequested,
    TokenCreated,
    CredentialRequested,
    /// Credentials were issued; `complete` when every offered configuration has been.
    CredentialsIssued { complete: bool },
    Deferred,
    Failed,
    Expired,
}

impl IssuanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IssuanceState::Completed | IssuanceState::Error | IssuanceState::Expired
        )
    }

    /// The transition function of the issuance state machine.
    pub fn next(self, event: IssuanceEvent) -> Result<IssuanceState> {
        use IssuanceEvent as E;
        use IssuanceState as S;

        if self.is_terminal() {
            return Err(Error::invalid_request(format!(
                "issuance session is {self:?}, no further transitions are allowed"
            )));
        }
        let next = match (self, event) {
            (_, E::Failed) => S::Error,
            (_, E::Expired) => S::Expired,
            (S::OfferCreated | S::OfferUriRetrieved, E::OfferUriRetrieved) => S::OfferUriRetrieved,
            (
                S::OfferCreated | S::OfferUriRetrieved | S::AuthorizationInitiated,
                E::AuthorizationStarted,
            ) => S::AuthorizationInitiated,
            (
                S::OfferCreated | S::OfferUriRetrieved | S::AuthorizationInitiated,
                E::AuthorizationGranted,
            ) => S::AuthorizationGranted,
            (
                S::OfferCreated | S::OfferUriRetrieved | S::AuthorizationGranted,
                E::TokenRequested,
            ) => S::AccessTokenRequested,
            (S::AccessTokenRequested, E::TokenCreated) => S::AccessTokenCreated,
            (
                S::AccessTokenCreated | S::CredentialsPartiallyIssued | S::Deferred,
                E::CredentialRequested,
            ) => S::CredentialRequestReceived,
            (S::CredentialRequestReceived | S::Deferred, E::CredentialsIssued { complete }) => {
                if complete {
                    S::Completed
                } else {
                    S::CredentialsPartiallyIssued
                }
            }
            (S::CredentialRequestReceived | S::Deferred, E::Deferred) => S::Deferred,
            (state, event) => {
                return Err(Error::invalid_request(format!(
                    "{event:?} is not allowed while the issuance session is {state:?}"
                )))
            }
        };
        Ok(next)
    }
}

/// Authorization requirements and progress of one issuance session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAuthorization {
    pub require_dpop: bool,
    pub require_wallet_attestation: bool,
    /// Require a presentation before releasing an authorization code.
    pub require_presentation: bool,
    /// The `issuer_state` of the authorization code grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Configuration ids covered by the granted scope, `None` until authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Thumbprint of the DPoP key the authorization was bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed: Option<PushedAuthorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<AuthorizationCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chained: Option<ChainedAuthorizationState>,
}

/// A pushed authorization request waiting for the user at the authorization endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedAuthorization {
    pub request_uri: String,
    pub expires_at: DateTime<Utc>,
    pub wallet: PkceChallenge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// The wallet's PKCE parameters, kept until the code is released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// An authorization delegated to an external authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedAuthorizationState {
    /// `state` sent to the external server.
    pub state: String,
    /// PKCE verifier used towards the external server.
    pub code_verifier: String,
    pub requested_scopes: Vec<String>,
    /// The wallet's own PKCE challenge for the code released afterwards.
    pub wallet: PkceChallenge,
}

/// Identity captured from a chained authorization server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedIdentity {
    pub token_response: Map<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_claims: Option<Map<String, Json>>,
    pub granted_scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationDuringIssuance {
    pub auth_session: String,
    pub verification_session_id: String,
    /// The wallet's PKCE challenge for the code released after the presentation.
    pub wallet: PkceChallenge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_result: Option<VerifiedResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenState {
    /// `jti` of the issued access token.
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
    /// Thumbprint of the DPoP key the token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
    pub c_nonce: String,
    pub c_nonce_expires_at: DateTime<Utc>,
}

/// A credential request waiting for its credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTransaction {
    pub configuration_id: String,
    pub request: CredentialRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<HolderBinding>,
}

/// One credential offer lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceSession {
    pub id: String,
    pub issuer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_correlation_id: Option<String>,
    pub state: IssuanceState,
    pub credential_offer: CredentialOfferPayload,
    pub credential_offer_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_authorized_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_code: Option<String>,
    pub authorization: SessionAuthorization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chained_identity: Option<ChainedIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<PresentationDuringIssuance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessTokenState>,
    /// Caller supplied data handed to the credential mapper.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub issuance_metadata: Map<String, Json>,
    #[serde(default)]
    pub deferred_transactions: BTreeMap<String, DeferredTransaction>,
    /// Configuration ids that credentials were issued for.
    #[serde(default)]
    pub issued_configurations: Vec<String>,
    #[serde(default)]
    pub issued_credentials: Vec<String>,
    /// Notification ids handed out with issued credentials, with the event the wallet
    /// reported for each.
    #[serde(default)]
    pub notifications: BTreeMap<String, Option<NotificationEvent>>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuanceSession {
    pub fn apply(&mut self, event: IssuanceEvent) -> Result<()> {
        let next = self.state.next(event)?;
        tracing::debug!(session = self.id, from = ?self.state, to = ?next, "issuance transition");
        self.state = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.expires_at <= now
    }

    /// Whether every offered configuration has had credentials issued.
    pub fn all_issued(&self) -> bool {
        self.credential_offer
            .credential_configuration_ids
            .iter()
            .all(|id| self.issued_configurations.contains(id))
    }

    /// Offered configuration ids the holder is authorized for: those of the granted
    /// scope after an authorization, all offered ones otherwise.
    pub fn granted_configuration_ids<'a>(&'a self, scoped: &'a [String]) -> Vec<&'a str> {
        let offered = &self.credential_offer.credential_configuration_ids;
        match &self.authorization.scope {
            None => offered.iter().map(String::as_str).collect(),
            Some(_) => offered
                .iter()
                .filter(|id| scoped.contains(id))
                .map(String::as_str)
                .collect(),
        }
    }
}
