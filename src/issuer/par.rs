//! Pushed authorization requests (RFC 9126) and the authorization endpoint they are
//! redeemed at. User authentication happens at the chained authorization server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{
    dpop::DpopProof,
    session::{IssuanceSession, IssuanceState, PkceChallenge, PushedAuthorization},
    token::ClientAttestationHeaders,
    IssuanceEvent, Issuer,
};
use crate::{
    error::{Error, ErrorCode, Result},
    session::find_one,
    utils::{later, now, random_id},
};

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";
const REQUEST_URI_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedAuthorizationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(skip)]
    pub dpop: Option<DpopProof>,
    #[serde(skip)]
    pub client_attestation: Option<ClientAttestationHeaders>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedAuthorizationResponse {
    pub request_uri: String,
    pub expires_in: u64,
}

fn invalid_scope(description: impl Into<String>) -> Error {
    Error::client(ErrorCode::InvalidScope, description)
}

impl Issuer {
    /// Store an authorization request for an offer and hand back its `request_uri`.
    ///
    /// A DPoP proof binds the authorization: the token request must then be made with
    /// the same key.
    #[instrument(skip_all)]
    pub async fn push_authorization_request(
        &self,
        request: PushedAuthorizationRequest,
    ) -> Result<PushedAuthorizationResponse> {
        let issuer_state = request.issuer_state.as_deref().ok_or_else(|| {
            Error::invalid_request(
                "Missing required 'issuer_state' parameter. Only requests initiated by a credential offer are supported",
            )
        })?;
        let requested = request
            .scope
            .as_deref()
            .ok_or_else(|| invalid_scope("Missing required 'scope' parameter"))?;
        if request.response_type.as_deref().is_some_and(|t| t != "code") {
            return Err(Error::invalid_request("'response_type' must be 'code'"));
        }
        let (_, versioned) = find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
            s.authorization.issuer_state.as_deref() == Some(issuer_state)
        })
        .await?
        .ok_or_else(|| Error::invalid_request("Invalid 'issuer_state' parameter"))?;
        let mut versioned = self.ensure_active(versioned).await?;
        if !matches!(
            versioned.session.state,
            IssuanceState::OfferCreated | IssuanceState::OfferUriRetrieved
        ) {
            return Err(Error::invalid_request("Invalid 'issuer_state' parameter"));
        }

        let dpop_jkt = match &request.dpop {
            Some(proof) => Some(self.trust.verify_dpop(proof, None, None).await?),
            None => None,
        };
        let attested_client_id = self
            .check_client_attestation(&versioned.session, request.client_attestation.as_ref())
            .await?;
        let scopes = self
            .requested_scopes(&versioned.session, Some(requested))
            .map_err(|e| match e {
                Error::Client { description, .. } => invalid_scope(description),
                other => other,
            })?;

        let request_uri = format!("{REQUEST_URI_PREFIX}{}", random_id(32));
        let session = &mut versioned.session;
        if let Some(jkt) = dpop_jkt {
            session.authorization.dpop_jkt = Some(jkt);
            session.authorization.require_dpop = true;
        }
        session.authorization.client_id = attested_client_id.or(request.client_id.clone());
        session.authorization.scope = (!scopes.is_empty()).then(|| scopes.join(" "));
        session.authorization.pushed = Some(PushedAuthorization {
            request_uri: request_uri.clone(),
            expires_at: later(now(), REQUEST_URI_LIFETIME),
            wallet: PkceChallenge {
                code_challenge: request.code_challenge,
                code_challenge_method: request.code_challenge_method,
                redirect_uri: request.redirect_uri,
            },
        });
        session.apply(IssuanceEvent::AuthorizationStarted)?;
        let versioned = self.save(versioned).await?;
        info!(session = versioned.session.id, "stored pushed authorization request");
        Ok(PushedAuthorizationResponse {
            request_uri,
            expires_in: REQUEST_URI_LIFETIME.as_secs(),
        })
    }

    /// Redeem a pushed `request_uri` at the authorization endpoint. Returns the URL the
    /// user agent is redirected to for authentication.
    #[instrument(skip_all)]
    pub async fn authorize(&self, client_id: Option<&str>, request_uri: &str) -> Result<String> {
        let chained = self
            .record
            .authorization
            .chained
            .as_ref()
            .ok_or_else(|| Error::server("no chained authorization server is configured"))?;
        let (_, versioned) = find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
            s.authorization
                .pushed
                .as_ref()
                .is_some_and(|p| p.request_uri == request_uri)
        })
        .await?
        .ok_or_else(|| Error::invalid_request("Invalid 'request_uri' parameter"))?;
        let mut versioned = self.ensure_active(versioned).await?;
        let session = &mut versioned.session;
        let Some(pushed) = session.authorization.pushed.take() else {
            return Err(Error::invalid_request("Invalid 'request_uri' parameter"));
        };
        if session.state != IssuanceState::AuthorizationInitiated {
            return Err(Error::invalid_request("Invalid 'request_uri' parameter"));
        }
        if pushed.expires_at <= now() {
            return Err(Error::invalid_request("'request_uri' expired"));
        }
        if let (Some(expected), Some(client_id)) = (&session.authorization.client_id, client_id) {
            if expected != client_id {
                return Err(Error::client(
                    ErrorCode::InvalidClient,
                    "'client_id' differs from the pushed authorization request",
                ));
            }
        }
        let scopes = session
            .authorization
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        self.start_chained_authorization(chained, versioned, pushed.wallet, scopes)
            .await
    }
}
