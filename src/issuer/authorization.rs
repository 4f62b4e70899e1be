//! The authorization challenge endpoint: first-party authorization for wallets,
//! optionally gated on a presentation (presentation during issuance).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, instrument};

use super::{
    session::{AuthorizationCode, IssuanceSession, IssuanceState, PkceChallenge, PresentationDuringIssuance},
    token::ClientAttestationHeaders,
    IssuanceEvent, Issuer,
};
use crate::{
    error::{Error, ErrorCode, Result},
    session::{find_one, Versioned},
    utils::{b64url_encode, later, now},
    verifier::{CreateAuthorizationRequestOptions, VerificationState},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationChallengeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Space separated scopes. Defaults to the scopes of every offered configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(skip)]
    pub client_attestation: Option<ClientAttestationHeaders>,
}

impl AuthorizationChallengeRequest {
    pub fn new(issuer_state: impl Into<String>) -> Self {
        Self {
            issuer_state: Some(issuer_state.into()),
            ..Default::default()
        }
    }

    fn pkce(&self) -> PkceChallenge {
        PkceChallenge {
            code_challenge: self.code_challenge.clone(),
            code_challenge_method: self.code_challenge_method.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationChallengeResponse {
    /// Authorization was granted right away.
    AuthorizationCode { authorization_code: String },
    /// Answered with `insufficient_authorization`: the wallet must present credentials
    /// first and then come back with `auth_session`.
    PresentationRequired {
        auth_session: String,
        verification_session_id: String,
        /// `openid4vp://` URL of the authorization request, or the DC API request.
        presentation: PresentationRequest,
    },
}

impl AuthorizationChallengeResponse {
    /// The OAuth error code this outcome is reported with, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            AuthorizationChallengeResponse::PresentationRequired { .. } => {
                Some(ErrorCode::InsufficientAuthorization)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresentationRequest {
    Url(String),
    DcApi(Json),
}

fn invalid_auth_session() -> Error {
    Error::client(ErrorCode::InvalidAuthSession, "Invalid 'auth_session'")
}

impl Issuer {
    /// Start the authorization of an offer made with the authorization code grant.
    #[instrument(skip_all)]
    pub async fn request_authorization_challenge(
        &self,
        request: AuthorizationChallengeRequest,
    ) -> Result<AuthorizationChallengeResponse> {
        let issuer_state = request.issuer_state.as_deref().ok_or_else(|| {
            Error::invalid_request(
                "Missing required 'issuer_state' parameter. Only requests initiated by a credential offer are supported",
            )
        })?;
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

        if !versioned.session.authorization.require_presentation
            && self.record.authorization.chained.is_some()
        {
            return Err(Error::client(
                ErrorCode::RedirectToWeb,
                "The user authenticates in a browser, use a pushed authorization request",
            ));
        }

        let attested_client_id = self
            .check_client_attestation(&versioned.session, request.client_attestation.as_ref())
            .await?;
        let scopes = self.requested_scopes(&versioned.session, request.scope.as_deref())?;
        let session = &mut versioned.session;
        session.authorization.client_id = attested_client_id.or(request.client_id.clone());
        session.authorization.scope = (!scopes.is_empty()).then(|| scopes.join(" "));

        if session.authorization.require_presentation {
            return self.request_presentation(versioned, request.pkce()).await;
        }
        let authorization_code = self.grant_authorization_code(versioned, request.pkce()).await?;
        Ok(AuthorizationChallengeResponse::AuthorizationCode { authorization_code })
    }

    /// Release the authorization code once the presentation of `auth_session` verified.
    #[instrument(skip_all)]
    pub async fn retrieve_authorization_code_using_presentation(
        &self,
        auth_session: &str,
    ) -> Result<String> {
        let (_, versioned) = find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
            s.presentation
                .as_ref()
                .is_some_and(|p| p.auth_session == auth_session)
        })
        .await?
        .ok_or_else(invalid_auth_session)?;
        let mut versioned = self.ensure_active(versioned).await?;
        if versioned.session.state != IssuanceState::AuthorizationInitiated {
            return Err(invalid_auth_session());
        }
        let Some(mut presentation) = versioned.session.presentation.clone() else {
            return Err(invalid_auth_session());
        };
        let verifier = self.presentation_verifier()?;

        let verification = match verifier.find_session(&presentation.verification_session_id).await {
            Ok(verification) => verification,
            Err(Error::NotFound(_)) => {
                let error = invalid_auth_session();
                return Err(self.fail(versioned, error).await);
            }
            Err(e) => return Err(e),
        };
        match verification.state {
            VerificationState::ResponseVerified => {}
            VerificationState::Error => {
                let error = Error::client(
                    ErrorCode::InvalidPresentation,
                    "Invalid presentation for 'auth_session'",
                );
                return Err(self.fail(versioned, error).await);
            }
            _ => {
                return Err(Error::client(
                    ErrorCode::InvalidPresentation,
                    "Invalid presentation for 'auth_session'",
                ))
            }
        }

        presentation.verified_result = verification.verified_result;
        let wallet = presentation.wallet.clone();
        versioned.session.presentation = Some(presentation);
        self.grant_authorization_code(versioned, wallet).await
    }

    /// Scopes requested by the wallet, restricted to those of the offered configurations.
    pub(super) fn requested_scopes(&self, session: &IssuanceSession, requested: Option<&str>) -> Result<Vec<String>> {
        let mut offered = vec![];
        for id in &session.credential_offer.credential_configuration_ids {
            if let Some(scope) = &self.record.configuration(id)?.scope {
                if !offered.contains(scope) {
                    offered.push(scope.clone());
                }
            }
        }
        if offered.is_empty() {
            // Configurations without scopes are authorized as a whole.
            return Ok(vec![]);
        }
        let scopes: Vec<String> = match requested {
            None => offered,
            Some(requested) => requested
                .split_whitespace()
                .filter(|scope| offered.iter().any(|o| o == scope))
                .map(str::to_string)
                .collect(),
        };
        if scopes.is_empty() {
            return Err(Error::invalid_request(
                "No requested 'scope' values match with offered credential configurations",
            ));
        }
        Ok(scopes)
    }

    fn presentation_verifier(&self) -> Result<&crate::verifier::Verifier> {
        self.verifier.as_ref().ok_or_else(|| {
            Error::server("presentation during issuance requires a verifier, see `with_verifier`")
        })
    }

    async fn request_presentation(
        &self,
        mut versioned: Versioned<IssuanceSession>,
        wallet: PkceChallenge,
    ) -> Result<AuthorizationChallengeResponse> {
        let config = self
            .record
            .authorization
            .presentation_during_issuance
            .as_ref()
            .ok_or_else(|| Error::server("presentation during issuance is not configured"))?;
        let verifier = self.presentation_verifier()?;

        let mut options =
            CreateAuthorizationRequestOptions::new(config.query.clone(), config.signer.clone())
                .with_response_mode(config.response_mode);
        options.context_correlation_id = Some(versioned.session.id.clone());
        let created = verifier.create_authorization_request(options).await?;

        let auth_session = b64url_encode(self.trust.kms().random_bytes(32).await?);
        versioned.session.presentation = Some(PresentationDuringIssuance {
            auth_session: auth_session.clone(),
            verification_session_id: created.session.id.clone(),
            wallet,
            verified_result: None,
        });
        versioned.session.apply(IssuanceEvent::AuthorizationStarted)?;
        let versioned = self.save(versioned).await?;
        info!(
            session = versioned.session.id,
            verification_session = created.session.id,
            "presentation required before issuance"
        );

        let presentation = match (created.authorization_request_url, created.dc_api_request) {
            (Some(url), _) => PresentationRequest::Url(url),
            (None, Some(request)) => PresentationRequest::DcApi(request),
            (None, None) => return Err(Error::server("verifier created no authorization request")),
        };
        Ok(AuthorizationChallengeResponse::PresentationRequired {
            auth_session,
            verification_session_id: created.session.id,
            presentation,
        })
    }

    /// Issue a fresh authorization code bound to the wallet's PKCE challenge.
    pub(super) async fn grant_authorization_code(
        &self,
        mut versioned: Versioned<IssuanceSession>,
        wallet: PkceChallenge,
    ) -> Result<String> {
        let code = b64url_encode(self.trust.kms().random_bytes(32).await?);
        versioned.session.authorization.code = Some(AuthorizationCode {
            code: code.clone(),
            expires_at: later(now(), self.config.authorization_code_lifetime()),
            code_challenge: wallet.code_challenge,
            code_challenge_method: wallet.code_challenge_method,
            redirect_uri: wallet.redirect_uri,
        });
        versioned.session.apply(IssuanceEvent::AuthorizationGranted)?;
        let versioned = self.save(versioned).await?;
        info!(session = versioned.session.id, "granted authorization");
        Ok(code)
    }
}
