use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{info, instrument};

use super::{
    dpop::DpopProof,
    session::{AccessTokenState, AuthorizationCode, IssuanceSession, IssuanceState},
    IssuanceEvent, Issuer,
};
use crate::{
    error::{Error, ErrorCode, Result},
    session::{find_one, Versioned},
    trust::{JwtVerification, VerificationPurpose},
    utils::{later, now, random_id, sha256_b64url, unix_now},
};

pub const ACCESS_TOKEN_TYP: &str = "at+jwt";
const ISSUANCE_SESSION_CLAIM: &str = "issuance_session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "grant_type")]
pub enum TokenGrant {
    #[serde(rename = "urn:ietf:params:oauth:grant-type:pre-authorized_code")]
    PreAuthorizedCode {
        #[serde(rename = "pre-authorized_code")]
        pre_authorized_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_code: Option<String>,
    },
    #[serde(rename = "authorization_code")]
    AuthorizationCode {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code_verifier: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect_uri: Option<String>,
    },
}

/// The `OAuth-Client-Attestation` and `OAuth-Client-Attestation-PoP` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAttestationHeaders {
    pub attestation: String,
    pub pop: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRequest {
    #[serde(flatten)]
    pub grant: TokenGrant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip)]
    pub dpop: Option<DpopProof>,
    #[serde(skip)]
    pub client_attestation: Option<ClientAttestationHeaders>,
}

impl AccessTokenRequest {
    pub fn new(grant: TokenGrant) -> Self {
        Self {
            grant,
            client_id: None,
            dpop: None,
            client_attestation: None,
        }
    }

    pub fn with_dpop(mut self, dpop: DpopProof) -> Self {
        self.dpop = Some(dpop);
        self
    }

    pub fn with_client_attestation(mut self, headers: ClientAttestationHeaders) -> Self {
        self.client_attestation = Some(headers);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// `Bearer`, or `DPoP` for sender constrained tokens.
    pub token_type: String,
    pub expires_in: u64,
    pub c_nonce: String,
    pub c_nonce_expires_in: u64,
}

/// Check a PKCE `code_verifier` against the stored challenge.
pub fn verify_pkce(challenge: &str, method: Option<&str>, verifier: &str) -> Result<()> {
    let matches = match method.unwrap_or("S256") {
        "S256" => sha256_b64url(verifier) == challenge,
        "plain" => verifier == challenge,
        other => {
            return Err(Error::invalid_request(format!(
                "unsupported code_challenge_method '{other}'"
            )))
        }
    };
    if !matches {
        return Err(Error::client(ErrorCode::InvalidGrant, "invalid 'code_verifier'"));
    }
    Ok(())
}

fn invalid_grant(description: impl Into<String>) -> Error {
    Error::client(ErrorCode::InvalidGrant, description)
}

fn check_authorization_code(
    stored: &AuthorizationCode,
    code_verifier: Option<&str>,
    redirect_uri: Option<&str>,
) -> Result<()> {
    if stored.expires_at <= now() {
        return Err(invalid_grant("authorization code expired"));
    }
    if let Some(challenge) = &stored.code_challenge {
        let verifier = code_verifier.ok_or_else(|| invalid_grant("missing 'code_verifier'"))?;
        verify_pkce(challenge, stored.code_challenge_method.as_deref(), verifier)?;
    }
    if stored.redirect_uri.is_some() && stored.redirect_uri.as_deref() != redirect_uri {
        return Err(invalid_grant("'redirect_uri' differs from the authorized one"));
    }
    Ok(())
}

impl Issuer {
    /// Exchange a pre-authorized or authorization code for an access token.
    ///
    /// Codes are single use: the session moves to `AccessTokenRequested` before the
    /// token is minted, so a concurrent or repeated exchange fails.
    #[instrument(skip_all)]
    pub async fn request_token(&self, request: AccessTokenRequest) -> Result<TokenResponse> {
        let found = match &request.grant {
            TokenGrant::PreAuthorizedCode {
                pre_authorized_code,
                ..
            } => {
                find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
                    s.pre_authorized_code.as_deref() == Some(pre_authorized_code.as_str())
                })
                .await?
            }
            TokenGrant::AuthorizationCode { code, .. } => {
                find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
                    s.authorization
                        .code
                        .as_ref()
                        .is_some_and(|c| c.code == *code)
                })
                .await?
            }
        };
        let (_, versioned) = found.ok_or_else(|| invalid_grant("unknown or invalid code"))?;
        let mut versioned = self.ensure_active(versioned).await?;
        let session = &versioned.session;

        let attested_client_id = self
            .check_client_attestation(session, request.client_attestation.as_ref())
            .await?;
        if let (Some(attested), Some(client_id)) = (&attested_client_id, &request.client_id) {
            if attested != client_id {
                return Err(Error::client(
                    ErrorCode::InvalidClient,
                    "'client_id' does not match the client attestation",
                ));
            }
        }
        let dpop_jkt = match &request.dpop {
            Some(proof) => Some(
                self.trust
                    .verify_dpop(proof, None, session.authorization.dpop_jkt.as_deref())
                    .await?,
            ),
            None if session.authorization.require_dpop => {
                return Err(Error::client(
                    ErrorCode::InvalidDpopProof,
                    "Missing required DPoP proof in access token request",
                ))
            }
            None => None,
        };

        match &request.grant {
            TokenGrant::PreAuthorizedCode { tx_code, .. } => {
                if session.tx_code.is_some() && session.tx_code != *tx_code {
                    return Err(invalid_grant("invalid 'tx_code'"));
                }
            }
            TokenGrant::AuthorizationCode {
                code_verifier,
                redirect_uri,
                ..
            } => {
                if session.state != IssuanceState::AuthorizationGranted {
                    return Err(invalid_grant("authorization code was already used"));
                }
                let stored = session
                    .authorization
                    .code
                    .as_ref()
                    .ok_or_else(|| invalid_grant("unknown or invalid code"))?;
                check_authorization_code(stored, code_verifier.as_deref(), redirect_uri.as_deref())?;
                if let (Some(authorized), Some(client_id)) =
                    (&session.authorization.client_id, &request.client_id)
                {
                    if authorized != client_id {
                        return Err(Error::client(
                            ErrorCode::InvalidClient,
                            "'client_id' differs from the authorized one",
                        ));
                    }
                }
            }
        }

        versioned
            .session
            .apply(IssuanceEvent::TokenRequested)
            .map_err(|_| invalid_grant("the code was already used"))?;
        if let Some(client_id) = attested_client_id.or(request.client_id) {
            versioned.session.authorization.client_id = Some(client_id);
        }
        let versioned = self.save(versioned).await?;

        match self.mint_access_token(versioned.clone(), dpop_jkt).await {
            Ok(response) => Ok(response),
            Err(e) => Err(self.fail(versioned, e).await),
        }
    }

    async fn mint_access_token(
        &self,
        mut versioned: Versioned<IssuanceSession>,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse> {
        let issued_at = now();
        let token_id = random_id(32);
        let expires_at = later(issued_at, self.config.access_token_lifetime());
        let mut payload = Map::new();
        payload.insert("iss".into(), self.record.issuer_id.as_str().into());
        payload.insert("aud".into(), self.record.issuer_id.as_str().into());
        payload.insert("sub".into(), versioned.session.id.as_str().into());
        payload.insert("jti".into(), token_id.as_str().into());
        payload.insert("iat".into(), issued_at.timestamp().into());
        payload.insert("exp".into(), expires_at.timestamp().into());
        payload.insert(
            ISSUANCE_SESSION_CLAIM.into(),
            versioned.session.id.as_str().into(),
        );
        if let Some(client_id) = &versioned.session.authorization.client_id {
            payload.insert("client_id".into(), client_id.as_str().into());
        }
        if let Some(jkt) = &dpop_jkt {
            payload.insert("cnf".into(), json!({ "jkt": jkt }));
        }
        let mut header = Map::new();
        header.insert("typ".into(), ACCESS_TOKEN_TYP.into());
        let access_token = self
            .trust
            .sign_jwt(&self.record.access_token_signer, header, payload)
            .await?;

        let c_nonce = random_id(32);
        versioned.session.access_token = Some(AccessTokenState {
            token_id,
            expires_at,
            dpop_jkt: dpop_jkt.clone(),
            c_nonce: c_nonce.clone(),
            c_nonce_expires_at: later(issued_at, self.config.c_nonce_lifetime()),
        });
        versioned.session.apply(IssuanceEvent::TokenCreated)?;
        let versioned = self.save(versioned).await?;
        info!(session = versioned.session.id, "issued access token");

        Ok(TokenResponse {
            access_token,
            token_type: if dpop_jkt.is_some() { "DPoP" } else { "Bearer" }.into(),
            expires_in: self.config.access_token_lifetime_secs,
            c_nonce,
            c_nonce_expires_in: self.config.c_nonce_lifetime_secs,
        })
    }

    /// Validate the wallet attestation headers, returning the attested client id.
    pub(super) async fn check_client_attestation(
        &self,
        session: &IssuanceSession,
        headers: Option<&ClientAttestationHeaders>,
    ) -> Result<Option<String>> {
        if session.authorization.require_wallet_attestation
            && self
                .policy
                .context(VerificationPurpose::ClientAttestation)?
                .certificates
                .is_empty()
        {
            return Err(Error::server(
                "wallet attestations are required but no trusted wallet provider certificates are configured",
            ));
        }
        let Some(headers) = headers else {
            if session.authorization.require_wallet_attestation {
                return Err(Error::client(
                    ErrorCode::InvalidClient,
                    "Missing required client attestation parameters in access token request",
                ));
            }
            return Ok(None);
        };
        let attested = self
            .trust
            .validate_client_attestation(
                &headers.attestation,
                &headers.pop,
                &self.policy,
                &self.record.issuer_id,
                None,
            )
            .await?;
        Ok(Some(attested.client_id))
    }

    /// Verify an access token (and its DPoP binding) and load the active session it was
    /// issued for.
    pub(crate) async fn authorize_access_token(
        &self,
        access_token: &str,
        dpop: Option<&DpopProof>,
    ) -> Result<Versioned<IssuanceSession>> {
        let versioned = self.access_token_session(access_token, dpop).await?;
        self.ensure_active(versioned).await
    }

    /// Like [Issuer::authorize_access_token], in whatever state the session is.
    pub(super) async fn access_token_session(
        &self,
        access_token: &str,
        dpop: Option<&DpopProof>,
    ) -> Result<Versioned<IssuanceSession>> {
        let key = self.trust.signer_key(&self.record.access_token_signer).await?;
        let verified = self
            .trust
            .verify_jwt(access_token, &JwtVerification::with_jwk(key), &Default::default())
            .await?;
        if verified.typ() != Some(ACCESS_TOKEN_TYP)
            || verified.claim_str("iss") != Some(self.record.issuer_id.as_str())
        {
            return Err(Error::trust("access token was not issued by this issuer"));
        }
        let expired = verified
            .payload
            .get("exp")
            .and_then(Json::as_i64)
            .map_or(true, |exp| exp <= unix_now());
        if expired {
            return Err(Error::Expired("access token".into()));
        }
        let session_id = verified
            .claim_str(ISSUANCE_SESSION_CLAIM)
            .ok_or_else(|| Error::trust("access token has no issuance session"))?;
        let versioned = self.sessions.get(session_id).await?;

        let state = versioned
            .session
            .access_token
            .as_ref()
            .ok_or_else(|| Error::invalid_request("no access token was issued for this session"))?;
        if verified.claim_str("jti") != Some(state.token_id.as_str()) {
            return Err(Error::trust("access token was superseded"));
        }
        let bound_jkt = verified
            .payload
            .get("cnf")
            .and_then(|cnf| cnf.get("jkt"))
            .and_then(Json::as_str);
        match (bound_jkt, dpop) {
            (Some(jkt), Some(proof)) => {
                self.trust
                    .verify_dpop(proof, Some(access_token), Some(jkt))
                    .await?;
            }
            (Some(_), None) => {
                return Err(Error::client(
                    ErrorCode::InvalidDpopProof,
                    "access token is DPoP bound but no DPoP proof was sent",
                ))
            }
            (None, _) => {}
        }
        Ok(versioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_methods() {
        let verifier = "holder-generated-code-verifier";
        let challenge = sha256_b64url(verifier);
        verify_pkce(&challenge, None, verifier).unwrap();
        verify_pkce(&challenge, Some("S256"), verifier).unwrap();
        verify_pkce(verifier, Some("plain"), verifier).unwrap();
        let err = verify_pkce(&challenge, Some("S256"), "other").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidGrant));
        assert!(verify_pkce(&challenge, Some("S512"), verifier).is_err());
    }

    #[test]
    fn token_request_form_fields() {
        let request: AccessTokenRequest = serde_json::from_value(serde_json::json!({
            "grant_type": "urn:ietf:params:oauth:grant-type:pre-authorized_code",
            "pre-authorized_code": "abc",
            "tx_code": "123456"
        }))
        .unwrap();
        assert_eq!(
            request.grant,
            TokenGrant::PreAuthorizedCode {
                pre_authorized_code: "abc".into(),
                tx_code: Some("123456".into())
            }
        );
    }
}
