//! Credential issuer and authorization server metadata, and the endpoints they announce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{BatchCredentialIssuance, CredentialConfiguration, Issuer};
use crate::{
    error::{Error, Result},
    trust::jwk::ES256,
};

pub const CREDENTIAL_ISSUER_WELL_KNOWN: &str = "openid-credential-issuer";
pub const AUTHORIZATION_SERVER_WELL_KNOWN: &str = "oauth-authorization-server";

pub const TOKEN_ENDPOINT: &str = "token";
pub const CREDENTIAL_ENDPOINT: &str = "credential";
pub const DEFERRED_CREDENTIAL_ENDPOINT: &str = "deferred_credential";
pub const NOTIFICATION_ENDPOINT: &str = "notification";
pub const AUTHORIZATION_CHALLENGE_ENDPOINT: &str = "authorization-challenge";
pub const PUSHED_AUTHORIZATION_REQUEST_ENDPOINT: &str = "par";
pub const AUTHORIZATION_ENDPOINT: &str = "authorize";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialIssuerMetadata {
    pub credential_issuer: String,
    /// Empty when the credential issuer is its own authorization server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_servers: Vec<String>,
    pub credential_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_credential_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_credential_issuance: Option<BatchCredentialIssuance>,
    pub credential_configurations_supported: BTreeMap<String, CredentialConfiguration>,
}

impl CredentialIssuerMetadata {
    /// The authorization server that grants access to this issuer.
    pub fn authorization_server(&self) -> &str {
        self.authorization_servers
            .first()
            .map(String::as_str)
            .unwrap_or(&self.credential_issuer)
    }
}

/// RFC 8414 metadata, with the first-party and DPoP extensions the wallet relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_challenge_endpoint: Option<String>,
    #[serde(
        rename = "pre-authorized_grant_anonymous_access_supported",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub pre_authorized_grant_anonymous_access_supported: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dpop_signing_alg_values_supported: Vec<String>,
}

/// `https://host/.well-known/<suffix>/<path>` for an identifier `https://host/<path>`.
pub fn well_known_url(identifier: &str, suffix: &str) -> Result<String> {
    let mut url = Url::parse(identifier)
        .map_err(|e| Error::invalid_request(format!("invalid identifier '{identifier}': {e}")))?;
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("/.well-known/{suffix}{path}"));
    url.set_query(None);
    Ok(url.to_string())
}

impl Issuer {
    pub(super) fn endpoint(&self, path: &str) -> Result<String> {
        self.config
            .base_url
            .endpoint(path)
            .map(String::from)
            .map_err(|e| Error::server(format!("invalid base url: {e}")))
    }

    pub fn credential_issuer_metadata(&self) -> Result<CredentialIssuerMetadata> {
        Ok(CredentialIssuerMetadata {
            credential_issuer: self.record.issuer_id.clone(),
            authorization_servers: vec![],
            credential_endpoint: self.endpoint(CREDENTIAL_ENDPOINT)?,
            deferred_credential_endpoint: Some(self.endpoint(DEFERRED_CREDENTIAL_ENDPOINT)?),
            notification_endpoint: Some(self.endpoint(NOTIFICATION_ENDPOINT)?),
            batch_credential_issuance: self.record.batch_credential_issuance,
            credential_configurations_supported: self.record.credential_configurations.clone(),
        })
    }

    /// The first-party authorization challenge endpoint is announced unless user
    /// authentication is delegated to a chained server without presentation during
    /// issuance. Pushed authorization requests need the chained server.
    pub fn authorization_server_metadata(&self) -> Result<AuthorizationServerMetadata> {
        let policy = &self.record.authorization;
        let redirect_flow = policy.chained.is_some();
        let first_party = !redirect_flow || policy.presentation_during_issuance.is_some();
        Ok(AuthorizationServerMetadata {
            issuer: self.record.issuer_id.clone(),
            token_endpoint: self.endpoint(TOKEN_ENDPOINT)?,
            authorization_endpoint: redirect_flow
                .then(|| self.endpoint(AUTHORIZATION_ENDPOINT))
                .transpose()?,
            pushed_authorization_request_endpoint: redirect_flow
                .then(|| self.endpoint(PUSHED_AUTHORIZATION_REQUEST_ENDPOINT))
                .transpose()?,
            authorization_challenge_endpoint: first_party
                .then(|| self.endpoint(AUTHORIZATION_CHALLENGE_ENDPOINT))
                .transpose()?,
            pre_authorized_grant_anonymous_access_supported: true,
            code_challenge_methods_supported: vec!["S256".into()],
            dpop_signing_alg_values_supported: vec![ES256.into()],
        })
    }
}
