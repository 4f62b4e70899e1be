//! Chained authorization: the user authenticates at an external OAuth 2.0 / OpenID
//! Connect server and the issuer releases its own authorization code afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{info, instrument, warn};
use url::Url;

use super::{
    session::{ChainedAuthorizationState, ChainedIdentity, IssuanceSession, IssuanceState, PkceChallenge},
    IssuanceEvent, Issuer,
};
use crate::{
    core::util::post_form,
    error::{Error, ErrorCode, Result},
    session::{find_one, Versioned},
    trust::jwt::DecodedJwt,
    utils::{random_id, sha256_b64url},
};

/// An external authorization server the issuer delegates user authentication to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedAuthorizationServer {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Where the external server sends the user back to, with `code` and `state`.
    pub redirect_uri: String,
    /// Scopes requested from the external server per issuer scope. Unmapped issuer
    /// scopes are requested as they are.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes_mapping: BTreeMap<String, Vec<String>>,
}

impl ChainedAuthorizationServer {
    fn external_scopes(&self, scope: &str) -> Vec<String> {
        self.scopes_mapping
            .get(scope)
            .cloned()
            .unwrap_or_else(|| vec![scope.to_string()])
    }

    /// `scope` parameter sent to the external server for the issuer `scopes`.
    fn requested_scope(&self, scopes: &[String]) -> String {
        let mut requested: Vec<String> = vec![];
        for scope in scopes.iter().flat_map(|s| self.external_scopes(s)) {
            if !requested.contains(&scope) {
                requested.push(scope);
            }
        }
        requested.join(" ")
    }

    /// Issuer scopes whose external scopes were all granted.
    fn granted_scopes(&self, requested: &[String], granted: &[&str]) -> Vec<String> {
        requested
            .iter()
            .filter(|scope| {
                self.external_scopes(scope)
                    .iter()
                    .all(|external| granted.contains(&external.as_str()))
            })
            .cloned()
            .collect()
    }

    fn authorization_url(&self, scopes: &[String], state: &str, code_verifier: &str) -> Result<String> {
        let mut url = Url::parse(&self.authorization_endpoint).map_err(|e| {
            Error::server(format!("invalid chained authorization endpoint: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.requested_scope(scopes))
            .append_pair("state", state)
            .append_pair("code_challenge", &sha256_b64url(code_verifier))
            .append_pair("code_challenge_method", "S256");
        Ok(url.to_string())
    }
}

impl Issuer {
    /// Record the chained authorization and return the external authorization URL.
    pub(super) async fn start_chained_authorization(
        &self,
        chained: &ChainedAuthorizationServer,
        mut versioned: Versioned<IssuanceSession>,
        wallet: PkceChallenge,
        scopes: Vec<String>,
    ) -> Result<String> {
        let state = random_id(32);
        let code_verifier = random_id(64);
        let authorization_url = chained.authorization_url(&scopes, &state, &code_verifier)?;
        versioned.session.authorization.chained = Some(ChainedAuthorizationState {
            state,
            code_verifier,
            requested_scopes: scopes,
            wallet,
        });
        versioned.session.apply(IssuanceEvent::AuthorizationStarted)?;
        let versioned = self.save(versioned).await?;
        info!(
            session = versioned.session.id,
            server = chained.issuer,
            "delegated authorization to chained server"
        );
        Ok(authorization_url)
    }

    /// Handle the redirect back from the chained server: exchange its code, keep the
    /// identity it returned and release an authorization code for the wallet.
    ///
    /// The `id_token` is taken from the token endpoint response over TLS and is not
    /// verified again.
    #[instrument(skip_all)]
    pub async fn complete_chained_authorization(&self, state: &str, code: &str) -> Result<String> {
        let chained = self
            .record
            .authorization
            .chained
            .as_ref()
            .ok_or_else(|| Error::server("no chained authorization server is configured"))?;
        let (_, versioned) = find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
            s.authorization
                .chained
                .as_ref()
                .is_some_and(|c| c.state == state)
        })
        .await?
        .ok_or_else(|| Error::invalid_request("unknown 'state'"))?;
        let versioned = self.ensure_active(versioned).await?;
        if versioned.session.state != IssuanceState::AuthorizationInitiated {
            return Err(Error::invalid_request("chained authorization was already completed"));
        }
        let Some(pending) = versioned.session.authorization.chained.clone() else {
            return Err(Error::invalid_request("unknown 'state'"));
        };

        let outcome = self.exchange_chained_code(chained, &pending, code).await;
        let identity = match outcome {
            Ok(identity) => identity,
            Err(e) => return Err(self.fail(versioned, e).await),
        };
        let mut versioned = versioned;
        versioned.session.authorization.scope = Some(identity.granted_scopes.join(" "));
        versioned.session.chained_identity = Some(identity);
        self.grant_authorization_code(versioned, pending.wallet).await
    }

    async fn exchange_chained_code(
        &self,
        chained: &ChainedAuthorizationServer,
        pending: &ChainedAuthorizationState,
        code: &str,
    ) -> Result<ChainedIdentity> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", chained.redirect_uri.as_str()),
            ("client_id", chained.client_id.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        if let Some(secret) = &chained.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        let token_response: Map<String, Json> =
            post_form(self.trust.http_client(), &chained.token_endpoint, &form).await?;

        let id_token_claims = match token_response.get("id_token").and_then(Json::as_str) {
            Some(id_token) => match DecodedJwt::decode(id_token) {
                Ok(decoded) => Some(decoded.payload),
                Err(e) => {
                    warn!("chained server returned an unreadable id_token: {e:#}");
                    None
                }
            },
            None => None,
        };
        let granted_external: Vec<&str> = match token_response.get("scope").and_then(Json::as_str) {
            Some(scope) => scope.split_whitespace().collect(),
            None => vec![],
        };
        let granted_scopes = if token_response.contains_key("scope") {
            chained.granted_scopes(&pending.requested_scopes, &granted_external)
        } else {
            // Servers omit `scope` when it equals the requested one.
            pending.requested_scopes.clone()
        };
        if granted_scopes.is_empty() && !pending.requested_scopes.is_empty() {
            return Err(Error::client(
                ErrorCode::InsufficientAuthorization,
                "the chained authorization server granted none of the requested scopes",
            ));
        }
        Ok(ChainedIdentity {
            token_response: token_response.clone(),
            id_token_claims,
            granted_scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ChainedAuthorizationServer {
        ChainedAuthorizationServer {
            issuer: "https://idp.example.com".into(),
            authorization_endpoint: "https://idp.example.com/authorize".into(),
            token_endpoint: "https://idp.example.com/token".into(),
            client_id: "issuer".into(),
            client_secret: None,
            redirect_uri: "https://issuer.example.com/chained/redirect".into(),
            scopes_mapping: BTreeMap::from([(
                "UniversityDegree".to_string(),
                vec!["openid".to_string(), "profile".to_string()],
            )]),
        }
    }

    #[test]
    fn scopes_are_mapped_both_ways() {
        let server = server();
        let scopes = vec!["UniversityDegree".to_string(), "Pid".to_string()];
        assert_eq!(server.requested_scope(&scopes), "openid profile Pid");
        assert_eq!(
            server.granted_scopes(&scopes, &["openid", "profile"]),
            vec!["UniversityDegree".to_string()]
        );
        assert!(server.granted_scopes(&scopes, &["openid"]).is_empty());
    }

    #[test]
    fn authorization_url_uses_pkce() {
        let url = server()
            .authorization_url(&["UniversityDegree".to_string()], "st", "verifier")
            .unwrap();
        let url = Url::parse(&url).unwrap();
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["state"], "st");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["code_challenge"], sha256_b64url("verifier"));
        assert_eq!(pairs["scope"], "openid profile");
    }
}
