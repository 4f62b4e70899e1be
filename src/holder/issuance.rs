//! The wallet side of OpenID4VCI: resolving a credential offer, getting authorized,
//! and receiving the offered credentials.

use std::collections::BTreeMap;

use async_trait::async_trait;
use http::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::Holder;
use crate::{
    core::util::{send_json, JsonResponse, RequestBody},
    error::{Error, ErrorCode, Result},
    issuer::{
        credential::{CredentialRequest, CredentialResponse, Proof, Proofs, PROOF_JWT_TYP},
        dpop::DPOP_TYP,
        metadata::{
            well_known_url, AuthorizationServerMetadata, CredentialIssuerMetadata,
            AUTHORIZATION_SERVER_WELL_KNOWN, CREDENTIAL_ISSUER_WELL_KNOWN,
        },
        notification::{NotificationEvent, NotificationRequest},
        offer::{CredentialOfferPayload, AUTHORIZATION_CODE_GRANT, PRE_AUTHORIZED_CODE_GRANT},
        par::PushedAuthorizationResponse,
        CredentialConfiguration, PROOF_TYPE_JWT,
    },
    query::CredentialRecord,
    trust::{jwk::ES256, JwtSigner},
    utils::{random_id, sha256_b64url, unix_now},
};

/// A credential offer together with the metadata of the parties involved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCredentialOffer {
    pub offer: CredentialOfferPayload,
    pub issuer_metadata: CredentialIssuerMetadata,
    pub authorization_server: AuthorizationServerMetadata,
    /// The offered configurations, as the issuer describes them.
    pub offered_configurations: BTreeMap<String, CredentialConfiguration>,
}

impl ResolvedCredentialOffer {
    fn scope(&self) -> Option<String> {
        let mut scopes: Vec<&str> = vec![];
        for scope in self.offered_configurations.values().filter_map(|c| c.scope.as_deref()) {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        (!scopes.is_empty()).then(|| scopes.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCodeFlowOptions {
    pub client_id: String,
    pub redirect_uri: String,
    /// Defaults to the scopes of every offered configuration.
    pub scope: Option<Vec<String>>,
}

/// A key the wallet proves possession of towards the authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopKey {
    pub signer: JwtSigner,
}

/// Where the authorization code flow stands after it was started.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuanceAuthorization {
    /// First-party authorization granted a code right away.
    Granted {
        authorization_code: String,
        code_verifier: String,
    },
    /// The issuer wants a presentation first. Answer `presentation_request_url`, then
    /// come back with `auth_session`.
    PresentationDuringIssuance {
        auth_session: String,
        presentation_request_url: String,
        code_verifier: String,
    },
    /// The user authorizes in a browser and is redirected back with a code.
    Redirect {
        authorization_request_url: String,
        code_verifier: String,
        /// Key the pushed authorization request was bound to.
        dpop: Option<DpopKey>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenRequestOptions {
    PreAuthorizedCode {
        tx_code: Option<String>,
    },
    AuthorizationCode {
        code: String,
        code_verifier: String,
        redirect_uri: Option<String>,
        client_id: Option<String>,
        dpop: Option<DpopKey>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuanceAccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<u64>,
    /// Latest `c_nonce` the issuer handed out.
    pub c_nonce: Option<String>,
    /// Set for DPoP bound tokens.
    pub dpop: Option<DpopKey>,
}

/// What a holder key must satisfy to be bound to credentials of a configuration.
#[derive(Debug, Clone)]
pub struct BindingRequirements<'a> {
    pub configuration_id: &'a str,
    pub configuration: &'a CredentialConfiguration,
    /// Number of credentials requested.
    pub batch_size: usize,
    pub signature_algorithms: &'a [String],
    pub supports_jwk: bool,
    pub supports_all_did_methods: bool,
    pub supported_did_methods: Vec<&'a str>,
}

/// Picks the holder keys credentials get bound to, one per requested credential.
#[async_trait]
pub trait CredentialBindingResolver: Send + Sync {
    async fn resolve(&self, requirements: &BindingRequirements<'_>) -> Result<Vec<JwtSigner>>;
}

/// Every credential is bound to the same key.
#[async_trait]
impl CredentialBindingResolver for JwtSigner {
    async fn resolve(&self, requirements: &BindingRequirements<'_>) -> Result<Vec<JwtSigner>> {
        Ok(vec![self.clone(); requirements.batch_size])
    }
}

/// One key per credential.
#[async_trait]
impl CredentialBindingResolver for Vec<JwtSigner> {
    async fn resolve(&self, requirements: &BindingRequirements<'_>) -> Result<Vec<JwtSigner>> {
        if self.len() < requirements.batch_size {
            return Err(Error::invalid_request(format!(
                "{} credentials requested, but only {} keys are available",
                requirements.batch_size,
                self.len()
            )));
        }
        Ok(self[..requirements.batch_size].to_vec())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptCredentialOfferOptions {
    /// Defaults to every offered configuration.
    pub credential_configuration_ids: Option<Vec<String>>,
    /// Credentials requested per configuration. Defaults to one.
    pub batch_size: Option<usize>,
    /// Sent as `iss` of the proofs of possession.
    pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub configuration_id: String,
    pub credentials: Vec<CredentialRecord>,
    pub notification_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredCredential {
    pub configuration_id: String,
    pub transaction_id: String,
    /// Seconds to wait before polling.
    pub interval: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum CredentialOutcome {
    Issued(IssuedCredentials),
    Deferred(DeferredCredential),
}

/// The subset of the token response the wallet relies on.
#[derive(Debug, Deserialize)]
struct TokenBody {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    c_nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeBody {
    authorization_code: String,
}

#[derive(Debug, Serialize)]
struct DeferredCredentialRequest<'a> {
    transaction_id: &'a str,
}

/// The body of a successful response, or the issuer's error.
fn check_response(url: &str, response: JsonResponse) -> Result<Json> {
    if response.status.is_success() {
        return Ok(response.body);
    }
    let description = response
        .body
        .get("error_description")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string();
    match response.error().and_then(ErrorCode::from_name) {
        Some(code) => Err(Error::client(code, description)),
        None => Err(Error::Internal(anyhow::anyhow!(
            "request to '{url}' failed with status {}: {}",
            response.status,
            response.body
        ))),
    }
}

fn parse<T: DeserializeOwned>(url: &str, body: Json) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::Internal(anyhow::anyhow!("unexpected response from '{url}': {e}")))
}

impl DpopKey {
    async fn proof(
        &self,
        holder: &Holder,
        method: &Method,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<String> {
        let mut claims = Map::new();
        claims.insert("htm".into(), method.as_str().into());
        claims.insert("htu".into(), url.into());
        claims.insert("iat".into(), unix_now().into());
        claims.insert("jti".into(), random_id(32).into());
        if let Some(token) = access_token {
            claims.insert("ath".into(), sha256_b64url(token).into());
        }
        let mut header = Map::new();
        header.insert("typ".into(), DPOP_TYP.into());
        holder.trust.sign_jwt(&self.signer, header, claims).await
    }
}

impl Holder {
    /// Parse a credential offer (an `openid-credential-offer://` URL or the offer
    /// JSON) and fetch the issuer and authorization server metadata.
    #[instrument(skip_all)]
    pub async fn resolve_credential_offer(&self, offer: &str) -> Result<ResolvedCredentialOffer> {
        let offer = self.load_credential_offer(offer).await?;

        let url = well_known_url(&offer.credential_issuer, CREDENTIAL_ISSUER_WELL_KNOWN)?;
        let issuer_metadata: CredentialIssuerMetadata = self.get_json(&url).await?;
        if issuer_metadata.credential_issuer != offer.credential_issuer {
            return Err(Error::invalid_request(format!(
                "metadata of '{}' is for credential issuer '{}'",
                offer.credential_issuer, issuer_metadata.credential_issuer
            )));
        }

        let server = issuer_metadata.authorization_server();
        let url = well_known_url(server, AUTHORIZATION_SERVER_WELL_KNOWN)?;
        let authorization_server: AuthorizationServerMetadata = self.get_json(&url).await?;
        if authorization_server.issuer != server {
            return Err(Error::invalid_request(format!(
                "metadata of '{server}' is for authorization server '{}'",
                authorization_server.issuer
            )));
        }

        let mut offered_configurations = BTreeMap::new();
        for id in &offer.credential_configuration_ids {
            let configuration = issuer_metadata
                .credential_configurations_supported
                .get(id)
                .ok_or_else(|| {
                    Error::invalid_request(format!(
                        "offered credential configuration '{id}' is not in the issuer metadata"
                    ))
                })?;
            offered_configurations.insert(id.clone(), configuration.clone());
        }
        info!(
            issuer = offer.credential_issuer,
            configurations = offered_configurations.len(),
            "resolved credential offer"
        );
        Ok(ResolvedCredentialOffer {
            offer,
            issuer_metadata,
            authorization_server,
            offered_configurations,
        })
    }

    /// Start the authorization code flow of an offer.
    ///
    /// The first-party authorization challenge endpoint is tried first. When it is not
    /// announced, or answers `redirect_to_web`, the request is pushed to the PAR endpoint
    /// or encoded into the authorization URL.
    #[instrument(skip_all)]
    pub async fn resolve_issuance_authorization(
        &self,
        resolved: &ResolvedCredentialOffer,
        options: &AuthorizationCodeFlowOptions,
    ) -> Result<IssuanceAuthorization> {
        let issuer_state = resolved
            .offer
            .grants
            .authorization_code
            .as_ref()
            .map(|grant| grant.issuer_state.clone())
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "the offer has no '{AUTHORIZATION_CODE_GRANT}' grant"
                ))
            })?;
        let server = &resolved.authorization_server;
        let code_verifier = random_id(64);
        let scope = match &options.scope {
            Some(scopes) => Some(scopes.join(" ")),
            None => resolved.scope(),
        };
        let code_challenge = sha256_b64url(&code_verifier);
        let mut params: Vec<(&str, &str)> = vec![
            ("response_type", "code"),
            ("client_id", options.client_id.as_str()),
            ("redirect_uri", options.redirect_uri.as_str()),
            ("issuer_state", issuer_state.as_str()),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        if let Some(scope) = &scope {
            params.push(("scope", scope.as_str()));
        }

        if let Some(endpoint) = &server.authorization_challenge_endpoint {
            let response = send_json(
                self.trust.http_client(),
                Method::POST,
                endpoint,
                Some(RequestBody::Form(&params[1..])),
                &[],
            )
            .await?;
            let error = response.error().map(str::to_string);
            match error.as_deref() {
                Some(error) if error == ErrorCode::InsufficientAuthorization.as_str() => {
                    let field = |name: &str| {
                        response
                            .body
                            .get(name)
                            .and_then(Json::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                Error::invalid_request(format!(
                                    "'insufficient_authorization' without '{name}'"
                                ))
                            })
                    };
                    let auth_session = field("auth_session")?;
                    let presentation_request_url = field("presentation")?;
                    info!("issuer requires a presentation before authorization");
                    return Ok(IssuanceAuthorization::PresentationDuringIssuance {
                        auth_session,
                        presentation_request_url,
                        code_verifier,
                    });
                }
                Some(error) if error == ErrorCode::RedirectToWeb.as_str() => {
                    debug!("authorization challenge asked for a browser redirect");
                }
                _ => {
                    let body: ChallengeBody = parse(endpoint, check_response(endpoint, response)?)?;
                    return Ok(IssuanceAuthorization::Granted {
                        authorization_code: body.authorization_code,
                        code_verifier,
                    });
                }
            }
        }

        let authorization_endpoint = server.authorization_endpoint.as_deref().ok_or_else(|| {
            Error::invalid_request(format!(
                "authorization server '{}' has no authorization endpoint",
                server.issuer
            ))
        })?;
        let mut url = Url::parse(authorization_endpoint)
            .map_err(|e| Error::invalid_request(format!("invalid authorization endpoint: {e}")))?;

        let Some(par_endpoint) = &server.pushed_authorization_request_endpoint else {
            url.query_pairs_mut().extend_pairs(params.iter());
            return Ok(IssuanceAuthorization::Redirect {
                authorization_request_url: url.to_string(),
                code_verifier,
                dpop: None,
            });
        };
        let dpop = self.dpop_key(server).await?;
        let mut headers = vec![];
        if let Some(dpop) = &dpop {
            headers.push(("DPoP", dpop.proof(self, &Method::POST, par_endpoint, None).await?));
        }
        let response = send_json(
            self.trust.http_client(),
            Method::POST,
            par_endpoint,
            Some(RequestBody::Form(&params)),
            &headers,
        )
        .await?;
        let pushed: PushedAuthorizationResponse =
            parse(par_endpoint, check_response(par_endpoint, response)?)?;
        url.query_pairs_mut()
            .append_pair("client_id", &options.client_id)
            .append_pair("request_uri", &pushed.request_uri);
        info!(dpop = dpop.is_some(), "pushed authorization request");
        Ok(IssuanceAuthorization::Redirect {
            authorization_request_url: url.to_string(),
            code_verifier,
            dpop,
        })
    }

    /// Exchange the `auth_session` of an answered presentation for an authorization code.
    #[instrument(skip_all)]
    pub async fn retrieve_authorization_code_using_presentation(
        &self,
        resolved: &ResolvedCredentialOffer,
        auth_session: &str,
    ) -> Result<String> {
        let endpoint = resolved
            .authorization_server
            .authorization_challenge_endpoint
            .as_deref()
            .ok_or_else(|| Error::invalid_request("no authorization challenge endpoint"))?;
        let response = send_json(
            self.trust.http_client(),
            Method::POST,
            endpoint,
            Some(RequestBody::Form(&[("auth_session", auth_session)])),
            &[],
        )
        .await?;
        let body: ChallengeBody = parse(endpoint, check_response(endpoint, response)?)?;
        Ok(body.authorization_code)
    }

    /// Redeem a pre-authorized code or an authorization code at the token endpoint.
    ///
    /// A DPoP key is created when the authorization server supports ES256 DPoP proofs
    /// and none was bound earlier.
    #[instrument(skip_all)]
    pub async fn request_access_token(
        &self,
        resolved: &ResolvedCredentialOffer,
        options: TokenRequestOptions,
    ) -> Result<IssuanceAccessToken> {
        let server = &resolved.authorization_server;
        let mut form: Vec<(&str, String)> = vec![];
        let dpop = match options {
            TokenRequestOptions::PreAuthorizedCode { tx_code } => {
                let grant = resolved.offer.grants.pre_authorized_code.as_ref().ok_or_else(|| {
                    Error::invalid_request(format!(
                        "the offer has no '{PRE_AUTHORIZED_CODE_GRANT}' grant"
                    ))
                })?;
                form.push(("grant_type", PRE_AUTHORIZED_CODE_GRANT.into()));
                form.push(("pre-authorized_code", grant.pre_authorized_code.clone()));
                match (&grant.tx_code, tx_code) {
                    (Some(_), None) => {
                        return Err(Error::invalid_request(
                            "the offer requires a transaction code",
                        ))
                    }
                    (_, Some(tx_code)) => form.push(("tx_code", tx_code)),
                    (None, None) => {}
                }
                self.dpop_key(server).await?
            }
            TokenRequestOptions::AuthorizationCode {
                code,
                code_verifier,
                redirect_uri,
                client_id,
                dpop,
            } => {
                form.push(("grant_type", AUTHORIZATION_CODE_GRANT.into()));
                form.push(("code", code));
                form.push(("code_verifier", code_verifier));
                if let Some(redirect_uri) = redirect_uri {
                    form.push(("redirect_uri", redirect_uri));
                }
                if let Some(client_id) = client_id {
                    form.push(("client_id", client_id));
                }
                match dpop {
                    Some(dpop) => Some(dpop),
                    None => self.dpop_key(server).await?,
                }
            }
        };

        let endpoint = &server.token_endpoint;
        let mut headers = vec![];
        if let Some(dpop) = &dpop {
            headers.push(("DPoP", dpop.proof(self, &Method::POST, endpoint, None).await?));
        }
        let form: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let response = send_json(
            self.trust.http_client(),
            Method::POST,
            endpoint,
            Some(RequestBody::Form(&form)),
            &headers,
        )
        .await?;
        let token: TokenBody = parse(endpoint, check_response(endpoint, response)?)?;
        let bound = token.token_type.eq_ignore_ascii_case("DPoP");
        info!(token_type = token.token_type, "received access token");
        Ok(IssuanceAccessToken {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_in: token.expires_in,
            c_nonce: token.c_nonce,
            dpop: if bound { dpop } else { None },
        })
    }

    /// A JWT proof of possession of `signer` for the credential issuer.
    pub async fn create_proof_of_possession(
        &self,
        resolved: &ResolvedCredentialOffer,
        signer: &JwtSigner,
        nonce: &str,
        client_id: Option<&str>,
    ) -> Result<String> {
        let mut header = Map::new();
        header.insert("typ".into(), PROOF_JWT_TYP.into());
        let mut claims = Map::new();
        claims.insert("aud".into(), resolved.offer.credential_issuer.as_str().into());
        claims.insert("nonce".into(), nonce.into());
        claims.insert("iat".into(), unix_now().into());
        if let Some(client_id) = client_id {
            claims.insert("iss".into(), client_id.into());
        }
        self.trust.sign_jwt(signer, header, claims).await
    }

    /// Request credentials for the offered configurations, one request each.
    ///
    /// Received credentials are verified before they are returned. `token` picks up the
    /// fresh `c_nonce` of every response.
    #[instrument(skip_all)]
    pub async fn accept_credential_offer(
        &self,
        resolved: &ResolvedCredentialOffer,
        token: &mut IssuanceAccessToken,
        binding: &dyn CredentialBindingResolver,
        options: &AcceptCredentialOfferOptions,
    ) -> Result<Vec<CredentialOutcome>> {
        let ids: Vec<String> = match &options.credential_configuration_ids {
            Some(ids) => ids.clone(),
            None => resolved.offer.credential_configuration_ids.clone(),
        };
        let batch_size = options.batch_size.unwrap_or(1).max(1);
        if batch_size > 1 {
            let supported = resolved
                .issuer_metadata
                .batch_credential_issuance
                .map(|batch| batch.batch_size)
                .unwrap_or(1);
            if batch_size > supported {
                return Err(Error::invalid_request(format!(
                    "{batch_size} credentials requested, the issuer issues at most {supported} at once"
                )));
            }
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in &ids {
            let configuration = resolved.offered_configurations.get(id).ok_or_else(|| {
                Error::invalid_request(format!("credential configuration '{id}' was not offered"))
            })?;
            let mut request = CredentialRequest::new(id.clone());
            if !configuration.proof_types_supported.is_empty() {
                let jwts = self
                    .proofs_for(resolved, token, binding, id, configuration, batch_size, options)
                    .await?;
                if jwts.len() == 1 {
                    request.proof = jwts.into_iter().next().map(|jwt| Proof::Jwt { jwt });
                } else {
                    request.proofs = Some(Proofs {
                        jwt: jwts,
                        attestation: vec![],
                    });
                }
            }
            let endpoint = &resolved.issuer_metadata.credential_endpoint;
            let body = serde_json::to_value(&request).map_err(anyhow::Error::from)?;
            let response: CredentialResponse =
                self.authorized_post(token, endpoint, &body).await?;
            outcomes.push(self.credential_outcome(resolved, token, id, response).await?);
        }
        Ok(outcomes)
    }

    /// Poll the deferred credential endpoint for a deferred credential.
    #[instrument(skip_all, fields(configuration = deferred.configuration_id))]
    pub async fn request_deferred_credentials(
        &self,
        resolved: &ResolvedCredentialOffer,
        token: &mut IssuanceAccessToken,
        deferred: &DeferredCredential,
    ) -> Result<CredentialOutcome> {
        let endpoint = resolved
            .issuer_metadata
            .deferred_credential_endpoint
            .as_deref()
            .ok_or_else(|| Error::invalid_request("the issuer has no deferred credential endpoint"))?;
        let body = serde_json::to_value(DeferredCredentialRequest {
            transaction_id: &deferred.transaction_id,
        })
        .map_err(anyhow::Error::from)?;
        let response: CredentialResponse = self.authorized_post(token, endpoint, &body).await?;
        self.credential_outcome(resolved, token, &deferred.configuration_id, response)
            .await
    }

    /// Tell the issuer what became of the credentials of `notification_id`.
    #[instrument(skip_all, fields(event = ?event))]
    pub async fn send_notification(
        &self,
        resolved: &ResolvedCredentialOffer,
        token: &IssuanceAccessToken,
        notification_id: &str,
        event: NotificationEvent,
        event_description: Option<String>,
    ) -> Result<()> {
        let endpoint = resolved
            .issuer_metadata
            .notification_endpoint
            .as_deref()
            .ok_or_else(|| Error::invalid_request("the issuer has no notification endpoint"))?;
        let body = serde_json::to_value(NotificationRequest {
            notification_id: notification_id.to_string(),
            event,
            event_description,
        })
        .map_err(anyhow::Error::from)?;
        let _: Json = self.authorized_post(token, endpoint, &body).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn proofs_for(
        &self,
        resolved: &ResolvedCredentialOffer,
        token: &IssuanceAccessToken,
        binding: &dyn CredentialBindingResolver,
        id: &str,
        configuration: &CredentialConfiguration,
        batch_size: usize,
        options: &AcceptCredentialOfferOptions,
    ) -> Result<Vec<String>> {
        let Some(jwt) = configuration.proof_types_supported.get(PROOF_TYPE_JWT) else {
            return Err(Error::invalid_request(format!(
                "credential configuration '{id}' supports none of the proof types this wallet creates ({PROOF_TYPE_JWT})"
            )));
        };
        let algorithms = &jwt.proof_signing_alg_values_supported;
        if !algorithms.is_empty() && !algorithms.iter().any(|alg| alg == ES256) {
            return Err(Error::invalid_request(format!(
                "credential configuration '{id}' accepts no {ES256} proofs"
            )));
        }
        let methods = &configuration.cryptographic_binding_methods_supported;
        let requirements = BindingRequirements {
            configuration_id: id,
            configuration,
            batch_size,
            signature_algorithms: algorithms,
            supports_jwk: methods.is_empty() || methods.iter().any(|m| m == "jwk"),
            supports_all_did_methods: methods.is_empty() || methods.iter().any(|m| m == "did"),
            supported_did_methods: methods
                .iter()
                .filter(|m| m.starts_with("did:"))
                .map(String::as_str)
                .collect(),
        };
        let signers = binding.resolve(&requirements).await?;
        if signers.is_empty() || signers.len() > batch_size {
            return Err(Error::invalid_request(format!(
                "expected between 1 and {batch_size} binding keys, got {}",
                signers.len()
            )));
        }
        for signer in &signers {
            check_binding(signer, &requirements)?;
        }
        let nonce = token.c_nonce.as_deref().ok_or_else(|| {
            Error::invalid_request("no 'c_nonce' was received to create a proof of possession with")
        })?;
        let mut jwts = Vec::with_capacity(signers.len());
        for signer in &signers {
            jwts.push(
                self.create_proof_of_possession(resolved, signer, nonce, options.client_id.as_deref())
                    .await?,
            );
        }
        Ok(jwts)
    }

    async fn credential_outcome(
        &self,
        resolved: &ResolvedCredentialOffer,
        token: &mut IssuanceAccessToken,
        configuration_id: &str,
        response: CredentialResponse,
    ) -> Result<CredentialOutcome> {
        if let Some(c_nonce) = response.c_nonce {
            token.c_nonce = Some(c_nonce);
        }
        if let Some(transaction_id) = response.transaction_id {
            info!(configuration = configuration_id, "credential issuance was deferred");
            return Ok(CredentialOutcome::Deferred(DeferredCredential {
                configuration_id: configuration_id.to_string(),
                transaction_id,
                interval: response.interval,
            }));
        }
        if response.credentials.is_empty() {
            return Err(Error::invalid_request(
                "credential response has neither credentials nor a 'transaction_id'",
            ));
        }
        let format = &resolved
            .offered_configurations
            .get(configuration_id)
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "credential configuration '{configuration_id}' was not offered"
                ))
            })?
            .format;
        let codec = self.codecs.get(format)?;
        let mut credentials = Vec::with_capacity(response.credentials.len());
        for issued in response.credentials {
            codec
                .verify_presentation(&self.trust, &self.policy, &issued.credential)
                .await
                .map_err(|e| {
                    warn!(configuration = configuration_id, "received an invalid credential");
                    e
                })?;
            let id = uuid::Uuid::new_v4().to_string();
            credentials.push(CredentialRecord::decode(id, format, issued.credential, &self.codecs)?);
        }
        info!(
            configuration = configuration_id,
            count = credentials.len(),
            "received credentials"
        );
        Ok(CredentialOutcome::Issued(IssuedCredentials {
            configuration_id: configuration_id.to_string(),
            credentials,
            notification_id: response.notification_id,
        }))
    }

    /// POST `body` as JSON with the access token, and a DPoP proof for bound tokens.
    async fn authorized_post<T: DeserializeOwned>(
        &self,
        token: &IssuanceAccessToken,
        url: &str,
        body: &Json,
    ) -> Result<T> {
        let mut headers = vec![];
        match &token.dpop {
            Some(dpop) => {
                headers.push(("authorization", format!("DPoP {}", token.access_token)));
                headers.push((
                    "DPoP",
                    dpop.proof(self, &Method::POST, url, Some(&token.access_token))
                        .await?,
                ));
            }
            None => headers.push(("authorization", format!("Bearer {}", token.access_token))),
        }
        let response = send_json(
            self.trust.http_client(),
            Method::POST,
            url,
            Some(RequestBody::Json(body)),
            &headers,
        )
        .await?;
        parse(url, check_response(url, response)?)
    }

    /// A fresh DPoP key if the authorization server accepts ES256 DPoP proofs.
    async fn dpop_key(&self, server: &AuthorizationServerMetadata) -> Result<Option<DpopKey>> {
        if !server.dpop_signing_alg_values_supported.iter().any(|alg| alg == ES256) {
            return Ok(None);
        }
        let kms = self.trust.kms();
        let key_id = kms.create_key().await?;
        let jwk = kms.public_key(&key_id).await?;
        Ok(Some(DpopKey {
            signer: JwtSigner::Jwk { jwk },
        }))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = send_json(self.trust.http_client(), Method::GET, url, None, &[]).await?;
        parse(url, check_response(url, response)?)
    }

    async fn load_credential_offer(&self, offer: &str) -> Result<CredentialOfferPayload> {
        let offer = offer.trim();
        if offer.starts_with('{') {
            return serde_json::from_str(offer)
                .map_err(|e| Error::invalid_request(format!("invalid credential offer: {e}")));
        }
        let url = Url::parse(offer)
            .map_err(|e| Error::invalid_request(format!("invalid credential offer url: {e}")))?;
        let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        if let Some(json) = pairs.get("credential_offer") {
            return serde_json::from_str(json)
                .map_err(|e| Error::invalid_request(format!("invalid 'credential_offer': {e}")));
        }
        if let Some(uri) = pairs.get("credential_offer_uri") {
            return self.get_json(uri).await;
        }
        Err(Error::invalid_request(
            "credential offer url has neither 'credential_offer' nor 'credential_offer_uri'",
        ))
    }
}

/// The signer must use a binding method the configuration supports.
fn check_binding(signer: &JwtSigner, requirements: &BindingRequirements<'_>) -> Result<()> {
    let supported = match signer {
        JwtSigner::Jwk { .. } => requirements.supports_jwk,
        JwtSigner::Did { did_url } => {
            requirements.supports_all_did_methods
                || requirements
                    .supported_did_methods
                    .iter()
                    .any(|method| did_url.starts_with(&format!("{method}:")))
        }
        _ => false,
    };
    if !supported {
        return Err(Error::invalid_request(format!(
            "binding method '{}' is not supported for credential configuration '{}'",
            signer.method(),
            requirements.configuration_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::credential_format::ClaimFormatDesignation, issuer::ProofTypeMetadata};
    use http::StatusCode;
    use serde_json::json;

    fn configuration(methods: &[&str]) -> CredentialConfiguration {
        CredentialConfiguration {
            format: ClaimFormatDesignation::DcSdJwt,
            scope: None,
            cryptographic_binding_methods_supported: methods.iter().map(|m| m.to_string()).collect(),
            proof_types_supported: BTreeMap::from([(
                PROOF_TYPE_JWT.to_string(),
                ProofTypeMetadata::default(),
            )]),
        }
    }

    fn requirements<'a>(configuration: &'a CredentialConfiguration) -> BindingRequirements<'a> {
        let methods = &configuration.cryptographic_binding_methods_supported;
        BindingRequirements {
            configuration_id: "Pid",
            configuration,
            batch_size: 1,
            signature_algorithms: &[],
            supports_jwk: methods.iter().any(|m| m == "jwk"),
            supports_all_did_methods: methods.iter().any(|m| m == "did"),
            supported_did_methods: methods
                .iter()
                .filter(|m| m.starts_with("did:"))
                .map(String::as_str)
                .collect(),
        }
    }

    #[test]
    fn binding_methods() {
        let did_key = JwtSigner::Did {
            did_url: "did:key:zDnaexample#zDnaexample".into(),
        };
        let did_web = JwtSigner::Did {
            did_url: "did:web:wallet.example.com#key-1".into(),
        };

        let only_did_key = configuration(&["did:key"]);
        let only_did_key = requirements(&only_did_key);
        check_binding(&did_key, &only_did_key).unwrap();
        assert!(check_binding(&did_web, &only_did_key).is_err());

        let any_did = configuration(&["did"]);
        check_binding(&did_web, &requirements(&any_did)).unwrap();
        assert!(check_binding(&JwtSigner::None, &requirements(&any_did)).is_err());
    }

    #[test]
    fn issuer_errors_keep_their_code() {
        let err = check_response(
            "https://issuer.example.com/token",
            JsonResponse {
                status: StatusCode::BAD_REQUEST,
                body: json!({"error": "invalid_grant", "error_description": "expired"}),
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidGrant));

        let err = check_response(
            "https://issuer.example.com/token",
            JsonResponse {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: Json::String("try later".into()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
