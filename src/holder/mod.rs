//! The wallet: receiving credentials over OpenID4VCI ([issuance]) and presenting them
//! over OpenID4VP, which means resolving an authorization request, checking who sent it,
//! and answering it with presentations of the holder's credentials.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use serde_json_path::JsonPath;
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    codec::{CodecRegistry, KeyBindingChallenge},
    config::ProtocolVersion,
    core::{
        credential_format::ClaimFormatDesignation,
        presentation_submission::{DescriptorMap, PresentationSubmission},
        transaction_data::{hash_encoded, TransactionData, DEFAULT_HASH_ALG},
        util::{fetch_text, post_form},
    },
    error::{Error, Result},
    query::{match_query, CredentialQuery, CredentialRecord, CredentialSelection, QueryMatch},
    trust::{
        jwe::JweOptions, jwt::DecodedJwt, x509, JwtSigner, JwtVerification, TrustCallbacks,
        TrustPolicy, VerificationPurpose,
    },
    verifier::{response::key_binding_audience, AuthorizationRequestObject, AuthorizationResponse},
};

pub mod issuance;

/// How an authorization request reached the wallet.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestInput {
    /// An `openid4vp://` URL, by value or with a `request_uri`.
    Url(String),
    /// The request object handed over by the Digital Credentials API.
    DcApi(Json),
}

/// How the verifier identifies itself, derived from its client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientIdScheme {
    RedirectUri,
    X509SanDns,
    Did,
    Federation,
    /// Unsigned DC API requests carry no client id.
    Origin,
}

/// A request whose sender checked out, matched against the holder's credentials.
#[derive(Debug, Clone)]
pub struct ResolvedAuthorizationRequest {
    pub request: AuthorizationRequestObject,
    pub version: ProtocolVersion,
    /// The client id without its scheme prefix.
    pub client_id: Option<String>,
    /// Who signed the request, [JwtSigner::None] for unsigned requests.
    pub verifier: JwtSigner,
    pub query: CredentialQuery,
    pub query_match: QueryMatch,
    pub transaction_data: Vec<TransactionData>,
    pub origin: Option<String>,
}

/// The response to send, and where to send it.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedAuthorizationRequest {
    /// `None` for the Digital Credentials API, the response goes back to the caller.
    pub response_uri: Option<String>,
    pub response: AuthorizationResponse,
}

/// An OpenID4VP holder (wallet).
#[derive(Debug, Clone)]
pub struct Holder {
    trust: TrustCallbacks,
    policy: TrustPolicy,
    codecs: CodecRegistry,
}

impl Holder {
    pub fn new(trust: TrustCallbacks, codecs: CodecRegistry) -> Self {
        Self {
            trust,
            policy: TrustPolicy::new(),
            codecs,
        }
    }

    /// Trusted verifier certificates and federation anchors.
    pub fn with_trust_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parse and authenticate an authorization request and match its query against
    /// `credentials`. `origin` is the calling web origin for the Digital Credentials API.
    #[instrument(skip_all)]
    pub async fn resolve_authorization_request(
        &self,
        input: RequestInput,
        credentials: &[CredentialRecord],
        origin: Option<&str>,
    ) -> Result<ResolvedAuthorizationRequest> {
        let dc_api = matches!(input, RequestInput::DcApi(_));
        let (outer_client_id, jwt, params) = self.load_request(input).await?;

        let (request, verifier) = match jwt {
            Some(jwt) => {
                let decoded = DecodedJwt::decode(&jwt)
                    .map_err(|e| Error::invalid_request(format!("malformed request object: {e:#}")))?;
                let peeked = AuthorizationRequestObject::from_map(decoded.payload)?;
                let version = detect_version(&peeked);
                let (scheme, id) = client_id_scheme(version, &peeked)?;
                let verified = self
                    .trust
                    .verify_jwt(&jwt, &verification_for(scheme, id.as_deref()), &self.policy)
                    .await?;
                let request = AuthorizationRequestObject::from_map(verified.payload)?;
                (request, verified.signer)
            }
            None => {
                let params =
                    params.ok_or_else(|| Error::invalid_request("empty authorization request"))?;
                (AuthorizationRequestObject::from_map(params)?, JwtSigner::None)
            }
        };
        if let Some(outer) = outer_client_id {
            if request.client_id.as_deref() != Some(outer.as_str()) {
                return Err(Error::invalid_request(
                    "'client_id' differs from the one in the request object",
                ));
            }
        }
        if request.response_type != "vp_token" {
            return Err(Error::invalid_request(format!(
                "unsupported response_type '{}'",
                request.response_type
            )));
        }

        let version = detect_version(&request);
        let (scheme, client_id) = client_id_scheme(version, &request)?;
        check_client(scheme, client_id.as_deref(), &request, &verifier)?;

        if request.response_mode.is_dc_api() != dc_api {
            return Err(Error::invalid_request(format!(
                "response mode {:?} does not fit how the request was received",
                request.response_mode
            )));
        }
        if dc_api {
            let origin = origin
                .ok_or_else(|| Error::invalid_request("the calling origin is required"))?;
            if let Some(expected) = &request.expected_origins {
                if !expected.iter().any(|o| o == origin) {
                    return Err(Error::trust(format!("origin '{origin}' is not expected")));
                }
            }
        } else if request.response_uri.is_none() {
            return Err(Error::invalid_request("'response_uri' is required"));
        }

        let query = request.query()?;
        match &query {
            CredentialQuery::DcqlQuery(_) if !version.supports_dcql() => {
                return Err(Error::protocol(version, "DCQL is not supported"))
            }
            CredentialQuery::PresentationDefinition(_)
                if !version.supports_presentation_exchange() =>
            {
                return Err(Error::protocol(version, "presentation definitions are not supported"))
            }
            _ => {}
        }
        let query_ids = query.ids();
        let transaction_data = request
            .transaction_data()
            .iter()
            .map(|encoded| {
                let entry = TransactionData::decode(encoded)
                    .map_err(|e| Error::invalid_request(format!("{e:#}")))?;
                if let Some(unknown) = entry
                    .credential_ids()
                    .iter()
                    .find(|id| !query_ids.contains(&id.as_str()))
                {
                    return Err(Error::invalid_request(format!(
                        "transaction data references unknown credential query '{unknown}'"
                    )));
                }
                Ok(entry)
            })
            .collect::<Result<Vec<_>>>()?;
        let query_match = match_query(&query, credentials)?;
        info!(
            %version,
            signer = verifier.method(),
            can_be_satisfied = query_match.can_be_satisfied,
            "resolved authorization request"
        );

        Ok(ResolvedAuthorizationRequest {
            version,
            client_id,
            verifier,
            query,
            query_match,
            transaction_data,
            origin: origin.map(str::to_string),
            request,
        })
    }

    /// Create presentations of the selected credentials and the response carrying them.
    ///
    /// `holder_keys` maps credential ids to the key their key binding is signed with.
    #[instrument(skip_all)]
    pub async fn accept_authorization_request(
        &self,
        resolved: &ResolvedAuthorizationRequest,
        selections: &[CredentialSelection],
        credentials: &[CredentialRecord],
        holder_keys: &BTreeMap<String, JwtSigner>,
    ) -> Result<AcceptedAuthorizationRequest> {
        let request = &resolved.request;
        let audience =
            key_binding_audience(resolved.version, request, resolved.origin.as_deref())?;

        let mut presentations: Vec<(String, ClaimFormatDesignation, String)> = vec![];
        for selection in selections {
            let challenge = KeyBindingChallenge {
                nonce: request.nonce.clone(),
                audience: audience.clone(),
                ..transaction_data_challenge(request, &selection.query_id)?
            };
            for selected in &selection.credentials {
                let record = credentials
                    .iter()
                    .find(|c| c.id == selected.credential_id)
                    .ok_or_else(|| {
                        Error::invalid_request(format!(
                            "unknown credential '{}'",
                            selected.credential_id
                        ))
                    })?;
                let holder = holder_keys
                    .get(&record.id)
                    .cloned()
                    .unwrap_or(JwtSigner::None);
                let format = &record.credential.format;
                let presentation = self
                    .codecs
                    .get(format)?
                    .present(&self.trust, &record.compact, &selected.paths, &challenge, &holder)
                    .await?;
                debug!(query = selection.query_id, credential = record.id, "created presentation");
                presentations.push((selection.query_id.clone(), format.clone(), presentation));
            }
        }

        let mut response = match &resolved.query {
            CredentialQuery::DcqlQuery(_) => AuthorizationResponse {
                vp_token: Some(dcql_vp_token(resolved.version, presentations)?),
                ..Default::default()
            },
            CredentialQuery::PresentationDefinition(definition) => {
                let (vp_token, submission) = pex_vp_token(definition.id(), presentations)?;
                AuthorizationResponse {
                    vp_token: Some(vp_token),
                    presentation_submission: Some(submission),
                    ..Default::default()
                }
            }
        };
        response.state = request.state.clone();

        if request.response_mode.is_encrypted() {
            let metadata = request.client_metadata.as_ref().ok_or_else(|| {
                Error::invalid_request("encrypted response mode without 'client_metadata'")
            })?;
            let plaintext = serde_json::to_vec(&response).map_err(anyhow::Error::from)?;
            let jwe = self.trust.encrypt_jwe(
                metadata.encryption_keys(),
                &metadata.supported_enc(),
                &plaintext,
                &JweOptions {
                    apv: Some(request.nonce.as_bytes().to_vec()),
                    ..Default::default()
                },
            )?;
            response = AuthorizationResponse::encrypted(jwe);
        }

        Ok(AcceptedAuthorizationRequest {
            response_uri: request.response_uri.clone(),
            response,
        })
    }

    /// POST the response to the verifier's `response_uri` and return its JSON answer.
    pub async fn submit_authorization_response(
        &self,
        accepted: &AcceptedAuthorizationRequest,
    ) -> Result<Map<String, Json>> {
        let response_uri = accepted.response_uri.as_deref().ok_or_else(|| {
            Error::invalid_request("Digital Credentials API responses are returned to the caller")
        })?;
        let form = accepted.response.to_form()?;
        let form: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        Ok(post_form(self.trust.http_client(), response_uri, &form).await?)
    }

    /// Split the input into the outer `client_id`, a request object, or plain parameters.
    async fn load_request(
        &self,
        input: RequestInput,
    ) -> Result<(Option<String>, Option<String>, Option<Map<String, Json>>)> {
        match input {
            RequestInput::Url(url) => {
                let url = Url::parse(&url)
                    .map_err(|e| Error::invalid_request(format!("invalid request url: {e}")))?;
                let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
                let outer_client_id = pairs.get("client_id").cloned();
                if let Some(request_uri) = pairs.get("request_uri") {
                    let jwt = fetch_text(self.trust.http_client(), request_uri).await?;
                    return Ok((outer_client_id, Some(jwt.trim().to_string()), None));
                }
                if let Some(jwt) = pairs.get("request") {
                    return Ok((outer_client_id, Some(jwt.clone()), None));
                }
                let request = AuthorizationRequestObject::from_query_pairs(
                    pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                )?;
                Ok((None, None, Some(request.to_map()?)))
            }
            RequestInput::DcApi(json) => {
                let json = match json {
                    Json::Object(mut map) if map.contains_key("data") => {
                        map.remove("data").unwrap_or_default()
                    }
                    other => other,
                };
                match json {
                    Json::Object(map) => match map.get("request").and_then(Json::as_str) {
                        Some(jwt) => Ok((None, Some(jwt.to_string()), None)),
                        None => Ok((None, None, Some(map))),
                    },
                    _ => Err(Error::invalid_request("DC API request must be an object")),
                }
            }
        }
    }
}

/// Requests carry no version, it is told apart by the parameters only one version uses.
fn detect_version(request: &AuthorizationRequestObject) -> ProtocolVersion {
    if request.client_id_scheme.is_some() {
        return ProtocolVersion::Draft21;
    }
    let v1_metadata = request.client_metadata.as_ref().is_some_and(|m| {
        m.vp_formats_supported.is_some() || m.encrypted_response_enc_values_supported.is_some()
    });
    let v1_prefix = request.client_id.as_deref().is_some_and(|id| {
        id.starts_with("decentralized_identifier:") || id.starts_with("openid_federation:")
    });
    if v1_metadata || v1_prefix {
        ProtocolVersion::V1
    } else {
        ProtocolVersion::Draft24
    }
}

fn client_id_scheme(
    version: ProtocolVersion,
    request: &AuthorizationRequestObject,
) -> Result<(ClientIdScheme, Option<String>)> {
    let Some(client_id) = &request.client_id else {
        return Ok((ClientIdScheme::Origin, None));
    };
    let (scheme, id) = if version == ProtocolVersion::Draft21 {
        (
            request.client_id_scheme.as_deref().unwrap_or_default(),
            client_id.as_str(),
        )
    } else if client_id.starts_with("did:") {
        ("did", client_id.as_str())
    } else if client_id.starts_with("https://") || client_id.starts_with("http://") {
        ("entity_id", client_id.as_str())
    } else {
        client_id
            .split_once(':')
            .ok_or_else(|| Error::invalid_request(format!("client id '{client_id}' has no scheme")))?
    };
    let scheme = match scheme {
        "redirect_uri" => ClientIdScheme::RedirectUri,
        "x509_san_dns" => ClientIdScheme::X509SanDns,
        "did" | "decentralized_identifier" => ClientIdScheme::Did,
        "entity_id" | "openid_federation" => ClientIdScheme::Federation,
        other => {
            return Err(Error::invalid_request(format!(
                "unsupported client id scheme '{other}'"
            )))
        }
    };
    Ok((scheme, Some(id.to_string())))
}

fn verification_for(scheme: ClientIdScheme, id: Option<&str>) -> JwtVerification {
    match scheme {
        ClientIdScheme::RedirectUri | ClientIdScheme::Origin => JwtVerification {
            allow_unsigned: true,
            ..Default::default()
        },
        ClientIdScheme::X509SanDns | ClientIdScheme::Did => {
            JwtVerification::for_purpose(VerificationPurpose::AuthorizationRequest)
        }
        ClientIdScheme::Federation => JwtVerification {
            federation_entity_id: id.map(str::to_string),
            ..JwtVerification::for_purpose(VerificationPurpose::AuthorizationRequest)
        },
    }
}

/// The signer of the request must be the party its client id names.
fn check_client(
    scheme: ClientIdScheme,
    id: Option<&str>,
    request: &AuthorizationRequestObject,
    signer: &JwtSigner,
) -> Result<()> {
    match (scheme, signer) {
        (ClientIdScheme::RedirectUri, JwtSigner::None) => {
            if id != request.response_uri.as_deref() {
                return Err(Error::trust("redirect_uri client id must equal the 'response_uri'"));
            }
            Ok(())
        }
        (ClientIdScheme::Origin, JwtSigner::None) => Ok(()),
        (ClientIdScheme::RedirectUri | ClientIdScheme::Origin, _) => Err(Error::trust(
            "requests of this client id scheme must not be signed",
        )),
        (_, JwtSigner::None) => Err(Error::trust(format!(
            "request of client '{}' must be signed",
            id.unwrap_or_default()
        ))),
        (ClientIdScheme::Did, JwtSigner::Did { did_url }) => {
            let did = did_url.split('#').next().unwrap_or(did_url);
            if Some(did) != id {
                return Err(Error::trust(format!("request is signed by '{did}', not the client")));
            }
            Ok(())
        }
        (ClientIdScheme::X509SanDns, JwtSigner::X5c { x5c, .. }) => {
            let leaf = x5c
                .first()
                .ok_or_else(|| Error::trust("request signed without certificate"))?;
            let names = x509::dns_names(
                &x509::decode_certificate(leaf).map_err(|e| Error::trust(format!("{e:#}")))?,
            );
            if !id.is_some_and(|id| names.iter().any(|n| n == id)) {
                return Err(Error::trust(
                    "client id is not a DNS name of the request signing certificate",
                ));
            }
            Ok(())
        }
        (ClientIdScheme::Federation, JwtSigner::Federation { entity_id, .. }) => {
            if Some(entity_id.as_str()) != id {
                return Err(Error::trust("request is signed by another federation entity"));
            }
            Ok(())
        }
        (_, signer) => Err(Error::trust(format!(
            "request signer ({}) does not fit the client id scheme",
            signer.method()
        ))),
    }
}

/// Transaction data hashes the key binding for `query_id` must carry.
fn transaction_data_challenge(
    request: &AuthorizationRequestObject,
    query_id: &str,
) -> Result<KeyBindingChallenge> {
    let mut hashes = vec![];
    for encoded in request.transaction_data() {
        let entry =
            TransactionData::decode(encoded).map_err(|e| Error::invalid_request(format!("{e:#}")))?;
        if !entry.binds(query_id) {
            continue;
        }
        let algs = entry.hash_algs();
        if !algs.is_empty() && !algs.contains(&DEFAULT_HASH_ALG) {
            return Err(Error::invalid_request(format!(
                "no supported transaction data hash algorithm in {algs:?}"
            )));
        }
        hashes.push(hash_encoded(encoded, DEFAULT_HASH_ALG)?);
    }
    Ok(KeyBindingChallenge {
        transaction_data_hashes_alg: (!hashes.is_empty()).then(|| DEFAULT_HASH_ALG.to_string()),
        transaction_data_hashes: hashes,
        ..Default::default()
    })
}

fn dcql_vp_token(
    version: ProtocolVersion,
    presentations: Vec<(String, ClaimFormatDesignation, String)>,
) -> Result<Json> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (query_id, _, presentation) in presentations {
        grouped.entry(query_id).or_default().push(presentation);
    }
    let mut token = Map::new();
    for (query_id, mut presentations) in grouped {
        let value = if version >= ProtocolVersion::V1 {
            Json::from(presentations)
        } else if presentations.len() == 1 {
            Json::from(presentations.remove(0))
        } else {
            return Err(Error::protocol(
                version,
                format!("one presentation per credential query, '{query_id}' has more"),
            ));
        };
        token.insert(query_id, value);
    }
    Ok(Json::Object(token))
}

fn pex_vp_token(
    definition_id: &str,
    presentations: Vec<(String, ClaimFormatDesignation, String)>,
) -> Result<(Json, PresentationSubmission)> {
    if presentations.is_empty() {
        return Err(Error::invalid_request("nothing to present"));
    }
    let single = presentations.len() == 1;
    let mut descriptors = vec![];
    let mut tokens = vec![];
    for (index, (descriptor_id, format, presentation)) in presentations.into_iter().enumerate() {
        let path = if single { "$".to_string() } else { format!("$[{index}]") };
        let path = JsonPath::parse(&path).map_err(|e| Error::server(format!("{e}")))?;
        descriptors.push(DescriptorMap::new(descriptor_id, format, path));
        tokens.push(Json::String(presentation));
    }
    let vp_token = if single {
        tokens.remove(0)
    } else {
        Json::Array(tokens)
    };
    Ok((vp_token, PresentationSubmission::new(definition_id, descriptors)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::verifier::{request::Jwks, ClientMetadata, ResponseMode};

    fn request(client_id: Option<&str>) -> AuthorizationRequestObject {
        AuthorizationRequestObject {
            response_type: "vp_token".into(),
            response_mode: ResponseMode::DirectPost,
            client_id: client_id.map(str::to_string),
            client_id_scheme: None,
            response_uri: Some("https://verifier.example.com/cb".into()),
            nonce: "n".into(),
            state: None,
            dcql_query: None,
            presentation_definition: None,
            transaction_data: None,
            client_metadata: None,
            expected_origins: None,
        }
    }

    #[test]
    fn version_detection() {
        let mut draft21 = request(Some("https://verifier.example.com/cb"));
        draft21.client_id_scheme = Some("redirect_uri".into());
        assert_eq!(detect_version(&draft21), ProtocolVersion::Draft21);

        let draft24 = request(Some("x509_san_dns:verifier.example.com"));
        assert_eq!(detect_version(&draft24), ProtocolVersion::Draft24);

        let mut v1 = draft24.clone();
        v1.client_metadata = Some(ClientMetadata {
            jwks: Some(Jwks::default()),
            vp_formats_supported: Some(Map::new()),
            ..Default::default()
        });
        assert_eq!(detect_version(&v1), ProtocolVersion::V1);
    }

    #[test]
    fn redirect_uri_clients_are_bound_to_the_response_uri() {
        let good = request(Some("redirect_uri:https://verifier.example.com/cb"));
        let (scheme, id) = client_id_scheme(ProtocolVersion::V1, &good).unwrap();
        assert_eq!(scheme, ClientIdScheme::RedirectUri);
        check_client(scheme, id.as_deref(), &good, &JwtSigner::None).unwrap();

        let forged = request(Some("redirect_uri:https://attacker.example.com/cb"));
        let (scheme, id) = client_id_scheme(ProtocolVersion::V1, &forged).unwrap();
        assert!(check_client(scheme, id.as_deref(), &forged, &JwtSigner::None)
            .unwrap_err()
            .is_trust());
    }

    #[test]
    fn signed_clients_must_sign() {
        let request = request(Some("did:key:zDnaexample"));
        let (scheme, id) = client_id_scheme(ProtocolVersion::Draft24, &request).unwrap();
        assert_eq!(scheme, ClientIdScheme::Did);
        assert!(check_client(scheme, id.as_deref(), &request, &JwtSigner::None).is_err());
        let other = JwtSigner::Did {
            did_url: "did:key:zDnaother#zDnaother".into(),
        };
        assert!(check_client(scheme, id.as_deref(), &request, &other).is_err());
        let signer = JwtSigner::Did {
            did_url: "did:key:zDnaexample#zDnaexample".into(),
        };
        check_client(scheme, id.as_deref(), &request, &signer).unwrap();
    }

    #[test]
    fn vp_token_shapes() {
        let presentations = vec![
            ("pid".to_string(), ClaimFormatDesignation::DcSdJwt, "a~".to_string()),
            ("pid".to_string(), ClaimFormatDesignation::DcSdJwt, "b~".to_string()),
        ];
        assert_eq!(
            dcql_vp_token(ProtocolVersion::V1, presentations.clone()).unwrap(),
            json!({ "pid": ["a~", "b~"] })
        );
        assert!(dcql_vp_token(ProtocolVersion::Draft24, presentations.clone()).is_err());

        let (token, submission) = pex_vp_token("def", presentations).unwrap();
        assert_eq!(token, json!(["a~", "b~"]));
        assert_eq!(submission.descriptor_map()[1].path().to_string(), "$[1]");
    }
}
