use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{info, instrument};
use url::Url;

use super::{
    session::{VerificationEvent, VerificationSession, VerificationState},
    Verifier,
};
use crate::{
    config::ProtocolVersion,
    core::{
        credential_format::ClaimFormatDesignation, dcql_query::DcqlQuery,
        presentation_definition::PresentationDefinition, transaction_data::TransactionData,
    },
    error::{Error, Result},
    query::CredentialQuery,
    trust::{jwe::ECDH_ES, jwk::PublicJwk, x509, JwtSigner},
    utils::{b64url_encode, later, now, unix_now},
};

pub const REQUEST_OBJECT_TYP: &str = "oauth-authz-req+jwt";
pub const REQUEST_SCHEME: &str = "openid4vp://";
/// `aud` of request objects for wallets that are not known in advance.
pub const SELF_ISSUED_AUDIENCE: &str = "https://self-issued.me/v2";

/// Parameters carried as JSON when a request is passed as query parameters.
const JSON_PARAMETERS: [&str; 5] = [
    "dcql_query",
    "presentation_definition",
    "client_metadata",
    "transaction_data",
    "expected_origins",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseMode {
    #[serde(rename = "direct_post")]
    DirectPost,
    #[default]
    #[serde(rename = "direct_post.jwt")]
    DirectPostJwt,
    #[serde(rename = "dc_api")]
    DcApi,
    #[serde(rename = "dc_api.jwt")]
    DcApiJwt,
}

impl ResponseMode {
    pub fn is_dc_api(&self) -> bool {
        matches!(self, ResponseMode::DcApi | ResponseMode::DcApiJwt)
    }

    /// Responses are encrypted to the verifier (JARM).
    pub fn is_encrypted(&self) -> bool {
        matches!(self, ResponseMode::DirectPostJwt | ResponseMode::DcApiJwt)
    }
}

/// How a signed request reaches the wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestDelivery {
    /// The JWT in the `request` parameter.
    ByValue,
    /// A `request_uri` the wallet fetches the JWT from.
    #[default]
    ByReference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<PublicJwk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Jwks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_encrypted_response_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_encrypted_response_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_response_enc_values_supported: Option<Vec<String>>,
    /// Formats of the final version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vp_formats_supported: Option<Map<String, Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vp_formats: Option<Map<String, Json>>,
}

impl ClientMetadata {
    /// Content encryptions the verifier accepts, in order of preference.
    pub fn supported_enc(&self) -> Vec<String> {
        match (
            &self.encrypted_response_enc_values_supported,
            &self.authorization_encrypted_response_enc,
        ) {
            (Some(values), _) => values.clone(),
            (None, Some(enc)) => vec![enc.clone()],
            (None, None) => vec![],
        }
    }

    pub fn encryption_keys(&self) -> &[PublicJwk] {
        self.jwks.as_ref().map(|jwks| jwks.keys.as_slice()).unwrap_or_default()
    }
}

/// The authorization request parameters, whether passed as query parameters, as a
/// request object or through the Digital Credentials API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequestObject {
    pub response_type: String,
    pub response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Only used up to draft 21.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_uri: Option<String>,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dcql_query: Option<DcqlQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_definition: Option<PresentationDefinition>,
    /// Base64url encoded [TransactionData] entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_metadata: Option<ClientMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_origins: Option<Vec<String>>,
}

impl AuthorizationRequestObject {
    /// The query of the request. Exactly one of the two languages must be used.
    pub fn query(&self) -> Result<CredentialQuery> {
        match (&self.dcql_query, &self.presentation_definition) {
            (Some(query), None) => Ok(CredentialQuery::DcqlQuery(query.clone())),
            (None, Some(definition)) => {
                Ok(CredentialQuery::PresentationDefinition(definition.clone()))
            }
            _ => Err(Error::invalid_request(
                "exactly one of 'dcql_query' and 'presentation_definition' is required",
            )),
        }
    }

    pub fn transaction_data(&self) -> &[String] {
        self.transaction_data.as_deref().unwrap_or_default()
    }

    pub fn to_map(&self) -> Result<Map<String, Json>> {
        match serde_json::to_value(self).map_err(anyhow::Error::from)? {
            Json::Object(map) => Ok(map),
            _ => Err(Error::server("request object did not serialize to an object")),
        }
    }

    /// Query parameters of a request passed by value without a request object.
    pub fn to_query_pairs(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .to_map()?
            .into_iter()
            .map(|(key, value)| match value {
                Json::String(value) => (key, value),
                other => (key, other.to_string()),
            })
            .collect())
    }

    pub fn from_query_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut map = Map::new();
        for (key, value) in pairs {
            let value = if JSON_PARAMETERS.contains(&key) {
                serde_json::from_str(value).map_err(|e| {
                    Error::invalid_request(format!("parameter '{key}' is not valid json: {e}"))
                })?
            } else {
                Json::String(value.to_string())
            };
            map.insert(key.to_string(), value);
        }
        Self::from_map(map)
    }

    pub fn from_map(map: Map<String, Json>) -> Result<Self> {
        serde_json::from_value(Json::Object(map))
            .map_err(|e| Error::invalid_request(format!("invalid authorization request: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct CreateAuthorizationRequestOptions {
    pub query: CredentialQuery,
    pub signer: JwtSigner,
    pub response_mode: ResponseMode,
    /// Defaults to the configured protocol version.
    pub version: Option<ProtocolVersion>,
    pub transaction_data: Vec<TransactionData>,
    pub delivery: RequestDelivery,
    /// Origins allowed to forward the request over the Digital Credentials API.
    pub expected_origins: Vec<String>,
    pub context_correlation_id: Option<String>,
}

impl CreateAuthorizationRequestOptions {
    pub fn new(query: CredentialQuery, signer: JwtSigner) -> Self {
        Self {
            query,
            signer,
            response_mode: ResponseMode::default(),
            version: None,
            transaction_data: vec![],
            delivery: RequestDelivery::default(),
            expected_origins: vec![],
            context_correlation_id: None,
        }
    }

    pub fn with_response_mode(mut self, response_mode: ResponseMode) -> Self {
        self.response_mode = response_mode;
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_transaction_data(mut self, entry: TransactionData) -> Self {
        self.transaction_data.push(entry);
        self
    }

    pub fn by_value(mut self) -> Self {
        self.delivery = RequestDelivery::ByValue;
        self
    }

    pub fn with_expected_origins(mut self, origins: Vec<String>) -> Self {
        self.expected_origins = origins;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreatedAuthorizationRequest {
    pub session: VerificationSession,
    /// `openid4vp://` URL for the wallet, `None` for the Digital Credentials API.
    pub authorization_request_url: Option<String>,
    /// The request to hand to the Digital Credentials API.
    pub dc_api_request: Option<Json>,
}

struct ClientIdentity {
    client_id: Option<String>,
    client_id_scheme: Option<String>,
}

fn protocol_checks(version: ProtocolVersion, options: &CreateAuthorizationRequestOptions) -> Result<()> {
    if options.response_mode.is_dc_api() && !version.supports_dc_api() {
        return Err(Error::protocol(
            version,
            "the Digital Credentials API response modes require draft24 or later",
        ));
    }
    if !options.transaction_data.is_empty() && !version.supports_transaction_data() {
        return Err(Error::protocol(version, "transaction data requires draft24 or later"));
    }
    match &options.query {
        CredentialQuery::DcqlQuery(_) if !version.supports_dcql() => Err(Error::protocol(
            version,
            "DCQL requires draft24 or later, use a presentation definition",
        )),
        CredentialQuery::PresentationDefinition(_) if !version.supports_presentation_exchange() => {
            Err(Error::protocol(
                version,
                "presentation definitions were removed, use a DCQL query",
            ))
        }
        _ => Ok(()),
    }
}

/// `vp_formats` advertising ES256 for every format the query asks for.
fn vp_formats(query: &CredentialQuery) -> Map<String, Json> {
    let formats: HashSet<ClaimFormatDesignation> = match query {
        CredentialQuery::DcqlQuery(query) => {
            query.credentials().iter().map(|c| c.format().clone()).collect()
        }
        CredentialQuery::PresentationDefinition(definition) => definition
            .input_descriptors()
            .iter()
            .flat_map(|d| d.format_designations())
            .chain(definition.format_designations())
            .collect(),
    };
    formats
        .into_iter()
        .map(|format| {
            let algs = if format.is_sd_jwt() {
                json!({ "sd-jwt_alg_values": ["ES256"], "kb-jwt_alg_values": ["ES256"] })
            } else {
                json!({ "alg": ["ES256"] })
            };
            (format.name().to_string(), algs)
        })
        .collect()
}

impl Verifier {
    /// Create a verification session and the authorization request for the wallet.
    ///
    /// Requests the negotiated protocol version cannot express are rejected before
    /// anything is stored.
    #[instrument(skip_all)]
    pub async fn create_authorization_request(
        &self,
        options: CreateAuthorizationRequestOptions,
    ) -> Result<CreatedAuthorizationRequest> {
        let version = options.version.unwrap_or(self.config.protocol_version);
        protocol_checks(version, &options)?;
        options.query.validate()?;
        let query_ids = options.query.ids();
        for entry in &options.transaction_data {
            if let Some(unknown) = entry
                .credential_ids()
                .iter()
                .find(|id| !query_ids.contains(&id.as_str()))
            {
                return Err(Error::invalid_request(format!(
                    "transaction data references unknown credential query '{unknown}'"
                )));
            }
        }

        let encryption_key_id = if options.response_mode.is_encrypted() {
            Some(self.trust.kms().create_key().await?)
        } else {
            None
        };
        let created = self
            .new_session(version, options, encryption_key_id.clone())
            .await;
        if created.is_err() {
            if let Some(key_id) = &encryption_key_id {
                self.delete_encryption_key(key_id).await;
            }
        }
        created
    }

    async fn new_session(
        &self,
        version: ProtocolVersion,
        options: CreateAuthorizationRequestOptions,
        encryption_key_id: Option<String>,
    ) -> Result<CreatedAuthorizationRequest> {
        let id = uuid::Uuid::new_v4().to_string();
        let dc_api = options.response_mode.is_dc_api();
        let response_uri = if dc_api {
            None
        } else {
            let mut uri = self.endpoint(&format!("{}/authorize", self.record.verifier_id))?;
            uri.query_pairs_mut().append_pair("session", &id);
            Some(uri.to_string())
        };
        let identity = self.client_identity(version, &options, response_uri.as_deref())?;

        let kms = self.trust.kms();
        let mut client_metadata = ClientMetadata::default();
        if let Some(key_id) = &encryption_key_id {
            let jwk = kms
                .public_key(key_id)
                .await?
                .with_kid(key_id.as_str())
                .with_member("use", "enc".into())
                .with_member("alg", ECDH_ES.into());
            client_metadata.jwks = Some(Jwks { keys: vec![jwk] });
            if version >= ProtocolVersion::V1 {
                client_metadata.encrypted_response_enc_values_supported =
                    Some(self.record.encrypted_response_enc_values_supported.clone());
            } else {
                client_metadata.authorization_encrypted_response_alg = Some(ECDH_ES.into());
                client_metadata.authorization_encrypted_response_enc = self
                    .record
                    .encrypted_response_enc_values_supported
                    .first()
                    .cloned();
            }
        }
        if version >= ProtocolVersion::V1 {
            client_metadata.vp_formats_supported = Some(vp_formats(&options.query));
        } else {
            client_metadata.vp_formats = Some(vp_formats(&options.query));
        }

        let transaction_data = options
            .transaction_data
            .iter()
            .map(|entry| entry.encode())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let (dcql_query, presentation_definition) = match &options.query {
            CredentialQuery::DcqlQuery(query) => (Some(query.clone()), None),
            CredentialQuery::PresentationDefinition(definition) => (None, Some(definition.clone())),
        };
        let request = AuthorizationRequestObject {
            response_type: "vp_token".into(),
            response_mode: options.response_mode,
            client_id: identity.client_id,
            client_id_scheme: identity.client_id_scheme,
            response_uri,
            nonce: b64url_encode(kms.random_bytes(32).await?),
            state: if dc_api {
                None
            } else {
                Some(b64url_encode(kms.random_bytes(32).await?))
            },
            dcql_query,
            presentation_definition,
            transaction_data: (!transaction_data.is_empty()).then_some(transaction_data),
            client_metadata: Some(client_metadata),
            expected_origins: (dc_api && !options.expected_origins.is_empty())
                .then(|| options.expected_origins.clone()),
        };

        let created_at = now();
        let expires_at = later(created_at, self.config.verification_session_lifetime());
        let request_jwt = match options.signer {
            JwtSigner::None => None,
            ref signer => {
                let mut payload = request.to_map()?;
                if let Some(client_id) = &request.client_id {
                    payload.insert("iss".into(), client_id.as_str().into());
                }
                payload.insert("aud".into(), SELF_ISSUED_AUDIENCE.into());
                payload.insert("iat".into(), unix_now().into());
                payload.insert("exp".into(), expires_at.timestamp().into());
                let mut header = Map::new();
                header.insert("typ".into(), REQUEST_OBJECT_TYP.into());
                Some(self.trust.sign_jwt(signer, header, payload).await?)
            }
        };

        let mut request_uri = None;
        let mut authorization_request_url = None;
        let mut dc_api_request = None;
        if dc_api {
            dc_api_request = Some(match &request_jwt {
                Some(jwt) => json!({ "request": jwt }),
                None => Json::Object(request.to_map()?),
            });
        } else {
            let mut url = Url::parse(REQUEST_SCHEME).map_err(anyhow::Error::from)?;
            {
                let mut pairs = url.query_pairs_mut();
                match (&request_jwt, options.delivery) {
                    (Some(jwt), RequestDelivery::ByValue) => {
                        if let Some(client_id) = &request.client_id {
                            pairs.append_pair("client_id", client_id);
                        }
                        pairs.append_pair("request", jwt);
                    }
                    (Some(_), RequestDelivery::ByReference) => {
                        let uri = self
                            .endpoint(&format!(
                                "{}/authorization-requests/{id}",
                                self.record.verifier_id
                            ))?
                            .to_string();
                        if let Some(client_id) = &request.client_id {
                            pairs.append_pair("client_id", client_id);
                        }
                        pairs.append_pair("request_uri", &uri);
                        request_uri = Some(uri);
                    }
                    (None, _) => {
                        for (key, value) in request.to_query_pairs()? {
                            pairs.append_pair(&key, &value);
                        }
                    }
                }
            }
            authorization_request_url = Some(url.to_string());
        }

        let session = VerificationSession {
            id: id.clone(),
            verifier_id: self.record.verifier_id.clone(),
            context_correlation_id: options.context_correlation_id,
            state: VerificationState::RequestCreated,
            protocol_version: version,
            signer: options.signer,
            query: options.query,
            request,
            request_jwt,
            request_uri,
            encryption_key_id,
            verified_result: None,
            error_message: None,
            created_at,
            expires_at,
        };
        self.sessions.insert(&id, session.clone()).await?;
        info!(session = id, %version, "created authorization request");

        Ok(CreatedAuthorizationRequest {
            session,
            authorization_request_url,
            dc_api_request,
        })
    }

    /// Serve a request passed by reference, moving the session to `RequestUriRetrieved`.
    #[instrument(skip_all)]
    pub async fn retrieve_request_object(&self, session_id: &str) -> Result<String> {
        let mut versioned = self.ensure_pending(self.sessions.get(session_id).await?).await?;
        let (Some(jwt), Some(_)) = (
            versioned.session.request_jwt.clone(),
            versioned.session.request_uri.as_ref(),
        ) else {
            return Err(Error::NotFound(format!(
                "request object of verification session '{session_id}'"
            )));
        };
        if versioned.session.state == VerificationState::RequestCreated {
            versioned.session.apply(VerificationEvent::RequestUriRetrieved)?;
            self.save(versioned).await?;
        }
        Ok(jwt)
    }

    fn client_identity(
        &self,
        version: ProtocolVersion,
        options: &CreateAuthorizationRequestOptions,
        response_uri: Option<&str>,
    ) -> Result<ClientIdentity> {
        let prefixed = |prefix: &str, id: &str| {
            if version.uses_client_id_prefix() {
                ClientIdentity {
                    client_id: Some(format!("{prefix}:{id}")),
                    client_id_scheme: None,
                }
            } else {
                ClientIdentity {
                    client_id: Some(id.to_string()),
                    client_id_scheme: Some(prefix.to_string()),
                }
            }
        };

        match &options.signer {
            JwtSigner::Did { did_url } => {
                let did = did_url.split('#').next().unwrap_or(did_url);
                Ok(match version {
                    ProtocolVersion::Draft21 => ClientIdentity {
                        client_id: Some(did.to_string()),
                        client_id_scheme: Some("did".into()),
                    },
                    ProtocolVersion::Draft24 => ClientIdentity {
                        client_id: Some(did.to_string()),
                        client_id_scheme: None,
                    },
                    ProtocolVersion::V1 => prefixed("decentralized_identifier", did),
                })
            }
            JwtSigner::X5c { x5c, issuer } => {
                let source = issuer
                    .as_deref()
                    .or(response_uri)
                    .unwrap_or(self.config.base_url.as_str());
                let host = Url::parse(source)
                    .ok()
                    .and_then(|url| url.host_str().map(str::to_string))
                    .ok_or_else(|| Error::server(format!("no host in '{source}'")))?;
                let leaf = x5c
                    .first()
                    .ok_or_else(|| Error::server("x5c signer without certificates"))?;
                if !x509::dns_names(&x509::decode_certificate(leaf)?).contains(&host) {
                    return Err(Error::server(format!(
                        "the leaf certificate has no DNS subject alternative name '{host}'"
                    )));
                }
                Ok(prefixed("x509_san_dns", &host))
            }
            JwtSigner::Federation { entity_id, .. } => {
                let secure = entity_id.starts_with("https://");
                let insecure_allowed = self.config.allow_insecure_federation_entity_ids
                    && entity_id.starts_with("http://");
                if !secure && !insecure_allowed {
                    return Err(Error::server(format!(
                        "federation entity id '{entity_id}' must be an https url"
                    )));
                }
                Ok(match version {
                    ProtocolVersion::Draft21 => ClientIdentity {
                        client_id: Some(entity_id.clone()),
                        client_id_scheme: Some("entity_id".into()),
                    },
                    ProtocolVersion::Draft24 => ClientIdentity {
                        client_id: Some(entity_id.clone()),
                        client_id_scheme: None,
                    },
                    ProtocolVersion::V1 => prefixed("openid_federation", entity_id),
                })
            }
            JwtSigner::Jwk { .. } => Err(Error::server(
                "a raw jwk cannot identify a verifier, use a did, x5c or federation signer",
            )),
            JwtSigner::None => match response_uri {
                // Unsigned DC API requests are identified by the origin.
                None => Ok(ClientIdentity {
                    client_id: None,
                    client_id_scheme: None,
                }),
                Some(response_uri) => Ok(prefixed("redirect_uri", response_uri)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::dcql_query::DcqlCredentialQuery, utils::NonEmptyVec};

    fn dcql() -> CredentialQuery {
        CredentialQuery::DcqlQuery(DcqlQuery::new(NonEmptyVec::new(DcqlCredentialQuery::new(
            "pid",
            ClaimFormatDesignation::DcSdJwt,
        ))))
    }

    #[test]
    fn version_gates() {
        let options = CreateAuthorizationRequestOptions::new(dcql(), JwtSigner::None);
        let err = protocol_checks(ProtocolVersion::Draft21, &options).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        protocol_checks(ProtocolVersion::Draft24, &options).unwrap();

        let dc_api = options.clone().with_response_mode(ResponseMode::DcApi);
        assert!(protocol_checks(ProtocolVersion::Draft21, &dc_api).is_err());
        protocol_checks(ProtocolVersion::V1, &dc_api).unwrap();
    }

    #[test]
    fn query_parameters_round_trip() {
        let request = AuthorizationRequestObject {
            response_type: "vp_token".into(),
            response_mode: ResponseMode::DirectPost,
            client_id: Some("redirect_uri:https://verifier.example.com/cb".into()),
            client_id_scheme: None,
            response_uri: Some("https://verifier.example.com/cb".into()),
            nonce: "n".into(),
            state: Some("s".into()),
            dcql_query: match dcql() {
                CredentialQuery::DcqlQuery(query) => Some(query),
                _ => None,
            },
            presentation_definition: None,
            transaction_data: None,
            client_metadata: None,
            expected_origins: None,
        };
        let pairs = request.to_query_pairs().unwrap();
        let parsed = AuthorizationRequestObject::from_query_pairs(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .unwrap();
        assert_eq!(parsed, request);
        assert!(parsed.query().is_ok());
    }

    #[test]
    fn response_mode_names() {
        assert_eq!(
            serde_json::to_value(ResponseMode::DirectPostJwt).unwrap(),
            json!("direct_post.jwt")
        );
        assert!(ResponseMode::DcApiJwt.is_encrypted());
        assert!(ResponseMode::DcApiJwt.is_dc_api());
        assert!(!ResponseMode::DirectPost.is_encrypted());
    }
}
