#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use http::{header, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use openid4vc::{
    codec::{
        CodecRegistry, CredentialCodec, CredentialToSign, DecodedCredential, KeyBindingChallenge,
        VerifiedPresentation,
    },
    config::{BaseUrl, EngineConfig},
    core::{
        credential_format::ClaimFormatDesignation,
        dcql_query::{ClaimsPathSegment, DcqlClaimsQuery, DcqlCredentialQuery, DcqlQuery},
        holder_binding::CredentialBinding,
        util::AsyncHttpClient,
    },
    error::{Error, Result},
    issuer::{
        authorization::{
            AuthorizationChallengeRequest, AuthorizationChallengeResponse, PresentationRequest,
        },
        credential::CredentialRequest,
        dpop::DpopProof,
        notification::NotificationRequest,
        par::PushedAuthorizationRequest,
        token::AccessTokenRequest,
        CredentialConfiguration, CredentialMapper, CredentialTemplate, IssuanceSession, Issuer,
        IssuerRecord, MappedCredential, MappingContext, ProofTypeMetadata, PROOF_TYPE_JWT,
    },
    query::{CredentialQuery, CredentialRecord},
    session::MemoryStore,
    trust::{
        did::DidKeyResolver,
        jwk::PublicJwk,
        jwt::DecodedJwt,
        kms::{KeyManagement, MemoryKeyManagement},
        JwtSigner, JwtVerification, TrustCallbacks, TrustPolicy, VerificationPurpose,
    },
    utils::{b64url_encode, b64url_json, random_id, sha256_b64url, unix_now, NonEmptyVec},
    verifier::{Verifier, VerifierRecord},
};
use serde_json::{json, Map, Value as Json};
use tokio::sync::Mutex;

pub const ISSUER_ID: &str = "https://issuer.example.com";
pub const VERIFIER_BASE: &str = "https://verifier.example.com";
pub const UNIVERSITY_DEGREE: &str = "UniversityDegree";
pub const UNIVERSITY_VCT: &str = "https://credentials.example.com/university_degree";

pub const VERIFIER_ROOT: &str = include_str!("../examples/verifier_root.b64");
pub const VERIFIER_LEAF: &str = include_str!("../examples/verifier_leaf.b64");
pub const VERIFIER_KEY: &str = include_str!("../examples/verifier_leaf.key.pem");

const KB_JWT_TYP: &str = "kb+jwt";

pub fn object(value: Json) -> Map<String, Json> {
    match value {
        Json::Object(map) => map,
        _ => Map::new(),
    }
}

/// Selective disclosure JWTs as `<issuer-jwt>~<disclosure>~...~<kb-jwt>`, where each
/// disclosure is `b64url([salt, name, value])` and only top level claims are selectable.
#[derive(Debug)]
pub struct SdJwtCodec;

struct Parsed<'a> {
    issuer_jwt: &'a str,
    disclosures: Vec<&'a str>,
    key_binding: Option<&'a str>,
}

fn split(compact: &str) -> Result<Parsed<'_>> {
    let mut parts: Vec<&str> = compact.split('~').collect();
    if parts.len() < 2 {
        return Err(Error::invalid_request("not an sd-jwt"));
    }
    let last = parts.pop().unwrap_or_default();
    let issuer_jwt = parts.remove(0);
    Ok(Parsed {
        issuer_jwt,
        disclosures: parts.into_iter().filter(|d| !d.is_empty()).collect(),
        key_binding: (!last.is_empty()).then_some(last),
    })
}

fn disclosed_claims(payload: &Map<String, Json>, disclosures: &[&str]) -> Result<(Json, Json)> {
    let digests: Vec<&str> = payload
        .get("_sd")
        .and_then(Json::as_array)
        .map(|values| values.iter().filter_map(Json::as_str).collect())
        .unwrap_or_default();
    let mut claims = payload.clone();
    claims.remove("_sd");
    claims.remove("_sd_alg");
    let mut disclosed = claims.clone();
    for disclosure in disclosures {
        if !digests.contains(&sha256_b64url(disclosure).as_str()) {
            return Err(Error::trust("disclosure is not covered by the issuer signature"));
        }
        let (_, name, value): (String, String, Json) = b64url_json(disclosure)?;
        disclosed.insert(name, value);
    }
    Ok((Json::Object(claims), Json::Object(disclosed)))
}

#[async_trait]
impl CredentialCodec for SdJwtCodec {
    fn format(&self) -> ClaimFormatDesignation {
        ClaimFormatDesignation::DcSdJwt
    }

    async fn sign(&self, trust: &TrustCallbacks, credential: CredentialToSign) -> Result<String> {
        let mut payload = credential.payload;
        let selectable: Vec<String> = credential
            .disclosure_frame
            .as_ref()
            .and_then(|frame| frame.get("_sd"))
            .and_then(Json::as_array)
            .map(|names| names.iter().filter_map(Json::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let mut disclosures = vec![];
        let mut digests = vec![];
        for name in selectable {
            let Some(value) = payload.remove(&name) else {
                continue;
            };
            let disclosure = b64url_encode(json!([random_id(16), name, value]).to_string());
            digests.push(Json::from(sha256_b64url(&disclosure)));
            disclosures.push(disclosure);
        }
        if !digests.is_empty() {
            payload.insert("_sd".into(), digests.into());
            payload.insert("_sd_alg".into(), "sha-256".into());
        }
        match credential.binding {
            Some(CredentialBinding::Jwk { jwk }) => {
                payload.insert("cnf".into(), json!({ "jwk": jwk }));
            }
            Some(CredentialBinding::Did { did_url }) => {
                payload.insert("cnf".into(), json!({ "kid": did_url }));
            }
            None => {}
        }
        let jwt = trust
            .sign_jwt(&credential.issuer, object(json!({"typ": "dc+sd-jwt"})), payload)
            .await?;
        let mut compact = jwt;
        for disclosure in disclosures {
            compact.push('~');
            compact.push_str(&disclosure);
        }
        compact.push('~');
        Ok(compact)
    }

    fn decode(&self, compact: &str) -> Result<DecodedCredential> {
        let parsed = split(compact)?;
        let decoded = DecodedJwt::decode(parsed.issuer_jwt)?;
        let (claims, disclosed_claims) = disclosed_claims(&decoded.payload, &parsed.disclosures)?;
        Ok(DecodedCredential {
            format: self.format(),
            types: decoded
                .claim_str("vct")
                .map(|vct| vec![vct.to_string()])
                .unwrap_or_default(),
            issuer: decoded.claim_str("iss").map(str::to_string),
            issuer_key_identifiers: vec![],
            issuer_federation_entity_ids: vec![],
            holder_bound: decoded.payload.contains_key("cnf"),
            claims,
            disclosed_claims,
        })
    }

    async fn present(
        &self,
        trust: &TrustCallbacks,
        compact: &str,
        disclosures: &[Vec<ClaimsPathSegment>],
        challenge: &KeyBindingChallenge,
        holder: &JwtSigner,
    ) -> Result<String> {
        let parsed = split(compact)?;
        // An empty path asks for the whole credential.
        let everything = disclosures.iter().any(Vec::is_empty);
        let wanted: Vec<&str> = disclosures
            .iter()
            .filter_map(|path| match path.first() {
                Some(ClaimsPathSegment::Key(name)) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let mut presentation = parsed.issuer_jwt.to_string();
        for disclosure in parsed.disclosures {
            let (_, name, _): (String, String, Json) = b64url_json(disclosure)?;
            if everything || wanted.contains(&name.as_str()) {
                presentation.push('~');
                presentation.push_str(disclosure);
            }
        }
        presentation.push('~');
        if let JwtSigner::None = holder {
            return Ok(presentation);
        }

        let mut claims = object(json!({
            "nonce": challenge.nonce,
            "aud": challenge.audience,
            "iat": unix_now(),
            "sd_hash": sha256_b64url(&presentation),
        }));
        if !challenge.transaction_data_hashes.is_empty() {
            claims.insert(
                "transaction_data_hashes".into(),
                challenge.transaction_data_hashes.clone().into(),
            );
            if let Some(alg) = &challenge.transaction_data_hashes_alg {
                claims.insert("transaction_data_hashes_alg".into(), alg.as_str().into());
            }
        }
        let kb_jwt = trust
            .sign_jwt(holder, object(json!({"typ": KB_JWT_TYP})), claims)
            .await?;
        Ok(presentation + &kb_jwt)
    }

    async fn verify_presentation(
        &self,
        trust: &TrustCallbacks,
        policy: &TrustPolicy,
        presentation: &str,
    ) -> Result<VerifiedPresentation> {
        let parsed = split(presentation)?;
        let issuer = trust
            .verify_jwt(
                parsed.issuer_jwt,
                &JwtVerification::for_purpose(VerificationPurpose::CredentialIssuer),
                policy,
            )
            .await?;
        let credential = self.decode(presentation)?;

        let Some(kb_jwt) = parsed.key_binding else {
            return Ok(VerifiedPresentation {
                credential,
                key_binding: None,
            });
        };
        let holder_key: PublicJwk = issuer
            .payload
            .get("cnf")
            .and_then(|cnf| cnf.get("jwk"))
            .cloned()
            .ok_or_else(|| Error::trust("credential is not bound to a jwk"))
            .and_then(|jwk| serde_json::from_value(jwk).map_err(|e| Error::trust(e.to_string())))?;
        let key_binding = trust
            .verify_jwt(kb_jwt, &JwtVerification::with_jwk(holder_key), policy)
            .await?;
        if key_binding.typ() != Some(KB_JWT_TYP) {
            return Err(Error::trust("key binding has the wrong typ"));
        }
        let signed_part = &presentation[..presentation.len() - kb_jwt.len()];
        if key_binding.claim_str("sd_hash") != Some(sha256_b64url(signed_part).as_str()) {
            return Err(Error::trust("key binding 'sd_hash' does not match"));
        }
        Ok(VerifiedPresentation {
            credential,
            key_binding: Some(KeyBindingChallenge {
                nonce: key_binding.claim_str("nonce").unwrap_or_default().to_string(),
                audience: key_binding.claim_str("aud").unwrap_or_default().to_string(),
                transaction_data_hashes: key_binding
                    .payload
                    .get("transaction_data_hashes")
                    .and_then(Json::as_array)
                    .map(|hashes| hashes.iter().filter_map(Json::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
                transaction_data_hashes_alg: key_binding
                    .claim_str("transaction_data_hashes_alg")
                    .map(str::to_string),
            }),
        })
    }
}

/// Canned HTTP endpoints. GETs are answered from `serve`, POSTs are recorded and answered
/// from `serve` as well.
#[derive(Debug, Clone, Default)]
pub struct MockHttp {
    routes: Arc<Mutex<BTreeMap<String, (StatusCode, Vec<u8>)>>>,
    posted: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .await
            .insert(url.to_string(), (StatusCode::OK, body.into()));
    }

    pub async fn serve_json(&self, url: &str, body: Json) {
        self.serve(url, body.to_string()).await
    }

    /// Bodies POSTed so far, with the URL they went to.
    pub async fn posted(&self) -> Vec<(String, String)> {
        self.posted.lock().await.clone()
    }
}

#[async_trait]
impl AsyncHttpClient for MockHttp {
    async fn execute(&self, request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
        let url = request.uri().to_string();
        if request.method() == Method::POST {
            let body = String::from_utf8(request.body().clone()).context("form is not utf-8")?;
            self.posted.lock().await.push((url.clone(), body));
        }
        let (status, body) = self
            .routes
            .lock()
            .await
            .get(&url)
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, b"not found".to_vec()));
        Ok(Response::builder().status(status).body(body)?)
    }
}

pub fn trust(kms: &MemoryKeyManagement, http: Arc<dyn AsyncHttpClient>) -> TrustCallbacks {
    TrustCallbacks::new(Arc::new(kms.clone()), Arc::new(DidKeyResolver), http)
}

/// Serves an [Issuer] the way its HTTP endpoints would. Other URLs go to `fallback`.
#[derive(Debug, Clone)]
pub struct IssuerHttp {
    pub issuer: Issuer,
    pub fallback: Arc<MockHttp>,
}

#[derive(serde::Deserialize)]
struct DeferredCredentialRequest {
    transaction_id: String,
}

fn from_json<T: DeserializeOwned>(json: Json) -> Result<T> {
    serde_json::from_value(json).map_err(|e| Error::invalid_request(e.to_string()))
}

fn to_json(value: impl serde::Serialize) -> Result<Json> {
    serde_json::to_value(value).map_err(|e| Error::server(e.to_string()))
}

fn form_object(body: &[u8]) -> Result<Json> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(body).map_err(|e| Error::invalid_request(e.to_string()))?;
    Ok(Json::Object(
        pairs.into_iter().map(|(k, v)| (k, Json::String(v))).collect(),
    ))
}

fn header_value(request: &Request<Vec<u8>>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn dpop_header(request: &Request<Vec<u8>>, url: &str) -> Option<DpopProof> {
    header_value(request, "dpop").map(|jwt| DpopProof {
        jwt,
        method: request.method().to_string(),
        url: url.to_string(),
    })
}

fn bearer(request: &Request<Vec<u8>>) -> Result<String> {
    let value = header_value(request, "authorization")
        .ok_or_else(|| Error::trust("missing authorization header"))?;
    value
        .strip_prefix("DPoP ")
        .or_else(|| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| Error::trust("unsupported authorization scheme"))
}

fn json_response(status: StatusCode, body: &Json) -> anyhow::Result<Response<Vec<u8>>> {
    let body = match body {
        Json::Null => vec![],
        body => body.to_string().into_bytes(),
    };
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)?)
}

fn error_response(error: &Error) -> anyhow::Result<Response<Vec<u8>>> {
    let (status, code, description) = match error {
        Error::Client { code, description } => {
            (StatusCode::BAD_REQUEST, code.as_str(), description.clone())
        }
        Error::Trust(reason) => (StatusCode::UNAUTHORIZED, "invalid_token", reason.clone()),
        Error::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what.clone()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", other.to_string()),
    };
    json_response(status, &json!({"error": code, "error_description": description}))
}

impl IssuerHttp {
    /// `None` for URLs outside the issuer.
    async fn route(&self, request: &Request<Vec<u8>>) -> Result<Option<(StatusCode, Json)>> {
        let url = request.uri().to_string();
        let Some(path) = url.strip_prefix(ISSUER_ID) else {
            return Ok(None);
        };
        let path = path.split('?').next().unwrap_or_default();
        let issuer = &self.issuer;
        let ok = |json: Json| Ok(Some((StatusCode::OK, json)));
        match (request.method().as_str(), path) {
            ("GET", "/.well-known/openid-credential-issuer") => {
                ok(to_json(issuer.credential_issuer_metadata()?)?)
            }
            ("GET", "/.well-known/oauth-authorization-server") => {
                ok(to_json(issuer.authorization_server_metadata()?)?)
            }
            ("GET", offer) if offer.starts_with("/offers/") => {
                ok(to_json(issuer.get_credential_offer_from_uri(&url).await?)?)
            }
            ("POST", "/token") => {
                let mut token_request: AccessTokenRequest = from_json(form_object(request.body())?)?;
                token_request.dpop = dpop_header(request, &url);
                ok(to_json(issuer.request_token(token_request).await?)?)
            }
            ("POST", "/authorization-challenge") => {
                let form = form_object(request.body())?;
                if let Some(auth_session) = form.get("auth_session").and_then(Json::as_str) {
                    let code = issuer
                        .retrieve_authorization_code_using_presentation(auth_session)
                        .await?;
                    return ok(json!({ "authorization_code": code }));
                }
                let challenge: AuthorizationChallengeRequest = from_json(form)?;
                match issuer.request_authorization_challenge(challenge).await? {
                    AuthorizationChallengeResponse::AuthorizationCode { authorization_code } => {
                        ok(json!({ "authorization_code": authorization_code }))
                    }
                    AuthorizationChallengeResponse::PresentationRequired {
                        auth_session,
                        presentation,
                        ..
                    } => {
                        let presentation = match presentation {
                            PresentationRequest::Url(url) => Json::String(url),
                            PresentationRequest::DcApi(request) => request,
                        };
                        Ok(Some((
                            StatusCode::BAD_REQUEST,
                            json!({
                                "error": "insufficient_authorization",
                                "auth_session": auth_session,
                                "presentation": presentation,
                            }),
                        )))
                    }
                }
            }
            ("POST", "/par") => {
                let mut pushed: PushedAuthorizationRequest = from_json(form_object(request.body())?)?;
                pushed.dpop = dpop_header(request, &url);
                let response = issuer.push_authorization_request(pushed).await?;
                Ok(Some((StatusCode::CREATED, to_json(response)?)))
            }
            ("POST", "/credential") => {
                let credential_request: CredentialRequest =
                    from_json(from_body(request.body())?)?;
                let response = issuer
                    .request_credentials(
                        &bearer(request)?,
                        dpop_header(request, &url).as_ref(),
                        credential_request,
                    )
                    .await?;
                ok(to_json(response)?)
            }
            ("POST", "/deferred_credential") => {
                let deferred: DeferredCredentialRequest = from_json(from_body(request.body())?)?;
                let response = issuer
                    .request_deferred_credentials(
                        &bearer(request)?,
                        dpop_header(request, &url).as_ref(),
                        &deferred.transaction_id,
                    )
                    .await?;
                ok(to_json(response)?)
            }
            ("POST", "/notification") => {
                let notification: NotificationRequest = from_json(from_body(request.body())?)?;
                issuer
                    .handle_notification(
                        &bearer(request)?,
                        dpop_header(request, &url).as_ref(),
                        notification,
                    )
                    .await?;
                Ok(Some((StatusCode::NO_CONTENT, Json::Null)))
            }
            _ => Err(Error::NotFound(url)),
        }
    }
}

fn from_body(body: &[u8]) -> Result<Json> {
    serde_json::from_slice(body).map_err(|e| Error::invalid_request(e.to_string()))
}

#[async_trait]
impl AsyncHttpClient for IssuerHttp {
    async fn execute(&self, request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
        match self.route(&request).await {
            Ok(Some((status, body))) => json_response(status, &body),
            Ok(None) => self.fallback.execute(request).await,
            Err(e) => error_response(&e),
        }
    }
}

pub fn codecs() -> CodecRegistry {
    CodecRegistry::new().with(Arc::new(SdJwtCodec))
}

pub fn config(base_url: &str) -> EngineConfig {
    EngineConfig {
        base_url: BaseUrl::try_from(base_url.to_string()).unwrap(),
        ..Default::default()
    }
}

/// A fresh key of `kms`, as a signer embedding its jwk.
pub async fn jwk_signer(kms: &MemoryKeyManagement) -> JwtSigner {
    let key_id = kms.create_key().await.unwrap();
    JwtSigner::Jwk {
        jwk: kms.public_key(&key_id).await.unwrap(),
    }
}

pub fn holder_jwk(signer: &JwtSigner) -> PublicJwk {
    match signer {
        JwtSigner::Jwk { jwk } => jwk.clone(),
        _ => unreachable!(),
    }
}

/// Signer of the verifier's request objects, certified for `verifier.example.com`.
pub async fn verifier_x5c_signer(kms: &MemoryKeyManagement) -> JwtSigner {
    use p256::pkcs8::DecodePrivateKey;

    kms.import(p256::SecretKey::from_pkcs8_pem(VERIFIER_KEY).unwrap())
        .await
        .unwrap();
    JwtSigner::X5c {
        x5c: vec![VERIFIER_LEAF.trim().to_string()],
        issuer: None,
    }
}

pub fn wallet_trust_policy() -> TrustPolicy {
    TrustPolicy::new().with_certificates(VerificationPurpose::AuthorizationRequest, [VERIFIER_ROOT.trim()])
}

/// Issues university degrees. Offers created with `"deferred": true` in their issuance
/// metadata are deferred on the first request.
#[derive(Debug)]
pub struct UniversityMapper {
    pub issuer: JwtSigner,
}

#[async_trait]
impl CredentialMapper for UniversityMapper {
    async fn map(&self, context: MappingContext<'_>) -> anyhow::Result<MappedCredential> {
        let deferred = context
            .session
            .issuance_metadata
            .get("deferred")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        if deferred && context.transaction_id.is_none() {
            return Ok(MappedCredential::Defer {
                interval_secs: Some(1),
            });
        }
        let given_name = context
            .session
            .issuance_metadata
            .get("given_name")
            .cloned()
            .unwrap_or_else(|| "Alice".into());
        Ok(MappedCredential::Issue(CredentialTemplate {
            payload: object(json!({
                "iss": ISSUER_ID,
                "vct": UNIVERSITY_VCT,
                "iat": unix_now(),
                "given_name": given_name,
                "university": "Example University",
                "degree": "BSc Computer Science",
            })),
            disclosure_frame: Some(json!({"_sd": ["given_name", "university", "degree"]})),
            issuer: self.issuer.clone(),
        }))
    }
}

pub fn university_configuration(scope: Option<&str>) -> CredentialConfiguration {
    CredentialConfiguration {
        format: ClaimFormatDesignation::DcSdJwt,
        scope: scope.map(str::to_string),
        cryptographic_binding_methods_supported: vec!["jwk".into()],
        proof_types_supported: BTreeMap::from([(
            PROOF_TYPE_JWT.to_string(),
            ProofTypeMetadata {
                proof_signing_alg_values_supported: vec!["ES256".into()],
                key_attestations_required: None,
            },
        )]),
    }
}

pub async fn issuer_record(kms: &MemoryKeyManagement) -> IssuerRecord {
    IssuerRecord {
        issuer_id: ISSUER_ID.into(),
        access_token_signer: jwk_signer(kms).await,
        credential_configurations: BTreeMap::from([(
            UNIVERSITY_DEGREE.to_string(),
            university_configuration(Some("university_degree")),
        )]),
        batch_credential_issuance: None,
        authorization: Default::default(),
    }
}

pub struct IssuerSetup {
    pub issuer: Issuer,
    pub kms: MemoryKeyManagement,
    pub http: Arc<MockHttp>,
    pub trust: TrustCallbacks,
    pub sessions: Arc<MemoryStore<IssuanceSession>>,
}

/// An issuer of [UNIVERSITY_DEGREE] credentials, with `customize` applied to its record.
pub async fn issuer_with(
    config: EngineConfig,
    customize: impl FnOnce(&mut IssuerRecord),
    verifier: Option<Verifier>,
) -> IssuerSetup {
    let kms = MemoryKeyManagement::new();
    let http = MockHttp::new();
    let trust = trust(&kms, http.clone());
    let mut record = issuer_record(&kms).await;
    customize(&mut record);
    let sessions = Arc::new(MemoryStore::new());
    let mut builder = Issuer::builder()
        .with_config(config)
        .with_record(record)
        .with_trust(trust.clone())
        .with_codecs(codecs())
        .with_mapper(Arc::new(UniversityMapper {
            issuer: jwk_signer(&kms).await,
        }))
        .with_session_store(sessions.clone());
    if let Some(verifier) = verifier {
        builder = builder.with_verifier(verifier);
    }
    IssuerSetup {
        issuer: builder.build().unwrap(),
        kms,
        http,
        trust,
        sessions,
    }
}

pub async fn issuer() -> IssuerSetup {
    issuer_with(config(ISSUER_ID), |_| {}, None).await
}

pub struct VerifierSetup {
    pub verifier: Verifier,
    pub kms: MemoryKeyManagement,
    pub trust: TrustCallbacks,
}

pub fn verifier_with(config: EngineConfig, kms: &MemoryKeyManagement, http: Arc<MockHttp>) -> VerifierSetup {
    let trust = trust(kms, http);
    let verifier = Verifier::builder()
        .with_config(config)
        .with_record(VerifierRecord::new("verifier"))
        .with_trust(trust.clone())
        .with_codecs(codecs())
        .with_session_store(Arc::new(MemoryStore::new()))
        .build()
        .unwrap();
    VerifierSetup {
        verifier,
        kms: kms.clone(),
        trust,
    }
}

pub fn verifier() -> VerifierSetup {
    verifier_with(config(VERIFIER_BASE), &MemoryKeyManagement::new(), MockHttp::new())
}

/// A JWT proof of possession of `holder` for `c_nonce`.
pub async fn proof_of_possession(trust: &TrustCallbacks, holder: &JwtSigner, c_nonce: &str) -> String {
    trust
        .sign_jwt(
            holder,
            object(json!({"typ": "openid4vci-proof+jwt"})),
            object(json!({"aud": ISSUER_ID, "nonce": c_nonce, "iat": unix_now()})),
        )
        .await
        .unwrap()
}

/// A DPoP proof of `key` for a request.
pub async fn dpop_proof(
    trust: &TrustCallbacks,
    key: &JwtSigner,
    method: &str,
    url: &str,
    access_token: Option<&str>,
) -> openid4vc::issuer::dpop::DpopProof {
    let mut claims = object(json!({
        "htm": method,
        "htu": url,
        "iat": unix_now(),
        "jti": random_id(16),
    }));
    if let Some(token) = access_token {
        claims.insert("ath".into(), sha256_b64url(token).into());
    }
    let jwt = trust
        .sign_jwt(key, object(json!({"typ": "dpop+jwt"})), claims)
        .await
        .unwrap();
    openid4vc::issuer::dpop::DpopProof {
        jwt,
        method: method.into(),
        url: url.into(),
    }
}

/// A degree credential of `holder`, signed by `issuer` directly.
pub async fn issue_degree(
    trust: &TrustCallbacks,
    issuer: &JwtSigner,
    holder: &JwtSigner,
    id: &str,
    given_name: &str,
) -> CredentialRecord {
    let compact = SdJwtCodec
        .sign(
            trust,
            CredentialToSign {
                payload: object(json!({
                    "iss": ISSUER_ID,
                    "vct": UNIVERSITY_VCT,
                    "given_name": given_name,
                    "university": "Example University",
                })),
                disclosure_frame: Some(json!({"_sd": ["given_name", "university"]})),
                binding: Some(CredentialBinding::Jwk {
                    jwk: holder_jwk(holder),
                }),
                issuer: issuer.clone(),
            },
        )
        .await
        .unwrap();
    CredentialRecord::decode(id, &ClaimFormatDesignation::DcSdJwt, compact, &codecs()).unwrap()
}

pub struct Wallet {
    pub holder: openid4vc::holder::Holder,
    pub trust: TrustCallbacks,
    pub http: Arc<MockHttp>,
    pub kms: MemoryKeyManagement,
    pub key: JwtSigner,
    pub credentials: Vec<CredentialRecord>,
}

impl Wallet {
    /// A wallet trusting the test verifier certificate, holding `names.len()` degrees.
    pub async fn new(names: &[&str]) -> Self {
        let http = MockHttp::new();
        Self::with_http(names, http.clone(), http).await
    }

    /// A wallet that reaches `issuer` over its endpoints.
    pub async fn for_issuer(names: &[&str], issuer: &Issuer) -> Self {
        let http = MockHttp::new();
        let client = Arc::new(IssuerHttp {
            issuer: issuer.clone(),
            fallback: http.clone(),
        });
        Self::with_http(names, client, http).await
    }

    async fn with_http(names: &[&str], client: Arc<dyn AsyncHttpClient>, http: Arc<MockHttp>) -> Self {
        let kms = MemoryKeyManagement::new();
        let trust = trust(&kms, client);
        let key = jwk_signer(&kms).await;
        let issuer = jwk_signer(&kms).await;
        let mut credentials = vec![];
        for (index, name) in names.iter().enumerate() {
            credentials.push(issue_degree(&trust, &issuer, &key, &format!("degree-{index}"), name).await);
        }
        let holder = openid4vc::holder::Holder::new(trust.clone(), codecs())
            .with_trust_policy(wallet_trust_policy());
        Self {
            holder,
            trust,
            http,
            kms,
            key,
            credentials,
        }
    }

    /// Every credential is bound to the wallet key.
    pub fn keys(&self) -> BTreeMap<String, JwtSigner> {
        self.credentials
            .iter()
            .map(|c| (c.id.clone(), self.key.clone()))
            .collect()
    }
}

/// The form a holder POSTed, parsed back into a response.
pub fn parse_form(body: &str) -> openid4vc::verifier::AuthorizationResponse {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(body).unwrap();
    openid4vc::verifier::AuthorizationResponse::from_form(
        pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    )
    .unwrap()
}

/// Degrees of [UNIVERSITY_VCT], disclosing only `university`.
pub fn degree_query(multiple: bool) -> CredentialQuery {
    CredentialQuery::DcqlQuery(DcqlQuery::new(NonEmptyVec::new(
        DcqlCredentialQuery::new("degree", ClaimFormatDesignation::DcSdJwt)
            .with_meta("vct_values", json!([UNIVERSITY_VCT]))
            .with_claims(NonEmptyVec::new(DcqlClaimsQuery::keys(&["university"]).unwrap()))
            .with_multiple(multiple),
    )))
}

/// The value of query parameter `name` of `url`.
pub fn query_param(url: &str, name: &str) -> String {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap()
}
