//! Signing, verification and encryption on behalf of issuers, verifiers and holders.
//!
//! Every operation branches on a [JwtSigner] method. Trust material is never cached: a
//! [TrustContext] is built from the caller's [TrustPolicy] for each verification.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, instrument};
use x509_cert::Certificate;

use crate::{
    config::EngineConfig,
    core::util::AsyncHttpClient,
    error::{Error, OrTrustError, Result},
    utils::unix_now,
};

pub mod attestation;
pub mod did;
pub mod federation;
pub mod jwe;
pub mod jwk;
pub mod jwt;
pub mod kms;
pub mod x509;

use did::DidResolver;
use jwe::{ContentEncryption, JweOptions};
use jwk::{PublicJwk, ES256};
use jwt::DecodedJwt;
use kms::{key_id_for, legacy_key_id_from_fingerprint, KeyManagement};

/// Why a JWT is being verified. Each purpose resolves its own trusted certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPurpose {
    AuthorizationRequest,
    KeyAttestation,
    ClientAttestation,
    CredentialIssuer,
}

impl fmt::Display for VerificationPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationRequest => "authorization request",
            Self::KeyAttestation => "key attestation",
            Self::ClientAttestation => "client attestation",
            Self::CredentialIssuer => "credential issuer",
        }
        .fmt(f)
    }
}

/// Trust configuration supplied by the caller of a verification.
///
/// Certificates are base64 DER, keyed by the purpose they may be used for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    trusted_certificates: HashMap<VerificationPurpose, Vec<String>>,
    trusted_federation_entity_ids: Vec<String>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificates(
        mut self,
        purpose: VerificationPurpose,
        certificates: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.trusted_certificates
            .entry(purpose)
            .or_default()
            .extend(certificates.into_iter().map(Into::into));
        self
    }

    pub fn with_federation_entity_ids(
        mut self,
        entity_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.trusted_federation_entity_ids
            .extend(entity_ids.into_iter().map(Into::into));
        self
    }

    /// Resolve the trust material for one verification.
    pub fn context(&self, purpose: VerificationPurpose) -> Result<TrustContext> {
        let certificates = self
            .trusted_certificates
            .get(&purpose)
            .map(|certs| {
                certs
                    .iter()
                    .map(|c| x509::decode_certificate(c))
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .transpose()
            .map_err(|e| Error::server(format!("trusted certificate for {purpose}: {e:#}")))?
            .unwrap_or_default();
        Ok(TrustContext {
            purpose,
            certificates,
            federation_entity_ids: self.trusted_federation_entity_ids.clone(),
        })
    }
}

/// Trust material resolved for a single verification. Never persisted.
#[derive(Debug, Clone)]
pub struct TrustContext {
    pub purpose: VerificationPurpose,
    pub certificates: Vec<Certificate>,
    pub federation_entity_ids: Vec<String>,
}

/// Identity a JWT is signed with (or was verified against).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum JwtSigner {
    /// Key referenced by a DID URL; goes into the `kid` header.
    Did { did_url: String },
    /// Raw key, embedded in the `jwk` header.
    Jwk { jwk: PublicJwk },
    /// Leaf first base64 DER chain, embedded in the `x5c` header.
    X5c {
        x5c: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issuer: Option<String>,
    },
    /// Key published in the entity's federation metadata; goes into the `kid` header.
    Federation { entity_id: String, jwk: PublicJwk },
    /// Unsigned (`alg: none`).
    None,
}

impl JwtSigner {
    pub fn method(&self) -> &'static str {
        match self {
            JwtSigner::Did { .. } => "did",
            JwtSigner::Jwk { .. } => "jwk",
            JwtSigner::X5c { .. } => "x5c",
            JwtSigner::Federation { .. } => "federation",
            JwtSigner::None => "none",
        }
    }
}

/// How [TrustCallbacks::verify_jwt] should find the verification key.
#[derive(Debug, Clone, Default)]
pub struct JwtVerification {
    /// Required for `x5c` signed JWTs, selects the trusted certificates.
    pub purpose: Option<VerificationPurpose>,
    /// Resolve the key through the federation trust chain of this entity.
    pub federation_entity_id: Option<String>,
    /// Verify against this key regardless of the headers.
    pub jwk: Option<PublicJwk>,
    pub allow_unsigned: bool,
}

impl JwtVerification {
    pub fn for_purpose(purpose: VerificationPurpose) -> Self {
        Self {
            purpose: Some(purpose),
            ..Default::default()
        }
    }

    pub fn with_jwk(jwk: PublicJwk) -> Self {
        Self {
            jwk: Some(jwk),
            ..Default::default()
        }
    }
}

/// A JWT whose signature (if any) verified.
#[derive(Debug, Clone)]
pub struct VerifiedJwt {
    pub header: Map<String, Json>,
    pub payload: Map<String, Json>,
    pub signer: JwtSigner,
    /// `None` for unsigned JWTs.
    pub key: Option<PublicJwk>,
}

impl VerifiedJwt {
    pub fn claim_str(&self, claim: &str) -> Option<&str> {
        self.payload.get(claim).and_then(Json::as_str)
    }

    pub fn typ(&self) -> Option<&str> {
        self.header.get("typ").and_then(Json::as_str)
    }

    /// Whether `aud` is `expected` or an array containing it.
    pub fn has_audience(&self, expected: &str) -> bool {
        match self.payload.get("aud") {
            Some(Json::String(aud)) => aud == expected,
            Some(Json::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
            _ => false,
        }
    }
}

/// The dispatch surface for signing, verification and JWE.
#[derive(Clone)]
pub struct TrustCallbacks {
    kms: Arc<dyn KeyManagement>,
    did_resolver: Arc<dyn DidResolver>,
    http_client: Arc<dyn AsyncHttpClient>,
    allow_insecure_federation_entity_ids: bool,
    max_federation_chain_depth: usize,
}

impl fmt::Debug for TrustCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustCallbacks")
            .field("kms", &self.kms)
            .field(
                "allow_insecure_federation_entity_ids",
                &self.allow_insecure_federation_entity_ids,
            )
            .field("max_federation_chain_depth", &self.max_federation_chain_depth)
            .finish_non_exhaustive()
    }
}

impl TrustCallbacks {
    pub fn new(
        kms: Arc<dyn KeyManagement>,
        did_resolver: Arc<dyn DidResolver>,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Self {
        let defaults = EngineConfig::default();
        Self {
            kms,
            did_resolver,
            http_client,
            allow_insecure_federation_entity_ids: defaults.allow_insecure_federation_entity_ids,
            max_federation_chain_depth: defaults.max_federation_chain_depth,
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.allow_insecure_federation_entity_ids = config.allow_insecure_federation_entity_ids;
        self.max_federation_chain_depth = config.max_federation_chain_depth;
        self
    }

    pub fn kms(&self) -> &dyn KeyManagement {
        self.kms.as_ref()
    }

    pub fn http_client(&self) -> &dyn AsyncHttpClient {
        self.http_client.as_ref()
    }

    /// Public key a signer signs with.
    pub async fn signer_key(&self, signer: &JwtSigner) -> Result<PublicJwk> {
        match signer {
            JwtSigner::Did { did_url } => self
                .did_resolver
                .resolve_verification_method(did_url)
                .await
                .or_trust("unable to resolve signer DID"),
            JwtSigner::Jwk { jwk } | JwtSigner::Federation { jwk, .. } => Ok(jwk.clone()),
            JwtSigner::X5c { x5c, .. } => {
                let leaf = x5c
                    .first()
                    .ok_or_else(|| Error::server("x5c signer without certificates"))?;
                Ok(x509::public_jwk(&x509::decode_certificate(leaf)?)?)
            }
            JwtSigner::None => Err(Error::server("an unsigned signer has no key")),
        }
    }

    /// Sign `payload`, adding the key reference headers of `signer` to `header`.
    #[instrument(skip_all, fields(method = signer.method()))]
    pub async fn sign_jwt(
        &self,
        signer: &JwtSigner,
        mut header: Map<String, Json>,
        payload: Map<String, Json>,
    ) -> Result<String> {
        if let JwtSigner::None = signer {
            header.insert("alg".into(), "none".into());
            let input = jwt::signing_input(&header, &payload)?;
            return Ok(format!("{input}."));
        }

        let key = self.signer_key(signer).await?;
        header.insert("alg".into(), ES256.into());
        match signer {
            JwtSigner::Did { did_url } => {
                header.insert("kid".into(), did_url.as_str().into());
            }
            JwtSigner::Jwk { jwk } => {
                header.insert("jwk".into(), serde_json::to_value(jwk).map_err(anyhow::Error::from)?);
            }
            JwtSigner::X5c { x5c, .. } => {
                header.insert("x5c".into(), x5c.clone().into());
            }
            JwtSigner::Federation { jwk, .. } => {
                let kid = jwk
                    .kid()
                    .ok_or_else(|| Error::server("federation signing key has no 'kid'"))?;
                header.insert("kid".into(), kid.into());
            }
            JwtSigner::None => {}
        }

        let input = jwt::signing_input(&header, &payload)?;
        let key_id = key_id_for(&key)?;
        let signature = self.kms.sign(&key_id, input.as_bytes()).await?;
        Ok(jwt::assemble(&input, &signature))
    }

    /// Verify a compact JWS, selecting the verification key per [JwtVerification] and the
    /// JWT's headers. Signature and trust failures are [Error::Trust].
    #[instrument(skip_all)]
    pub async fn verify_jwt(
        &self,
        compact: &str,
        options: &JwtVerification,
        policy: &TrustPolicy,
    ) -> Result<VerifiedJwt> {
        let decoded = DecodedJwt::decode(compact).or_trust("malformed jwt")?;
        decoded.check_time(unix_now()).or_trust("jwt is not valid now")?;
        let alg = decoded.alg().or_trust("malformed jwt")?.to_string();

        if alg == "none" {
            if !options.allow_unsigned {
                return Err(Error::trust("unsigned jwt is not accepted"));
            }
            if decoded.is_signed() {
                return Err(Error::trust("unsigned jwt carries a signature"));
            }
            return Ok(VerifiedJwt {
                header: decoded.header,
                payload: decoded.payload,
                signer: JwtSigner::None,
                key: None,
            });
        }

        let (signer, key) = if let Some(entity_id) = &options.federation_entity_id {
            if options.purpose != Some(VerificationPurpose::AuthorizationRequest) {
                return Err(Error::trust(
                    "federation is only accepted for signed authorization requests",
                ));
            }
            let context = policy.context(VerificationPurpose::AuthorizationRequest)?;
            let kid = decoded
                .kid()
                .ok_or_else(|| Error::trust("federation signed jwt has no 'kid' header"))?;
            let jwk = self
                .resolve_federation_chain(entity_id, &context)
                .await?
                .relying_party_key(kid)?;
            let signer = JwtSigner::Federation {
                entity_id: entity_id.clone(),
                jwk: jwk.clone(),
            };
            (signer, jwk)
        } else if let Some(jwk) = &options.jwk {
            (JwtSigner::Jwk { jwk: jwk.clone() }, jwk.clone())
        } else if decoded.header.contains_key("x5c") {
            let purpose = options
                .purpose
                .ok_or_else(|| Error::trust("x5c signed jwt without a verification purpose"))?;
            let context = policy.context(purpose)?;
            let chain = x509::parse_x5c(&decoded.header).or_trust("invalid x5c header")?;
            x509::validate_chain(&chain, &context.certificates, now())
                .or_trust(&format!("untrusted {purpose} certificate chain"))?;
            let jwk = x509::public_jwk(&chain[0]).or_trust("unsupported certificate key")?;
            let x5c = chain
                .iter()
                .map(x509::encode_certificate)
                .collect::<anyhow::Result<Vec<_>>>()?;
            let issuer = decoded.claim_str("iss").map(str::to_string);
            (JwtSigner::X5c { x5c, issuer }, jwk)
        } else if let Some(kid) = decoded.kid().filter(|kid| kid.starts_with("did:")) {
            did::split_did_url(kid).or_trust("invalid kid")?;
            let jwk = self
                .did_resolver
                .resolve_verification_method(kid)
                .await
                .or_trust("unable to resolve verification method")?;
            let signer = JwtSigner::Did {
                did_url: kid.to_string(),
            };
            (signer, jwk)
        } else if let Some(jwk) = decoded.header.get("jwk") {
            let jwk: PublicJwk =
                serde_json::from_value(jwk.clone()).or_trust("invalid 'jwk' header")?;
            (JwtSigner::Jwk { jwk: jwk.clone() }, jwk)
        } else {
            return Err(Error::trust(
                "unable to determine the signer of the jwt: no x5c, did kid or jwk header",
            ));
        };

        decoded.verify(&key).or_trust("jwt signature")?;
        debug!(method = signer.method(), "verified jwt signature");

        Ok(VerifiedJwt {
            header: decoded.header,
            payload: decoded.payload,
            signer,
            key: Some(key),
        })
    }

    /// Encrypt `plaintext` to the first suitable key of `recipient_keys` using ECDH-ES.
    pub fn encrypt_jwe(
        &self,
        recipient_keys: &[PublicJwk],
        supported_enc: &[String],
        plaintext: &[u8],
        options: &JweOptions,
    ) -> Result<String> {
        let recipient = jwe::find_encryption_jwk(recipient_keys)
            .map_err(|e| Error::invalid_request(format!("{e:#}")))?;
        let enc = ContentEncryption::negotiate(supported_enc)
            .map_err(|e| Error::invalid_request(format!("{e:#}")))?;
        Ok(jwe::encrypt(plaintext, recipient, enc, options)?)
    }

    /// Decrypt a compact JWE with a key held by the KMS.
    ///
    /// The `kid` header names the key. It may also be a did:key fingerprint, which is
    /// translated to the key id older wallets used. `fallback_key_id` is used when the
    /// header has no `kid`.
    pub async fn decrypt_jwe(
        &self,
        compact: &str,
        fallback_key_id: Option<&str>,
    ) -> Result<(Map<String, Json>, Vec<u8>)> {
        let header = jwe::decode_header(compact).or_trust("malformed jwe")?;
        let key_id = match header.get("kid").and_then(Json::as_str) {
            Some(kid) => match legacy_key_id_from_fingerprint(kid) {
                Some(legacy) => {
                    debug!("translated fingerprint kid to legacy key id");
                    legacy
                }
                None => kid.to_string(),
            },
            None => fallback_key_id
                .ok_or_else(|| Error::trust("jwe has no 'kid' and no key id is known"))?
                .to_string(),
        };
        self.kms
            .decrypt_jwe(&key_id, compact)
            .await
            .or_trust("jwe decryption")
    }
}

fn now() -> Duration {
    Duration::from_secs(unix_now().max(0) as u64)
}
