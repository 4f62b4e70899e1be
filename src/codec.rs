use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{
    core::{
        credential_format::ClaimFormatDesignation, dcql_query::ClaimsPathSegment,
        holder_binding::CredentialBinding,
    },
    error::{Error, Result},
    trust::{JwtSigner, TrustCallbacks, TrustPolicy},
};

/// What an issuer asks a codec to sign.
#[derive(Debug, Clone)]
pub struct CredentialToSign {
    pub payload: Map<String, Json>,
    /// Format specific disclosure frame, for SD-JWT `{"_sd": ["claim", ...]}`.
    pub disclosure_frame: Option<Json>,
    pub binding: Option<CredentialBinding>,
    pub issuer: JwtSigner,
}

/// A credential as the holder (or verifier) sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedCredential {
    pub format: ClaimFormatDesignation,
    /// Claims covered directly by the issuer signature.
    pub claims: Json,
    /// Claims including every disclosure available in this encoding.
    pub disclosed_claims: Json,
    /// `vct`, `doctype` or W3C `type` values.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    /// Base64url key identifiers of the issuer certificate chain.
    #[serde(default)]
    pub issuer_key_identifiers: Vec<String>,
    /// Federation entity ids the issuer is known to chain up to.
    #[serde(default)]
    pub issuer_federation_entity_ids: Vec<String>,
    #[serde(default)]
    pub holder_bound: bool,
}

/// Data the holder's key binding proof must cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBindingChallenge {
    pub nonce: String,
    pub audience: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transaction_data_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_data_hashes_alg: Option<String>,
}

/// A presentation whose issuer signature and holder binding verified.
#[derive(Debug, Clone)]
pub struct VerifiedPresentation {
    pub credential: DecodedCredential,
    /// The challenge as signed by the holder, `None` if not holder bound.
    pub key_binding: Option<KeyBindingChallenge>,
}

/// Format specific signing, parsing and presenting of credentials.
#[async_trait]
pub trait CredentialCodec: Debug + Send + Sync {
    fn format(&self) -> ClaimFormatDesignation;

    async fn sign(&self, trust: &TrustCallbacks, credential: CredentialToSign) -> Result<String>;

    fn decode(&self, compact: &str) -> Result<DecodedCredential>;

    /// Create a presentation disclosing only `disclosures` and bound to `challenge` with
    /// the key of `holder`.
    async fn present(
        &self,
        trust: &TrustCallbacks,
        compact: &str,
        disclosures: &[Vec<ClaimsPathSegment>],
        challenge: &KeyBindingChallenge,
        holder: &JwtSigner,
    ) -> Result<String>;

    async fn verify_presentation(
        &self,
        trust: &TrustCallbacks,
        policy: &TrustPolicy,
        presentation: &str,
    ) -> Result<VerifiedPresentation>;
}

/// Codecs by format.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<ClaimFormatDesignation, Arc<dyn CredentialCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, codec: Arc<dyn CredentialCodec>) -> Self {
        self.register(codec);
        self
    }

    pub fn register(&mut self, codec: Arc<dyn CredentialCodec>) {
        let format = codec.format();
        // One codec serves both SD-JWT media types.
        if format.is_sd_jwt() {
            self.codecs
                .insert(ClaimFormatDesignation::DcSdJwt, codec.clone());
            self.codecs.insert(ClaimFormatDesignation::VcSdJwt, codec);
        } else {
            self.codecs.insert(format, codec);
        }
    }

    pub fn get(&self, format: &ClaimFormatDesignation) -> Result<&dyn CredentialCodec> {
        self.codecs
            .get(format)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::server(format!("no codec registered for format '{format}'")))
    }
}
