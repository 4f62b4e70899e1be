use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

/// Engine-wide settings shared by the issuer, verifier and holder roles.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: BaseUrl,
    pub protocol_version: ProtocolVersion,
    pub access_token_lifetime_secs: u64,
    pub c_nonce_lifetime_secs: u64,
    pub authorization_code_lifetime_secs: u64,
    pub offer_lifetime_secs: u64,
    pub verification_session_lifetime_secs: u64,
    pub deferred_interval_secs: u64,
    /// Accept `http:` federation entity identifiers. Only meant for local testing.
    pub allow_insecure_federation_entity_ids: bool,
    pub max_federation_chain_depth: usize,
    pub tenant: TenantConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: BaseUrl::localhost(),
            protocol_version: ProtocolVersion::V1,
            access_token_lifetime_secs: 180,
            c_nonce_lifetime_secs: 300,
            authorization_code_lifetime_secs: 60,
            offer_lifetime_secs: 360,
            verification_session_lifetime_secs: 300,
            deferred_interval_secs: 5,
            allow_insecure_federation_entity_ids: false,
            max_federation_chain_depth: 8,
            tenant: TenantConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn access_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.access_token_lifetime_secs)
    }

    pub fn c_nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.c_nonce_lifetime_secs)
    }

    pub fn authorization_code_lifetime(&self) -> Duration {
        Duration::from_secs(self.authorization_code_lifetime_secs)
    }

    pub fn offer_lifetime(&self) -> Duration {
        Duration::from_secs(self.offer_lifetime_secs)
    }

    pub fn verification_session_lifetime(&self) -> Duration {
        Duration::from_secs(self.verification_session_lifetime_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TenantConfig {
    pub max_sessions: usize,
    pub session_acquire_timeout_ms: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_acquire_timeout_ms: 1_000,
        }
    }
}

/// The OID4VP version negotiated with a wallet.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    #[serde(rename = "draft21")]
    Draft21,
    #[serde(rename = "draft24")]
    Draft24,
    #[serde(rename = "v1")]
    V1,
}

impl ProtocolVersion {
    /// Client identifiers carry their scheme as a prefix (`x509_san_dns:...`).
    pub fn uses_client_id_prefix(&self) -> bool {
        *self >= ProtocolVersion::Draft24
    }

    pub fn supports_dcql(&self) -> bool {
        *self >= ProtocolVersion::Draft24
    }

    pub fn supports_transaction_data(&self) -> bool {
        *self >= ProtocolVersion::Draft24
    }

    pub fn supports_dc_api(&self) -> bool {
        *self >= ProtocolVersion::Draft24
    }

    /// Presentation exchange was dropped in OpenID4VP 1.0.
    pub fn supports_presentation_exchange(&self) -> bool {
        *self < ProtocolVersion::V1
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Draft21 => "draft21",
            ProtocolVersion::Draft24 => "draft24",
            ProtocolVersion::V1 => "v1",
        }
        .fmt(f)
    }
}

/// A url that is always a base (can be safely join()'ed with further path elements without
/// mangling).
#[derive(Deserialize, Debug, Clone, Hash, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct BaseUrl(Url);

impl BaseUrl {
    fn localhost() -> Self {
        // A literal that always parses.
        Self(Url::parse("http://localhost/").unwrap_or_else(|_| unreachable!()))
    }

    /// Join a sub path, keeping the base intact.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.0.join(path.trim_start_matches('/'))
    }
}

impl std::ops::Deref for BaseUrl {
    type Target = Url;

    fn deref(&self) -> &Url {
        &self.0
    }
}

impl TryFrom<String> for BaseUrl {
    type Error = url::ParseError;

    fn try_from(mut url: String) -> Result<Self, Self::Error> {
        // Make URL a base.
        if !url.ends_with('/') {
            url += "/"
        }
        url.parse().map(Self)
    }
}
