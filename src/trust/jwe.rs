use anyhow::{bail, Context, Result};
use josekit::{jwe::JweHeader, jwk::Jwk};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::jwk::PublicJwk;
use crate::utils::b64url_json;

/// The only key management algorithm supported for authorization responses.
pub const ECDH_ES: &str = "ECDH-ES";

/// Content encryption used when the recipient does not state a preference.
pub const DEFAULT_ENC: ContentEncryption = ContentEncryption::A128Gcm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentEncryption {
    #[serde(rename = "A128GCM")]
    A128Gcm,
    #[serde(rename = "A256GCM")]
    A256Gcm,
    #[serde(rename = "A128CBC-HS256")]
    A128CbcHs256,
}

impl ContentEncryption {
    pub fn name(&self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A256Gcm => "A256GCM",
            Self::A128CbcHs256 => "A128CBC-HS256",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "A128GCM" => Ok(Self::A128Gcm),
            "A256GCM" => Ok(Self::A256Gcm),
            "A128CBC-HS256" => Ok(Self::A128CbcHs256),
            other => bail!("unsupported content encryption '{other}'"),
        }
    }

    /// First supported value in the recipient's preference list.
    pub fn negotiate(supported: &[String]) -> Result<Self> {
        if supported.is_empty() {
            return Ok(DEFAULT_ENC);
        }
        supported
            .iter()
            .find_map(|enc| Self::from_name(enc).ok())
            .with_context(|| format!("none of the content encryptions {supported:?} is supported"))
    }
}

/// Optional header members of an encrypted response.
#[derive(Debug, Clone, Default)]
pub struct JweOptions {
    pub apu: Option<Vec<u8>>,
    pub apv: Option<Vec<u8>>,
    pub typ: Option<String>,
}

/// Encrypt `plaintext` to `recipient` with ECDH-ES direct key agreement.
///
/// The encrypter generates a fresh ephemeral key pair for every call and places its public
/// half in the `epk` header.
pub fn encrypt(
    plaintext: &[u8],
    recipient: &PublicJwk,
    enc: ContentEncryption,
    options: &JweOptions,
) -> Result<String> {
    let jwk = to_josekit(recipient.as_map()).context("invalid recipient JWK")?;

    let mut header = JweHeader::new();
    header.set_algorithm(ECDH_ES);
    header.set_content_encryption(enc.name());
    if let Some(typ) = &options.typ {
        header.set_token_type(typ);
    }
    if let Some(kid) = recipient.kid() {
        header.set_key_id(kid);
    }
    if let Some(apu) = options.apu.as_ref().filter(|apu| !apu.is_empty()) {
        header.set_agreement_partyuinfo(apu);
    }
    if let Some(apv) = options.apv.as_ref().filter(|apv| !apv.is_empty()) {
        header.set_agreement_partyvinfo(apv);
    }

    let encrypter = josekit::jwe::ECDH_ES
        .encrypter_from_jwk(&jwk)
        .context("unable to create ECDH-ES encrypter")?;
    josekit::jwe::serialize_compact(plaintext, &header, &encrypter).context("jwe encryption failed")
}

/// Decrypt a compact JWE with the private key `private_jwk`, returning the protected header
/// and the plaintext.
///
/// Only `ECDH-ES` in direct key agreement mode with a content encryption from
/// [ContentEncryption] is accepted.
pub fn decrypt(compact: &str, private_jwk: &[u8]) -> Result<(Map<String, Json>, Vec<u8>)> {
    let header = decode_header(compact)?;
    match header.get("alg").and_then(Json::as_str) {
        Some(ECDH_ES) => {}
        alg => bail!("unsupported jwe algorithm {alg:?}"),
    }
    let enc = header
        .get("enc")
        .and_then(Json::as_str)
        .context("'enc' was missing from jwe header")?;
    ContentEncryption::from_name(enc)?;

    let jwk = Jwk::from_bytes(private_jwk).context("invalid private JWK")?;
    let decrypter = josekit::jwe::ECDH_ES
        .decrypter_from_jwk(&jwk)
        .context("unable to create ECDH-ES decrypter")?;
    let (plaintext, _) =
        josekit::jwe::deserialize_compact(compact, &decrypter).context("jwe decryption failed")?;
    Ok((header, plaintext))
}

/// The protected header of a compact JWE. Nothing here says the JWE decrypts.
pub fn decode_header(compact: &str) -> Result<Map<String, Json>> {
    let parts: Vec<&str> = compact.split('.').collect();
    let [protected, encrypted_key, _, _, _] = parts.as_slice() else {
        bail!("jwe must have exactly five parts")
    };
    if !encrypted_key.is_empty() {
        bail!("ECDH-ES in direct mode has an empty encrypted key")
    }
    b64url_json(protected).context("invalid jwe header")
}

/// Pick the key a response should be encrypted to from the verifier's JWKS.
pub fn find_encryption_jwk(keys: &[PublicJwk]) -> Result<&PublicJwk> {
    keys.iter()
        .find(|jwk| {
            match jwk.alg() {
                Some(ECDH_ES) | None => {}
                Some(other) => {
                    tracing::debug!("JWK has unsupported alg '{other}', skipping");
                    return false;
                }
            }
            match jwk.key_use() {
                Some("enc") | None => {}
                Some(other) => {
                    tracing::debug!("JWK has use='{other}', not suitable for encryption");
                    return false;
                }
            }
            jwk.to_p256().is_ok()
        })
        .context("no suitable encryption key found in JWKS (requires a P-256 key for ECDH-ES)")
}

fn to_josekit(jwk: &Map<String, Json>) -> Result<Jwk> {
    let bytes = serde_json::to_vec(jwk)?;
    Ok(Jwk::from_bytes(bytes)?)
}
