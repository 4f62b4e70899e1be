use anyhow::{bail, Context, Result};
use serde_json::{Map, Value as Json};

use super::jwk::PublicJwk;
use crate::utils::{b64url_encode, b64url_json};

/// A compact JWS split into its parts. Nothing here says the signature is valid.
#[derive(Debug, Clone)]
pub struct DecodedJwt {
    pub header: Map<String, Json>,
    pub payload: Map<String, Json>,
    compact: String,
    signed: bool,
}

impl DecodedJwt {
    pub fn decode(jwt: &str) -> Result<Self> {
        let (header_b64, payload_b64, signature_b64) =
            ssi::claims::jws::split_jws(jwt).context("jwt must have exactly three parts")?;

        let header: Map<String, Json> =
            b64url_json(header_b64).context("jwt header is not a json object")?;
        let payload: Map<String, Json> =
            b64url_json(payload_b64).context("jwt payload is not a json object")?;

        Ok(Self {
            header,
            payload,
            compact: jwt.to_string(),
            signed: !signature_b64.is_empty(),
        })
    }

    pub fn alg(&self) -> Result<&str> {
        self.header
            .get("alg")
            .and_then(Json::as_str)
            .context("'alg' was missing from jwt headers")
    }

    pub fn typ(&self) -> Option<&str> {
        self.header.get("typ").and_then(Json::as_str)
    }

    pub fn kid(&self) -> Option<&str> {
        self.header.get("kid").and_then(Json::as_str)
    }

    /// Whether the compact form carries a signature segment.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn claim_str(&self, claim: &str) -> Option<&str> {
        self.payload.get(claim).and_then(Json::as_str)
    }

    pub fn claim_i64(&self, claim: &str) -> Option<i64> {
        self.payload.get(claim).and_then(Json::as_i64)
    }

    /// Checks `exp` and `nbf` against `now`, both optional.
    pub fn check_time(&self, now: i64) -> Result<()> {
        if let Some(exp) = self.claim_i64("exp") {
            if exp <= now {
                bail!("jwt expired at {exp}")
            }
        }
        if let Some(nbf) = self.claim_i64("nbf") {
            if nbf > now {
                bail!("jwt not valid before {nbf}")
            }
        }
        Ok(())
    }

    /// Whether `aud` is `expected` or an array containing it.
    pub fn has_audience(&self, expected: &str) -> bool {
        match self.payload.get("aud") {
            Some(Json::String(aud)) => aud == expected,
            Some(Json::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
            _ => false,
        }
    }

    /// Verify the signature against `key`.
    pub fn verify(&self, key: &PublicJwk) -> Result<()> {
        if self.alg()? == "none" {
            bail!("unsigned jwt has no signature to verify")
        }
        let jwk = key.to_jwk()?;
        let _: Json = ssi::claims::jwt::decode_verify(&self.compact, &jwk)
            .context("jwt signature could not be verified")?;
        Ok(())
    }
}

/// `base64url(header).base64url(payload)`.
pub fn signing_input(header: &Map<String, Json>, payload: &Map<String, Json>) -> Result<String> {
    let header = serde_json::to_vec(header).context("unable to serialize jwt header")?;
    let payload = serde_json::to_vec(payload).context("unable to serialize jwt payload")?;
    Ok(format!("{}.{}", b64url_encode(header), b64url_encode(payload)))
}

pub fn assemble(signing_input: &str, signature: &[u8]) -> String {
    format!("{signing_input}.{}", b64url_encode(signature))
}
