use anyhow::{bail, Context, Result};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use ssi::JWK;

/// The signature algorithm of every key the engine signs with.
pub const ES256: &str = "ES256";

/// A public JSON Web Key.
///
/// Kept as the raw JSON object so members the engine does not interpret (`kid`, `use`,
/// `alg`, `x5c`, ...) survive a round trip.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Map<String, Json>", into = "Map<String, Json>")]
pub struct PublicJwk(Map<String, Json>);

impl PublicJwk {
    pub fn from_p256(key: &PublicKey) -> Result<Self> {
        let map: Map<String, Json> =
            serde_json::from_str(&key.to_jwk_string()).context("p256 produced an invalid jwk")?;
        Self::try_from(map)
    }

    pub fn to_p256(&self) -> Result<PublicKey> {
        if self.str_member("kty") != Some("EC") || self.str_member("crv") != Some("P-256") {
            bail!("only P-256 EC keys are supported")
        }
        let reduced = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": self.0.get("x"),
            "y": self.0.get("y"),
        });
        PublicKey::from_jwk_str(&reduced.to_string()).context("invalid P-256 jwk")
    }

    pub fn kid(&self) -> Option<&str> {
        self.str_member("kid")
    }

    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.0.insert("kid".into(), Json::String(kid.into()));
        self
    }

    pub fn alg(&self) -> Option<&str> {
        self.str_member("alg")
    }

    pub fn key_use(&self) -> Option<&str> {
        self.str_member("use")
    }

    pub fn with_member(mut self, key: &str, value: Json) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }

    pub fn to_jwk(&self) -> Result<JWK> {
        serde_json::from_value(Json::Object(self.0.clone())).context("unsupported jwk")
    }

    pub fn from_jwk(jwk: &JWK) -> Result<Self> {
        match serde_json::to_value(jwk).context("unable to serialize jwk")? {
            Json::Object(map) => Self::try_from(map),
            _ => bail!("jwk did not serialize to an object"),
        }
    }

    /// RFC 7638 thumbprint, base64url encoded SHA-256 over the required members.
    pub fn thumbprint(&self) -> Result<String> {
        self.to_jwk()?
            .thumbprint()
            .context("unable to compute jwk thumbprint")
    }

    /// Compressed SEC1 encoding of the key.
    pub fn to_sec1_compressed(&self) -> Result<Vec<u8>> {
        Ok(self.to_p256()?.to_encoded_point(true).as_bytes().to_vec())
    }

    /// Two keys are the same if their thumbprints match, irrespective of metadata members.
    pub fn same_key(&self, other: &PublicJwk) -> bool {
        matches!((self.thumbprint(), other.thumbprint()), (Ok(a), Ok(b)) if a == b)
    }

    fn str_member(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Json::as_str)
    }
}

impl TryFrom<Map<String, Json>> for PublicJwk {
    type Error = anyhow::Error;

    fn try_from(map: Map<String, Json>) -> Result<Self> {
        if map.contains_key("d") {
            bail!("jwk contains private key material")
        }
        if !map.get("kty").is_some_and(Json::is_string) {
            bail!("jwk is missing 'kty'")
        }
        Ok(Self(map))
    }
}

impl From<PublicJwk> for Map<String, Json> {
    fn from(jwk: PublicJwk) -> Self {
        jwk.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rfc7638_member_order() {
        let jwk: PublicJwk = serde_json::from_value(json!({
            "kty": "EC",
            "crv": "P-256",
            "x": "gI0GAILBdu7T53akrFmMyGcsF3n5dO7MmwNBHKW5SV0",
            "y": "SLW_xSffzlPWrHEVI30DHM_4egVwt3NQqeUD7nMFpps",
            "kid": "ignored"
        }))
        .unwrap();
        let without_kid: PublicJwk = serde_json::from_value(json!({
            "y": "SLW_xSffzlPWrHEVI30DHM_4egVwt3NQqeUD7nMFpps",
            "x": "gI0GAILBdu7T53akrFmMyGcsF3n5dO7MmwNBHKW5SV0",
            "crv": "P-256",
            "kty": "EC"
        }))
        .unwrap();
        assert!(jwk.same_key(&without_kid));
        assert_eq!(jwk.thumbprint().unwrap().len(), 43);
    }

    #[test]
    fn private_keys_are_rejected() {
        let err = serde_json::from_value::<PublicJwk>(json!({
            "kty": "EC", "crv": "P-256", "x": "a", "y": "b", "d": "c"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("private"));
    }

    #[test]
    fn converts_through_ssi_jwk() {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let jwk = PublicJwk::from_p256(&secret.public_key())
            .unwrap()
            .with_kid("key-1")
            .with_member("use", json!("enc"));
        let converted = PublicJwk::from_jwk(&jwk.to_jwk().unwrap()).unwrap();
        assert!(converted.same_key(&jwk));
        assert_eq!(converted.kid(), Some("key-1"));
        assert_eq!(converted.key_use(), Some("enc"));
        assert!(converted.to_p256().unwrap() == secret.public_key());
    }
}
