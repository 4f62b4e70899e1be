//! DPoP proof validation (RFC 9449).

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    error::{Error, ErrorCode, Result},
    trust::{jwk::PublicJwk, JwtVerification, TrustCallbacks, TrustPolicy},
    utils::{sha256_b64url, unix_now},
};

pub const DPOP_TYP: &str = "dpop+jwt";
/// Accepted clock difference for `iat`, in seconds.
const IAT_WINDOW_SECS: i64 = 300;

/// A `DPoP` header together with the request it was sent with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopProof {
    pub jwt: String,
    /// HTTP method of the request.
    pub method: String,
    /// Full URL of the request.
    pub url: String,
}

fn invalid(description: impl Into<String>) -> Error {
    Error::client(ErrorCode::InvalidDpopProof, description)
}

/// `htu` comparison ignores query and fragment.
fn normalize_htu(url: &str) -> Result<String> {
    let mut url = Url::parse(url).map_err(|e| invalid(format!("invalid 'htu': {e}")))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

impl TrustCallbacks {
    /// Verify a DPoP proof and return the thumbprint of its key.
    ///
    /// `access_token` is checked against the `ath` claim when given. `expected_jkt` pins
    /// the proof to the key an access token was bound to.
    pub async fn verify_dpop(
        &self,
        proof: &DpopProof,
        access_token: Option<&str>,
        expected_jkt: Option<&str>,
    ) -> Result<String> {
        let decoded = crate::trust::jwt::DecodedJwt::decode(&proof.jwt)
            .map_err(|e| invalid(format!("malformed DPoP proof: {e:#}")))?;
        if decoded.typ() != Some(DPOP_TYP) {
            return Err(invalid(format!("DPoP proof must have typ '{DPOP_TYP}'")));
        }
        let jwk: PublicJwk = decoded
            .header
            .get("jwk")
            .cloned()
            .ok_or_else(|| invalid("DPoP proof has no 'jwk' header"))
            .and_then(|jwk| {
                serde_json::from_value(jwk).map_err(|e| invalid(format!("invalid 'jwk': {e}")))
            })?;

        let verified = self
            .verify_jwt(&proof.jwt, &JwtVerification::with_jwk(jwk.clone()), &TrustPolicy::new())
            .await
            .map_err(|e| invalid(e.to_string()))?;

        if verified.claim_str("htm") != Some(proof.method.as_str()) {
            return Err(invalid("'htm' does not match the request method"));
        }
        let htu = verified
            .claim_str("htu")
            .ok_or_else(|| invalid("DPoP proof has no 'htu'"))?;
        if normalize_htu(htu)? != normalize_htu(&proof.url)? {
            return Err(invalid("'htu' does not match the request url"));
        }
        if verified.claim_str("jti").is_none() {
            return Err(invalid("DPoP proof has no 'jti'"));
        }
        let iat = verified
            .payload
            .get("iat")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| invalid("DPoP proof has no 'iat'"))?;
        if (unix_now() - iat).abs() > IAT_WINDOW_SECS {
            return Err(invalid("DPoP proof 'iat' is outside the accepted window"));
        }
        if let Some(access_token) = access_token {
            if verified.claim_str("ath") != Some(sha256_b64url(access_token).as_str()) {
                return Err(invalid("'ath' does not match the access token"));
            }
        }

        let jkt = jwk.thumbprint()?;
        if let Some(expected) = expected_jkt {
            if expected != jkt {
                return Err(invalid("DPoP key does not match the key the token is bound to"));
            }
        }
        debug!(jkt, "verified DPoP proof");
        Ok(jkt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use http::{Request, Response};
    use serde_json::{json, Map, Value as Json};

    use super::*;
    use crate::{
        core::util::AsyncHttpClient,
        trust::{
            did::DidKeyResolver,
            kms::{KeyManagement, MemoryKeyManagement},
            JwtSigner,
        },
    };

    #[derive(Debug)]
    struct NoHttp;

    #[async_trait]
    impl AsyncHttpClient for NoHttp {
        async fn execute(&self, _: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
            anyhow::bail!("no network")
        }
    }

    fn object(value: Json) -> Map<String, Json> {
        match value {
            Json::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn proof(trust: &TrustCallbacks, jwk: &PublicJwk, claims: Json) -> String {
        trust
            .sign_jwt(
                &JwtSigner::Jwk { jwk: jwk.clone() },
                object(json!({"typ": DPOP_TYP})),
                object(claims),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dpop_checks() {
        let kms = Arc::new(MemoryKeyManagement::new());
        let trust = TrustCallbacks::new(kms.clone(), Arc::new(DidKeyResolver), Arc::new(NoHttp));
        let key_id = kms.create_key().await.unwrap();
        let jwk = kms.public_key(&key_id).await.unwrap();

        let jwt = proof(
            &trust,
            &jwk,
            json!({
                "htm": "POST",
                "htu": "https://issuer.example.com/credential",
                "iat": unix_now(),
                "jti": "1",
                "ath": sha256_b64url("token")
            }),
        )
        .await;
        let request = DpopProof {
            jwt,
            method: "POST".into(),
            url: "https://issuer.example.com/credential?x=1".into(),
        };
        let jkt = trust.verify_dpop(&request, Some("token"), None).await.unwrap();
        assert_eq!(jkt, jwk.thumbprint().unwrap());

        let err = trust
            .verify_dpop(&request, Some("other-token"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidDpopProof));

        let err = trust
            .verify_dpop(&request, None, Some("another-thumbprint"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidDpopProof));

        let stale = DpopProof {
            jwt: proof(
                &trust,
                &jwk,
                json!({"htm": "POST", "htu": "https://issuer.example.com/credential",
                       "iat": unix_now() - 3600, "jti": "2"}),
            )
            .await,
            ..request
        };
        assert!(trust.verify_dpop(&stale, None, None).await.is_err());
    }
}
