use anyhow::{Context, Result};
use async_trait::async_trait;
use ssi::{
    dids::{DIDKey, VerificationMethodDIDResolver},
    jwk::JWKResolver,
    verification_methods::AnyJwkMethod,
};

use super::jwk::PublicJwk;

/// DID resolution collaborator: maps a DID URL to the public key of the referenced
/// verification method.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve_verification_method(&self, did_url: &str) -> Result<PublicJwk>;
}

/// Resolves `did:key` identifiers without any network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DidKeyResolver;

#[async_trait]
impl DidResolver for DidKeyResolver {
    async fn resolve_verification_method(&self, did_url: &str) -> Result<PublicJwk> {
        split_did_url(did_url)?;
        let resolver: VerificationMethodDIDResolver<DIDKey, AnyJwkMethod> =
            VerificationMethodDIDResolver::new(DIDKey);
        let kid = did_url.to_string();
        let jwk = resolver
            .fetch_public_jwk(Some(&kid))
            .await
            .with_context(|| format!("unable to resolve '{did_url}'"))?;
        Ok(PublicJwk::from_jwk(&jwk)?.with_kid(kid))
    }
}

/// The did:key verification method URL (`did:key:z...#z...`) of a public key.
pub fn did_key_url(jwk: &PublicJwk) -> Result<String> {
    let url = DIDKey::generate_url(&jwk.to_jwk()?).context("unable to derive did:key")?;
    Ok(url.to_string())
}

/// Split a DID URL into the DID and its fragment.
pub fn split_did_url(did_url: &str) -> Result<(&str, &str)> {
    did_url.split_once('#').with_context(|| {
        format!("expected a DID verification method in 'kid' header, received '{did_url}'")
    })
}
