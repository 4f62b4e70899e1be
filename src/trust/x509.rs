use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use p256::{
    ecdsa::{signature::Verifier, Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
};
use serde_json::{Map, Value as Json};
use tracing::debug;
use x509_cert::{
    der::{Decode, Encode},
    ext::pkix::{
        name::GeneralName, AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages,
        SubjectAltName, SubjectKeyIdentifier,
    },
    spki::ObjectIdentifier,
    Certificate,
};

use super::jwk::PublicJwk;
use crate::utils::b64url_encode;

const ECDSA_WITH_SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Decode one `x5c` entry (standard base64 DER, padding optional).
pub fn decode_certificate(b64_der: &str) -> Result<Certificate> {
    let der = BASE64_STANDARD_NO_PAD
        .decode(b64_der.trim().trim_end_matches('='))
        .context("certificate was not valid base64")?;
    Certificate::from_der(&der).context("certificate was not valid DER")
}

pub fn encode_certificate(certificate: &Certificate) -> Result<String> {
    let der = certificate
        .to_der()
        .context("unable to encode certificate")?;
    Ok(BASE64_STANDARD.encode(der))
}

/// Parse the `x5c` header of a JWS, leaf first.
pub fn parse_x5c(header: &Map<String, Json>) -> Result<Vec<Certificate>> {
    let Some(Json::Array(x5c)) = header.get("x5c") else {
        bail!("'x5c' header was missing or not an array")
    };
    if x5c.is_empty() {
        bail!("'x5c' was an empty array")
    }
    x5c.iter()
        .map(|entry| match entry {
            Json::String(b64) => decode_certificate(b64),
            _ => bail!("'x5c' header was not an array of strings"),
        })
        .collect()
}

/// Public key of a certificate as a JWK.
pub fn public_jwk(certificate: &Certificate) -> Result<PublicJwk> {
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .context("unable to encode SPKI")?;
    let key = p256::PublicKey::from_public_key_der(&spki)
        .context("certificate key is not a P-256 key")?;
    PublicJwk::from_p256(&key)
}

/// Certificates are only verified with ecdsa-with-SHA256 over a P-256 issuer key.
fn check_signature_algorithm(certificate: &Certificate) -> Result<()> {
    let oid = certificate.signature_algorithm.oid;
    if oid != ECDSA_WITH_SHA_256 {
        bail!("unsupported certificate signature algorithm {oid}, only ecdsa-with-SHA256 is accepted")
    }
    Ok(())
}

/// Check that `certificate` was signed by the key of `issuer`.
pub fn verify_signed_by(certificate: &Certificate, issuer: &Certificate) -> Result<()> {
    check_signature_algorithm(certificate)?;
    let spki = issuer
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .context("unable to encode issuer SPKI")?;
    let key = VerifyingKey::from_public_key_der(&spki).context("unable to parse SPKI")?;
    let signature = certificate
        .signature
        .as_bytes()
        .context("certificate signature has unused bits")?;
    let signature = Signature::from_der(signature).context("malformed certificate signature")?;
    let tbs = certificate
        .tbs_certificate
        .to_der()
        .context("unable to encode tbsCertificate")?;
    key.verify(&tbs, &signature)
        .context("certificate signature could not be verified")
}

/// Check that `issuer` may sign certificates with `below` intermediate CAs beneath it:
/// `cA` must be set, `pathLenConstraint` respected and, if present, key usage must allow
/// `keyCertSign`.
fn check_issuer(issuer: &Certificate, below: usize) -> Result<()> {
    let tbs = &issuer.tbs_certificate;
    match tbs
        .get::<BasicConstraints>()
        .context("malformed basicConstraints extension")?
    {
        Some((_, constraints)) if constraints.ca => {
            if let Some(max) = constraints.path_len_constraint {
                if below > usize::from(max) {
                    bail!("'{}' allows at most {max} intermediate certificates", tbs.subject)
                }
            }
        }
        _ => bail!("'{}' is not a CA certificate", tbs.subject),
    }
    if let Some((_, usage)) = tbs
        .get::<KeyUsage>()
        .context("malformed keyUsage extension")?
    {
        if !usage.0.contains(KeyUsages::KeyCertSign) {
            bail!("key usage of '{}' does not allow certificate signing", tbs.subject)
        }
    }
    Ok(())
}

fn check_validity(certificate: &Certificate, now: Duration) -> Result<()> {
    let validity = &certificate.tbs_certificate.validity;
    if validity.not_before.to_unix_duration() > now {
        bail!("certificate is not yet valid")
    }
    if validity.not_after.to_unix_duration() < now {
        bail!("certificate has expired")
    }
    Ok(())
}

/// Validate a leaf-first certificate chain against a set of trusted certificates.
///
/// Every certificate must be within its validity period and signed by the next one, which
/// must be a CA certificate allowed to sign certificates. The chain is accepted as soon as
/// one of its certificates is trusted, or when its last certificate is signed by a trusted
/// CA certificate.
///
/// Only ecdsa-with-SHA256 signatures are verified. A certificate signed with any other
/// algorithm fails validation with an "unsupported certificate signature algorithm" error.
pub fn validate_chain(chain: &[Certificate], trusted: &[Certificate], now: Duration) -> Result<()> {
    if chain.is_empty() {
        bail!("certificate chain is empty")
    }
    if trusted.is_empty() {
        bail!("no trusted certificates configured")
    }
    let trusted_der = trusted
        .iter()
        .map(|t| t.to_der())
        .collect::<Result<Vec<_>, _>>()
        .context("unable to encode trusted certificate")?;

    for (i, certificate) in chain.iter().enumerate() {
        check_validity(certificate, now).with_context(|| format!("chain element {i}"))?;

        let der = certificate.to_der().context("unable to encode certificate")?;
        if trusted_der.contains(&der) {
            debug!("chain element {i} is a trusted certificate");
            return Ok(());
        }

        check_signature_algorithm(certificate).with_context(|| format!("chain element {i}"))?;
        match chain.get(i + 1) {
            Some(issuer) => {
                verify_signed_by(certificate, issuer).with_context(|| {
                    format!("chain element {i} is not signed by element {}", i + 1)
                })?;
                check_issuer(issuer, i).with_context(|| format!("chain element {}", i + 1))?;
            }
            None => {
                let anchor = trusted
                    .iter()
                    .filter(|t| {
                        check_validity(t, now).is_ok() && verify_signed_by(certificate, t).is_ok()
                    })
                    .map(|t| check_issuer(t, i))
                    .reduce(|found, next| found.or(next));
                return match anchor {
                    Some(result) => result.context("trusted certificate cannot issue the chain"),
                    None => bail!("certificate chain does not lead to a trusted certificate"),
                };
            }
        }
    }

    bail!("certificate chain does not lead to a trusted certificate")
}

/// DNS Subject Alternative Names of a certificate.
pub fn dns_names(certificate: &Certificate) -> Vec<String> {
    subject_alt_names(certificate)
        .into_iter()
        .filter_map(|gn| match gn {
            GeneralName::DnsName(dns) => Some(dns.to_string()),
            gn => {
                debug!("found non-DNS SAN: {gn:?}");
                None
            }
        })
        .collect()
}

/// URI Subject Alternative Names of a certificate.
pub fn uri_names(certificate: &Certificate) -> Vec<String> {
    subject_alt_names(certificate)
        .into_iter()
        .filter_map(|gn| match gn {
            GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
            _ => None,
        })
        .collect()
}

fn subject_alt_names(certificate: &Certificate) -> Vec<GeneralName> {
    certificate
        .tbs_certificate
        .filter::<SubjectAltName>()
        .filter_map(|r| match r {
            Ok((_crit, san)) => Some(san.0.into_iter()),
            Err(e) => {
                debug!("unable to parse SubjectAlternativeName from DER: {e}");
                None
            }
        })
        .flatten()
        .collect()
}

/// Base64url key identifiers (authority and subject) found in a certificate, used to
/// match `aki` trusted authority constraints.
pub fn key_identifiers(certificate: &Certificate) -> Vec<String> {
    let tbs = &certificate.tbs_certificate;
    let authority = tbs
        .filter::<AuthorityKeyIdentifier>()
        .filter_map(|r| r.ok())
        .filter_map(|(_, aki)| aki.key_identifier)
        .map(|id| b64url_encode(id.as_bytes()));
    let subject = tbs
        .filter::<SubjectKeyIdentifier>()
        .filter_map(|r| r.ok())
        .map(|(_, ski)| b64url_encode(ski.0.as_bytes()));
    authority.chain(subject).collect()
}
