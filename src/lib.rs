//! This library provides a Rust implementation of [OID4VCI] credential issuance and
//! [OID4VP] credential presentation, for issuers, verifiers and holders.
//!
//! [OID4VCI]: <https://openid.net/specs/openid-4-verifiable-credential-issuance-1_0.html>
//! [OID4VP]: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html>
//!
//! # Issuer Usage
//!
//! ```ignore
//! use openid4vc::issuer::{offer::CreateOfferOptions, Issuer};
//! use openid4vc::session::MemoryStore;
//!
//! let issuer = Issuer::builder()
//!     .with_record(issuer_record)
//!     .with_trust(trust)
//!     .with_codecs(codecs)
//!     .with_mapper(mapper)
//!     .with_session_store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! // Offer a credential with a pre-authorized code.
//! let offer = issuer
//!     .create_credential_offer(CreateOfferOptions {
//!         credential_configuration_ids: vec!["UniversityDegree".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! // The wallet fetches the offer, redeems the code and requests its credentials.
//! let payload = issuer.get_credential_offer_from_uri(&uri).await?;
//! let token = issuer.request_token(token_request).await?;
//! let credentials = issuer
//!     .request_credentials(&token.access_token, dpop.as_ref(), credential_request)
//!     .await?;
//! ```
//!
//! # Verifier Usage
//!
//! ```ignore
//! use openid4vc::verifier::{CreateAuthorizationRequestOptions, Verifier};
//!
//! let verifier = Verifier::builder()
//!     .with_record(VerifierRecord::new("verifier"))
//!     .with_trust(trust)
//!     .with_codecs(codecs)
//!     .with_session_store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let created = verifier
//!     .create_authorization_request(CreateAuthorizationRequestOptions::new(query, signer))
//!     .await?;
//!
//! // Present `created.authorization_request_url` to the wallet (e.g., as a QR code), then
//! // verify what it posts to the response URI.
//! let result = verifier
//!     .verify_authorization_response(&created.session.id, response, None)
//!     .await?;
//! ```
//!
//! # Holder Usage
//!
//! ```ignore
//! use openid4vc::holder::{Holder, RequestInput};
//! use openid4vc::query::select_credentials;
//!
//! let holder = Holder::new(trust, codecs);
//! let resolved = holder
//!     .resolve_authorization_request(RequestInput::Url(url), &credentials, None)
//!     .await?;
//! let selection = select_credentials(&resolved.query_match)?;
//! let accepted = holder
//!     .accept_authorization_request(&resolved, &selection, &credentials, &holder_keys)
//!     .await?;
//! holder.submit_authorization_response(&accepted).await?;
//! ```
//!
//! Receiving credentials from an issuer:
//!
//! ```ignore
//! use openid4vc::holder::issuance::TokenRequestOptions;
//!
//! let resolved = holder.resolve_credential_offer(&credential_offer).await?;
//! let mut token = holder
//!     .request_access_token(&resolved, TokenRequestOptions::PreAuthorizedCode { tx_code })
//!     .await?;
//! let outcomes = holder
//!     .accept_credential_offer(&resolved, &mut token, &holder_key, &Default::default())
//!     .await?;
//! ```
//!
//! # Protocol Overview
//!
//! Issuance sessions ([`issuer::IssuanceSession`]) and verification sessions
//! ([`verifier::VerificationSession`]) are state machines persisted through a
//! [`session::SessionStore`]. Every transition is written with a compare-and-swap on the
//! session revision, so concurrent requests for the same session cannot both succeed.
//!
//! Cryptography is routed through [`trust::TrustCallbacks`]: signing and key agreement
//! go to a [`trust::kms::KeyManagement`] implementation, and signers are identified by
//! DID, certificate chain, raw JWK or OpenID Federation entity.
//!
//! Credential formats plug in through [`codec::CredentialCodec`]. Queries are written in
//! DCQL ([`core::dcql_query`]) or, for older protocol versions, presentation exchange
//! ([`core::presentation_definition`]); both are resolved by the [`query`] module.

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod holder;
pub mod issuer;
pub mod query;
pub mod session;
pub mod tenant;
pub mod trust;
pub mod utils;
pub mod verifier;
