use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, instrument};

use super::{
    request::AuthorizationRequestObject,
    session::{VerificationEvent, VerificationSession, VerificationState, VerifiedCredential, VerifiedResult},
    Verifier,
};
use crate::{
    codec::KeyBindingChallenge,
    config::ProtocolVersion,
    core::{
        credential_format::ClaimFormatDesignation,
        presentation_submission::PresentationSubmission,
        transaction_data::{hash_encoded, TransactionData, TransactionDataHash, DEFAULT_HASH_ALG},
    },
    error::{Error, ErrorCode, Result},
    query::{match_submission, CredentialQuery, CredentialRecord},
};

/// The wallet's response, as posted to the response URI or returned over the Digital
/// Credentials API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    /// Encrypted response (JWE) of the `.jwt` response modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vp_token: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_submission: Option<PresentationSubmission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl AuthorizationResponse {
    pub fn encrypted(response: String) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }

    /// `application/x-www-form-urlencoded` parameters.
    pub fn to_form(&self) -> Result<Vec<(String, String)>> {
        let mut form = vec![];
        if let Some(response) = &self.response {
            form.push(("response".into(), response.clone()));
        }
        match &self.vp_token {
            Some(Json::String(token)) => form.push(("vp_token".into(), token.clone())),
            Some(token) => form.push(("vp_token".into(), token.to_string())),
            None => {}
        }
        if let Some(submission) = &self.presentation_submission {
            form.push((
                "presentation_submission".into(),
                serde_json::to_string(submission).map_err(anyhow::Error::from)?,
            ));
        }
        if let Some(state) = &self.state {
            form.push(("state".into(), state.clone()));
        }
        Ok(form)
    }

    pub fn from_form<'a>(form: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut response = Self::default();
        for (key, value) in form {
            match key {
                "response" => response.response = Some(value.to_string()),
                // A single presentation is sent as is, anything else as json.
                "vp_token" => {
                    response.vp_token = Some(match serde_json::from_str::<Json>(value) {
                        Ok(json @ (Json::Object(_) | Json::Array(_))) => json,
                        _ => Json::String(value.to_string()),
                    })
                }
                "presentation_submission" => {
                    response.presentation_submission =
                        Some(serde_json::from_str(value).map_err(|e| {
                            Error::invalid_request(format!("invalid 'presentation_submission': {e}"))
                        })?)
                }
                "state" => response.state = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(response)
    }
}

fn invalid_presentation(description: impl Into<String>) -> Error {
    Error::client(ErrorCode::InvalidPresentation, description)
}

/// The `aud` the holder's key binding proof must carry.
///
/// Unsigned requests over the Digital Credentials API have no client id, the calling
/// origin takes its place.
pub fn key_binding_audience(
    version: ProtocolVersion,
    request: &AuthorizationRequestObject,
    origin: Option<&str>,
) -> Result<String> {
    if let Some(client_id) = &request.client_id {
        return Ok(client_id.clone());
    }
    if !request.response_mode.is_dc_api() {
        return Err(Error::invalid_request("authorization request has no client_id"));
    }
    let origin =
        origin.ok_or_else(|| Error::invalid_request("the calling origin is required"))?;
    Ok(if version >= ProtocolVersion::V1 {
        format!("origin:{origin}")
    } else {
        format!("web-origin:{origin}")
    })
}

/// One presentation out of the `vp_token`.
#[derive(Debug)]
struct Submitted {
    query_id: String,
    format: ClaimFormatDesignation,
    presentation: String,
    holder_binding_required: bool,
}

fn as_presentation(value: &Json, query_id: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid_presentation(format!("presentation for '{query_id}' is not a string")))
}

/// Split the `vp_token` into presentations keyed by the query they answer.
fn unpack_vp_token(
    session: &VerificationSession,
    vp_token: &Json,
    submission: Option<&PresentationSubmission>,
) -> Result<Vec<Submitted>> {
    let mut submitted = vec![];
    match &session.query {
        CredentialQuery::DcqlQuery(query) => {
            let Json::Object(entries) = vp_token else {
                return Err(invalid_presentation("'vp_token' must be an object"));
            };
            for (query_id, value) in entries {
                let credential_query = query.credential(query_id).ok_or_else(|| {
                    invalid_presentation(format!("presentation submitted for unknown query '{query_id}'"))
                })?;
                let presentations = match (session.protocol_version, value) {
                    (ProtocolVersion::V1, Json::Array(values)) => values
                        .iter()
                        .map(|v| as_presentation(v, query_id))
                        .collect::<Result<Vec<_>>>()?,
                    (ProtocolVersion::V1, _) => {
                        return Err(invalid_presentation(format!(
                            "presentations for '{query_id}' must be an array"
                        )))
                    }
                    (_, value) => vec![as_presentation(value, query_id)?],
                };
                if presentations.is_empty() {
                    return Err(invalid_presentation(format!("no presentation for '{query_id}'")));
                }
                if presentations.len() > 1 && !credential_query.multiple() {
                    return Err(invalid_presentation(format!(
                        "query '{query_id}' does not allow multiple presentations"
                    )));
                }
                submitted.extend(presentations.into_iter().map(|presentation| Submitted {
                    query_id: query_id.clone(),
                    format: credential_query.format().clone(),
                    presentation,
                    holder_binding_required: credential_query
                        .require_cryptographic_holder_binding(),
                }));
            }
        }
        CredentialQuery::PresentationDefinition(definition) => {
            let submission = submission
                .ok_or_else(|| invalid_presentation("'presentation_submission' is required"))?;
            if submission.definition_id() != definition.id() {
                return Err(invalid_presentation(format!(
                    "submission is for definition '{}', expected '{}'",
                    submission.definition_id(),
                    definition.id()
                )));
            }
            for descriptor in submission.descriptor_map() {
                let value = descriptor
                    .select(vp_token)
                    .map_err(|e| invalid_presentation(format!("{e:#}")))?;
                submitted.push(Submitted {
                    query_id: descriptor.id().to_string(),
                    format: descriptor.format().clone(),
                    presentation: as_presentation(value, descriptor.id())?,
                    holder_binding_required: false,
                });
            }
        }
    }
    Ok(submitted)
}

/// Check the transaction data hashes of one key binding against the requested entries
/// bound to `query_id`.
fn confirm_transaction_data(
    requested: &[(String, TransactionData)],
    query_id: &str,
    key_binding: Option<&KeyBindingChallenge>,
    confirmed: &mut Vec<TransactionDataHash>,
) -> Result<()> {
    let bound: Vec<&String> = requested
        .iter()
        .filter(|(_, entry)| entry.binds(query_id))
        .map(|(encoded, _)| encoded)
        .collect();
    if bound.is_empty() {
        return Ok(());
    }
    let key_binding = key_binding.ok_or_else(|| {
        invalid_presentation(format!(
            "presentation for '{query_id}' must confirm transaction data with a key binding"
        ))
    })?;
    let alg = key_binding
        .transaction_data_hashes_alg
        .as_deref()
        .unwrap_or(DEFAULT_HASH_ALG);
    let mut expected = HashSet::new();
    for encoded in bound {
        let hash = hash_encoded(encoded, alg).map_err(|e| invalid_presentation(format!("{e:#}")))?;
        if !key_binding.transaction_data_hashes.contains(&hash) {
            return Err(invalid_presentation(format!(
                "presentation for '{query_id}' does not confirm all transaction data"
            )));
        }
        confirmed.push(TransactionDataHash {
            credential_id: query_id.to_string(),
            encoded: encoded.clone(),
            hash: hash.clone(),
            hash_alg: alg.to_string(),
        });
        expected.insert(hash);
    }
    if key_binding
        .transaction_data_hashes
        .iter()
        .any(|hash| !expected.contains(hash))
    {
        return Err(invalid_presentation(
            "key binding confirms transaction data that was not requested",
        ));
    }
    Ok(())
}

impl Verifier {
    /// Verify the wallet's response to a session's authorization request.
    ///
    /// The result is recorded once. A second response to a verified session is rejected
    /// and leaves the session untouched; any other failure moves the session to `Error`.
    #[instrument(skip_all, fields(session = session_id))]
    pub async fn verify_authorization_response(
        &self,
        session_id: &str,
        response: AuthorizationResponse,
        origin: Option<&str>,
    ) -> Result<VerifiedResult> {
        let versioned = self.sessions.get(session_id).await?;
        if versioned.session.state == VerificationState::ResponseVerified {
            return Err(Error::invalid_request("authorization response was already verified"));
        }
        let mut versioned = self.ensure_pending(versioned).await?;

        let outcome = self.verify(&versioned.session, response, origin).await;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => return Err(self.fail(versioned, e).await),
        };
        versioned.session.verified_result = Some(result.clone());
        versioned.session.apply(VerificationEvent::ResponseVerified)?;
        let saved = self.save(versioned).await?;
        self.release_encryption_key(&saved.session).await;
        info!(
            presentations = result.presentations.values().map(Vec::len).sum::<usize>(),
            "verified authorization response"
        );
        Ok(result)
    }

    async fn verify(
        &self,
        session: &VerificationSession,
        response: AuthorizationResponse,
        origin: Option<&str>,
    ) -> Result<VerifiedResult> {
        let request = &session.request;
        let response = if request.response_mode.is_encrypted() {
            let jwe = response.response.as_deref().ok_or_else(|| {
                Error::invalid_request("the response mode requires an encrypted 'response'")
            })?;
            let (_, plaintext) = self
                .trust
                .decrypt_jwe(jwe, session.encryption_key_id.as_deref())
                .await?;
            serde_json::from_slice::<AuthorizationResponse>(&plaintext).map_err(|e| {
                Error::invalid_request(format!("invalid encrypted authorization response: {e}"))
            })?
        } else if response.response.is_some() {
            return Err(Error::invalid_request(
                "encrypted response for a request that did not ask for one",
            ));
        } else {
            response
        };

        if request.response_mode.is_dc_api() {
            let origin = origin
                .ok_or_else(|| Error::invalid_request("the calling origin is required"))?;
            if let Some(expected) = &request.expected_origins {
                if !expected.iter().any(|o| o == origin) {
                    return Err(Error::trust(format!("origin '{origin}' is not expected")));
                }
            }
        } else if response.state != request.state {
            return Err(Error::invalid_request("'state' does not match the request"));
        }

        let vp_token = response
            .vp_token
            .as_ref()
            .ok_or_else(|| Error::invalid_request("'vp_token' is required"))?;
        let submitted = unpack_vp_token(session, vp_token, response.presentation_submission.as_ref())?;

        let audience = key_binding_audience(session.protocol_version, request, origin)?;
        let requested_transaction_data = request
            .transaction_data()
            .iter()
            .map(|encoded| {
                TransactionData::decode(encoded)
                    .map(|entry| (encoded.clone(), entry))
                    .map_err(|e| Error::server(format!("{e:#}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut transaction_data = vec![];
        let mut records: BTreeMap<String, Vec<CredentialRecord>> = BTreeMap::new();
        let mut presentations: BTreeMap<String, Vec<VerifiedCredential>> = BTreeMap::new();
        for (index, submitted) in submitted.into_iter().enumerate() {
            let verified = self
                .codecs
                .get(&submitted.format)?
                .verify_presentation(&self.trust, &self.policy, &submitted.presentation)
                .await?;
            match &verified.key_binding {
                Some(key_binding) => {
                    if key_binding.nonce != request.nonce {
                        return Err(Error::trust("key binding 'nonce' does not match the request"));
                    }
                    if key_binding.audience != audience {
                        return Err(Error::trust(format!(
                            "key binding 'aud' is '{}', expected '{audience}'",
                            key_binding.audience
                        )));
                    }
                }
                None if submitted.holder_binding_required || verified.credential.holder_bound => {
                    return Err(Error::trust(format!(
                        "presentation for '{}' has no key binding",
                        submitted.query_id
                    )))
                }
                None => {}
            }
            confirm_transaction_data(
                &requested_transaction_data,
                &submitted.query_id,
                verified.key_binding.as_ref(),
                &mut transaction_data,
            )?;
            debug!(query = submitted.query_id, format = %submitted.format, "verified presentation");

            presentations
                .entry(submitted.query_id.clone())
                .or_default()
                .push(VerifiedCredential {
                    format: submitted.format,
                    presentation: submitted.presentation.clone(),
                    claims: verified.credential.disclosed_claims.clone(),
                    issuer: verified.credential.issuer.clone(),
                    types: verified.credential.types.clone(),
                });
            records
                .entry(submitted.query_id)
                .or_default()
                .push(CredentialRecord {
                    id: format!("presentation-{index}"),
                    compact: submitted.presentation,
                    credential: verified.credential,
                });
        }

        if let Some((encoded, _)) = requested_transaction_data
            .iter()
            .find(|(encoded, _)| !transaction_data.iter().any(|h| &h.encoded == encoded))
        {
            return Err(invalid_presentation(format!(
                "transaction data entry '{encoded}' was not confirmed"
            )));
        }

        let query_match = match_submission(&session.query, &records)?;
        if !query_match.can_be_satisfied {
            return Err(invalid_presentation(
                "the presentations do not satisfy the requested query",
            ));
        }
        Ok(VerifiedResult {
            presentations,
            query_match,
            transaction_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        trust::JwtSigner,
        utils::{now, NonEmptyVec},
        verifier::ResponseMode,
    };

    fn request(response_mode: ResponseMode, client_id: Option<&str>) -> AuthorizationRequestObject {
        AuthorizationRequestObject {
            response_type: "vp_token".into(),
            response_mode,
            client_id: client_id.map(str::to_string),
            client_id_scheme: None,
            response_uri: None,
            nonce: "n".into(),
            state: None,
            dcql_query: None,
            presentation_definition: None,
            transaction_data: None,
            client_metadata: None,
            expected_origins: None,
        }
    }

    #[test]
    fn audiences() {
        let signed = request(ResponseMode::DcApi, Some("x509_san_dns:verifier.example.com"));
        assert_eq!(
            key_binding_audience(ProtocolVersion::V1, &signed, Some("https://rp.example.com"))
                .unwrap(),
            "x509_san_dns:verifier.example.com"
        );
        let unsigned = request(ResponseMode::DcApi, None);
        assert_eq!(
            key_binding_audience(ProtocolVersion::V1, &unsigned, Some("https://rp.example.com"))
                .unwrap(),
            "origin:https://rp.example.com"
        );
        assert_eq!(
            key_binding_audience(ProtocolVersion::Draft24, &unsigned, Some("https://rp.example.com"))
                .unwrap(),
            "web-origin:https://rp.example.com"
        );
        assert!(key_binding_audience(ProtocolVersion::V1, &unsigned, None).is_err());
    }

    #[test]
    fn form_encoding_keeps_json_tokens() {
        let response = AuthorizationResponse {
            vp_token: Some(json!({ "pid": ["eyJ...~"] })),
            state: Some("s".into()),
            ..Default::default()
        };
        let form = response.to_form().unwrap();
        let parsed =
            AuthorizationResponse::from_form(form.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .unwrap();
        assert_eq!(parsed, response);

        let single = AuthorizationResponse::from_form([("vp_token", "eyJhbGciOi.x.y")]).unwrap();
        assert_eq!(single.vp_token, Some(json!("eyJhbGciOi.x.y")));
    }

    #[test]
    fn transaction_data_must_be_confirmed() {
        let entry = TransactionData::new("payment", NonEmptyVec::new("pid".to_string()));
        let encoded = entry.encode().unwrap();
        let requested = vec![(encoded.clone(), entry)];
        let hash = hash_encoded(&encoded, DEFAULT_HASH_ALG).unwrap();

        let mut confirmed = vec![];
        let good = KeyBindingChallenge {
            nonce: "n".into(),
            audience: "a".into(),
            transaction_data_hashes: vec![hash.clone()],
            transaction_data_hashes_alg: None,
        };
        confirm_transaction_data(&requested, "pid", Some(&good), &mut confirmed).unwrap();
        assert_eq!(confirmed[0].hash, hash);

        // Unrelated queries are not affected.
        confirm_transaction_data(&requested, "other", None, &mut confirmed).unwrap();

        let missing = KeyBindingChallenge {
            transaction_data_hashes: vec![],
            ..good.clone()
        };
        let err = confirm_transaction_data(&requested, "pid", Some(&missing), &mut vec![])
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPresentation));

        let extra = KeyBindingChallenge {
            transaction_data_hashes: vec![hash, "other".into()],
            ..good
        };
        assert!(confirm_transaction_data(&requested, "pid", Some(&extra), &mut vec![]).is_err());
    }

    #[test]
    fn draft24_tokens_carry_one_presentation_per_query() {
        use crate::core::dcql_query::{DcqlCredentialQuery, DcqlQuery};

        let query = DcqlQuery::new(NonEmptyVec::new(DcqlCredentialQuery::new(
            "pid",
            ClaimFormatDesignation::DcSdJwt,
        )));
        let mut session = VerificationSession {
            id: "s".into(),
            verifier_id: "v".into(),
            context_correlation_id: None,
            state: VerificationState::RequestCreated,
            protocol_version: ProtocolVersion::Draft24,
            signer: JwtSigner::None,
            query: CredentialQuery::DcqlQuery(query),
            request: request(ResponseMode::DirectPost, Some("redirect_uri:https://v")),
            request_jwt: None,
            request_uri: None,
            encryption_key_id: None,
            verified_result: None,
            error_message: None,
            created_at: now(),
            expires_at: now(),
        };
        let submitted = unpack_vp_token(&session, &json!({ "pid": "a~b~" }), None).unwrap();
        assert_eq!(submitted[0].presentation, "a~b~");

        session.protocol_version = ProtocolVersion::V1;
        assert!(unpack_vp_token(&session, &json!({ "pid": "a~b~" }), None).is_err());
        let err = unpack_vp_token(&session, &json!({ "pid": ["a~", "b~"] }), None).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPresentation));
    }
}
