//! Credential query resolution: matching a DCQL query or presentation definition against
//! the holder's credentials and selecting what to present.
//!
//! Stored credentials are never modified; matches carry disclosure-limited projections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{
    codec::{CodecRegistry, DecodedCredential},
    core::{
        credential_format::ClaimFormatDesignation, dcql_query::ClaimsPathSegment,
        dcql_query::DcqlQuery, presentation_definition::PresentationDefinition,
    },
    error::{Error, ErrorCode, Result},
};

pub mod claims_path;
mod dcql;
mod pex;
mod select;

pub use select::{select_credentials, CredentialSelection, SelectedCredential};

/// The query of an authorization request, exactly one of the two languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialQuery {
    DcqlQuery(DcqlQuery),
    PresentationDefinition(PresentationDefinition),
}

impl CredentialQuery {
    pub fn validate(&self) -> Result<()> {
        match self {
            CredentialQuery::DcqlQuery(query) => query.validate(),
            CredentialQuery::PresentationDefinition(definition) => definition.validate(),
        }
        .map_err(|e| Error::invalid_request(format!("invalid credential query: {e:#}")))
    }

    /// Ids responses are keyed by: credential query ids or input descriptor ids.
    pub fn ids(&self) -> Vec<&str> {
        match self {
            CredentialQuery::DcqlQuery(query) => {
                query.credentials().iter().map(|c| c.id()).collect()
            }
            CredentialQuery::PresentationDefinition(definition) => definition
                .input_descriptors()
                .iter()
                .map(|d| d.id())
                .collect(),
        }
    }
}

/// A holder credential available to the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub compact: String,
    pub credential: DecodedCredential,
}

impl CredentialRecord {
    pub fn decode(
        id: impl Into<String>,
        format: &ClaimFormatDesignation,
        compact: impl Into<String>,
        codecs: &CodecRegistry,
    ) -> Result<Self> {
        let compact = compact.into();
        let credential = codecs.get(format)?.decode(&compact)?;
        Ok(Self {
            id: id.into(),
            compact,
            credential,
        })
    }
}

/// Result of [match_query].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub can_be_satisfied: bool,
    pub credentials: Vec<CredentialQueryMatch>,
    /// Present when the DCQL query declares `credential_sets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_sets: Option<Vec<CredentialSetMatch>>,
}

impl QueryMatch {
    pub fn credential(&self, id: &str) -> Option<&CredentialQueryMatch> {
        self.credentials.iter().find(|c| c.id == id)
    }
}

/// Match result of one credential query (or input descriptor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialQueryMatch {
    pub id: String,
    pub success: bool,
    pub multiple: bool,
    /// The first satisfying credential, or every one when `multiple` is set.
    pub candidates: Vec<CandidateMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub credential_id: String,
    /// Index of the claim set that was satisfied, if the query declares claim sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_set: Option<usize>,
    /// Concrete paths to disclose. An empty path discloses everything.
    pub paths: Vec<Vec<ClaimsPathSegment>>,
    pub disclosed: Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSetMatch {
    pub required: bool,
    /// First option whose credential queries all succeeded.
    pub satisfied_option: Option<Vec<String>>,
}

/// Match `query` against `credentials`.
#[tracing::instrument(skip_all, fields(credentials = credentials.len()))]
pub fn match_query(query: &CredentialQuery, credentials: &[CredentialRecord]) -> Result<QueryMatch> {
    query.validate()?;
    match query {
        CredentialQuery::DcqlQuery(query) => Ok(dcql::match_dcql(query, credentials)),
        CredentialQuery::PresentationDefinition(definition) => {
            pex::match_definition(definition, credentials)
        }
    }
}

/// Match received presentations, keyed by the credential query or input descriptor id
/// they were submitted under, against the `query` of the authorization request.
#[tracing::instrument(skip_all)]
pub fn match_submission(
    query: &CredentialQuery,
    submitted: &BTreeMap<String, Vec<CredentialRecord>>,
) -> Result<QueryMatch> {
    let known = query.ids();
    if let Some(unknown) = submitted.keys().find(|id| !known.contains(&id.as_str())) {
        return Err(Error::client(
            ErrorCode::InvalidPresentation,
            format!("presentation submitted for unknown query '{unknown}'"),
        ));
    }
    match query {
        CredentialQuery::DcqlQuery(query) => Ok(dcql::match_dcql_submission(query, submitted)),
        CredentialQuery::PresentationDefinition(definition) => {
            pex::match_definition_submission(definition, submitted)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_records {
    use serde_json::json;

    use super::*;

    pub fn record(id: &str, format: ClaimFormatDesignation, types: &[&str], claims: Json) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            compact: format!("compact-{id}"),
            credential: DecodedCredential {
                format,
                claims: json!({}),
                disclosed_claims: claims,
                types: types.iter().map(|t| t.to_string()).collect(),
                issuer: Some("https://issuer.example.com".into()),
                issuer_key_identifiers: vec!["aki-1".into()],
                issuer_federation_entity_ids: vec![],
                holder_bound: true,
            },
        }
    }
}
