use std::collections::BTreeMap;

use jsonschema::JSONSchema;
use serde_json::Value as Json;
use serde_json_path::{JsonPath, NormalizedPath, PathElement};
use tracing::debug;

use super::{
    claims_path::project, CandidateMatch, CredentialQueryMatch, CredentialRecord, QueryMatch,
};
use crate::{
    core::{
        dcql_query::ClaimsPathSegment,
        presentation_definition::{ConstraintsField, InputDescriptor, PresentationDefinition},
    },
    error::{Error, Result},
};

/// A constraint field with its paths parsed and filter compiled.
struct CompiledField<'a> {
    field: &'a ConstraintsField,
    paths: Vec<JsonPath>,
    filter: Option<JSONSchema>,
}

impl<'a> CompiledField<'a> {
    fn compile(field: &'a ConstraintsField) -> Result<Self> {
        let paths = field
            .path()
            .iter()
            .map(|p| {
                JsonPath::parse(p)
                    .map_err(|e| Error::invalid_request(format!("invalid field path '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let filter = field
            .validator()
            .transpose()
            .map_err(|e| Error::invalid_request(format!("{e:#}")))?;
        Ok(Self {
            field,
            paths,
            filter,
        })
    }

    /// The concrete path of the first node that passes the filter. Paths are tried in
    /// order.
    fn evaluate(&self, claims: &Json) -> Option<Vec<ClaimsPathSegment>> {
        self.paths.iter().find_map(|path| {
            path.query_located(claims)
                .into_iter()
                .find(|node| match &self.filter {
                    Some(filter) => filter.is_valid(node.node()),
                    None => true,
                })
                .map(|node| concrete_path(node.location()))
        })
    }
}

fn concrete_path(location: &NormalizedPath) -> Vec<ClaimsPathSegment> {
    location
        .iter()
        .map(|element| match element {
            PathElement::Name(name) => ClaimsPathSegment::Key(name.to_string()),
            PathElement::Index(index) => ClaimsPathSegment::Index(*index),
        })
        .collect()
}

pub(super) fn match_definition(
    definition: &PresentationDefinition,
    credentials: &[CredentialRecord],
) -> Result<QueryMatch> {
    let matches = definition
        .input_descriptors()
        .iter()
        .map(|descriptor| match_descriptor(definition, descriptor, credentials))
        .collect::<Result<Vec<_>>>()?;
    Ok(QueryMatch {
        can_be_satisfied: matches.iter().all(|m| m.success),
        credentials: matches,
        credential_sets: None,
    })
}

/// Match presentations received under each input descriptor id, one per descriptor.
pub(super) fn match_definition_submission(
    definition: &PresentationDefinition,
    submitted: &BTreeMap<String, Vec<CredentialRecord>>,
) -> Result<QueryMatch> {
    let matches = definition
        .input_descriptors()
        .iter()
        .map(|descriptor| {
            let records = submitted
                .get(descriptor.id())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut matched = match_descriptor(definition, descriptor, records)?;
            if records.len() != 1 {
                matched.success = false;
                matched.candidates.clear();
            }
            Ok(matched)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(QueryMatch {
        can_be_satisfied: matches.iter().all(|m| m.success),
        credentials: matches,
        credential_sets: None,
    })
}

fn match_descriptor(
    definition: &PresentationDefinition,
    descriptor: &InputDescriptor,
    credentials: &[CredentialRecord],
) -> Result<CredentialQueryMatch> {
    let fields = descriptor
        .constraints()
        .fields()
        .iter()
        .map(CompiledField::compile)
        .collect::<Result<Vec<_>>>()?;
    let mut formats = descriptor.format_designations();
    if formats.is_empty() {
        formats = definition.format_designations();
    }

    let candidate = credentials.iter().find_map(|record| {
        let credential = &record.credential;
        if !formats.is_empty() && !formats.iter().any(|f| f.accepts(&credential.format)) {
            debug!(
                descriptor = descriptor.id(),
                credential = record.id,
                "format not accepted"
            );
            return None;
        }
        let claims = &credential.disclosed_claims;
        let mut paths = Vec::new();
        for field in &fields {
            match field.evaluate(claims) {
                Some(path) => paths.push(path),
                None if field.field.is_optional() => {}
                None => {
                    debug!(
                        descriptor = descriptor.id(),
                        credential = record.id,
                        "required field not satisfied"
                    );
                    return None;
                }
            }
        }
        if !descriptor.constraints().limits_disclosure() {
            paths = vec![vec![]];
        }
        Some(CandidateMatch {
            credential_id: record.id.clone(),
            claim_set: None,
            disclosed: project(claims, &paths),
            paths,
        })
    });

    Ok(CredentialQueryMatch {
        id: descriptor.id().to_string(),
        success: candidate.is_some(),
        multiple: false,
        candidates: candidate.into_iter().collect(),
    })
}
