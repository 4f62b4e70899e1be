use std::collections::{BTreeMap, HashMap};

use serde_json::Value as Json;
use tracing::debug;

use super::{
    claims_path::{project, select},
    CandidateMatch, CredentialQueryMatch, CredentialRecord, CredentialSetMatch, QueryMatch,
};
use crate::core::{
    credential_format::ClaimFormatDesignation,
    dcql_query::{
        ClaimsPathSegment, DcqlClaimsQuery, DcqlCredentialQuery, DcqlQuery, TrustedAuthorityType,
    },
};

pub(super) fn match_dcql(query: &DcqlQuery, credentials: &[CredentialRecord]) -> QueryMatch {
    let matches = query
        .credentials()
        .iter()
        .map(|credential_query| match_credential_query(credential_query, credentials))
        .collect();
    combine(query, matches)
}

/// Match presentations received under each credential query id. Every presentation must
/// satisfy its own query, and only `multiple` queries accept more than one.
pub(super) fn match_dcql_submission(
    query: &DcqlQuery,
    submitted: &BTreeMap<String, Vec<CredentialRecord>>,
) -> QueryMatch {
    let matches = query
        .credentials()
        .iter()
        .map(|credential_query| {
            let records = submitted
                .get(credential_query.id())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let candidates: Vec<CandidateMatch> = records
                .iter()
                .filter_map(|record| match_candidate(credential_query, record))
                .collect();
            let success = !records.is_empty()
                && candidates.len() == records.len()
                && (credential_query.multiple() || records.len() == 1);
            if !records.is_empty() && !success {
                debug!(
                    query = credential_query.id(),
                    "submitted presentations do not satisfy query"
                );
            }
            CredentialQueryMatch {
                id: credential_query.id().to_string(),
                success,
                multiple: credential_query.multiple(),
                candidates: if success { candidates } else { vec![] },
            }
        })
        .collect();
    combine(query, matches)
}

fn combine(query: &DcqlQuery, matches: Vec<CredentialQueryMatch>) -> QueryMatch {
    let succeeded: HashMap<&str, bool> = matches
        .iter()
        .map(|m| (m.id.as_str(), m.success))
        .collect();

    let (can_be_satisfied, credential_sets) = match query.credential_sets() {
        None => (matches.iter().all(|m| m.success), None),
        Some(sets) => {
            let sets: Vec<CredentialSetMatch> = sets
                .iter()
                .map(|set| CredentialSetMatch {
                    required: set.is_required(),
                    satisfied_option: set
                        .options()
                        .iter()
                        .find(|option| {
                            option
                                .iter()
                                .all(|id| succeeded.get(id.as_str()).copied().unwrap_or(false))
                        })
                        .cloned(),
                })
                .collect();
            let satisfied = sets
                .iter()
                .all(|set| !set.required || set.satisfied_option.is_some());
            (satisfied, Some(sets))
        }
    };

    QueryMatch {
        can_be_satisfied,
        credentials: matches,
        credential_sets,
    }
}

fn match_credential_query(
    query: &DcqlCredentialQuery,
    credentials: &[CredentialRecord],
) -> CredentialQueryMatch {
    let mut candidates = Vec::new();
    for record in credentials {
        match match_candidate(query, record) {
            Some(candidate) => {
                candidates.push(candidate);
                if !query.multiple() {
                    break;
                }
            }
            None => debug!(
                query = query.id(),
                credential = record.id,
                "credential does not satisfy query"
            ),
        }
    }
    CredentialQueryMatch {
        id: query.id().to_string(),
        success: !candidates.is_empty(),
        multiple: query.multiple(),
        candidates,
    }
}

fn match_candidate(query: &DcqlCredentialQuery, record: &CredentialRecord) -> Option<CandidateMatch> {
    let credential = &record.credential;
    if !query.format().accepts(&credential.format) {
        return None;
    }
    if !meta_matches(query, &credential.types) {
        return None;
    }
    if !trusted_authorities_match(query, record) {
        return None;
    }
    if query.require_cryptographic_holder_binding() && !credential.holder_bound {
        return None;
    }

    let claims_tree = &credential.disclosed_claims;
    let Some(claims) = query.claims() else {
        return Some(CandidateMatch {
            credential_id: record.id.clone(),
            claim_set: None,
            paths: vec![],
            disclosed: credential.claims.clone(),
        });
    };

    let (claim_set, paths) = match query.claim_sets() {
        None => {
            let mut paths = Vec::new();
            for claim in claims.iter() {
                paths.extend(match_claim(claim, claims_tree)?);
            }
            (None, paths)
        }
        Some(claim_sets) => {
            // First fully satisfied set wins, later sets are not considered.
            claim_sets.iter().enumerate().find_map(|(index, set)| {
                let mut paths = Vec::new();
                for claim_id in set {
                    let claim = claims.iter().find(|c| c.id() == Some(claim_id.as_str()))?;
                    paths.extend(match_claim(claim, claims_tree)?);
                }
                Some((Some(index), paths))
            })?
        }
    };

    Some(CandidateMatch {
        credential_id: record.id.clone(),
        claim_set,
        disclosed: project(claims_tree, &paths),
        paths,
    })
}

/// Concrete paths selected by `claim`, `None` if nothing (or no allowed value) is found.
fn match_claim(claim: &DcqlClaimsQuery, claims: &Json) -> Option<Vec<Vec<ClaimsPathSegment>>> {
    let selected: Vec<Vec<ClaimsPathSegment>> = select(claims, claim.path())
        .into_iter()
        .filter(|node| match claim.values() {
            Some(values) => values.iter().any(|v| v.matches(node.value)),
            None => true,
        })
        .map(|node| node.path)
        .collect();
    (!selected.is_empty()).then_some(selected)
}

fn meta_matches(query: &DcqlCredentialQuery, types: &[String]) -> bool {
    let has = |t: &str| types.iter().any(|own| own == t);
    match query.format() {
        ClaimFormatDesignation::JwtVcJson
        | ClaimFormatDesignation::JwtVcJsonLd
        | ClaimFormatDesignation::LdpVc => match query.meta().get("type_values") {
            // Every type of at least one alternative must be present.
            Some(Json::Array(alternatives)) => alternatives.iter().any(|alternative| {
                alternative
                    .as_array()
                    .is_some_and(|all| all.iter().all(|t| t.as_str().is_some_and(has)))
            }),
            _ => true,
        },
        _ => match query.type_values() {
            Some(accepted) => accepted.into_iter().any(has),
            None => true,
        },
    }
}

fn trusted_authorities_match(query: &DcqlCredentialQuery, record: &CredentialRecord) -> bool {
    let Some(authorities) = query.trusted_authorities() else {
        return true;
    };
    authorities.iter().any(|authority| {
        let known = match authority.authority_type() {
            TrustedAuthorityType::Aki => &record.credential.issuer_key_identifiers,
            TrustedAuthorityType::OpenidFederation => {
                &record.credential.issuer_federation_entity_ids
            }
            other => {
                debug!("trusted authority type {other:?} is not supported");
                return false;
            }
        };
        authority.values().iter().any(|value| known.contains(value))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query::test_records::record;

    fn pid(id: &str, claims: Json) -> CredentialRecord {
        record(id, ClaimFormatDesignation::DcSdJwt, &["https://example.com/pid"], claims)
    }

    fn query(value: Json) -> DcqlQuery {
        let query: DcqlQuery = serde_json::from_value(value).unwrap();
        query.validate().unwrap();
        query
    }

    #[test]
    fn first_satisfied_claim_set_wins() {
        let q = query(json!({
            "credentials": [{
                "id": "pid",
                "format": "dc+sd-jwt",
                "meta": {"vct_values": ["https://example.com/pid"]},
                "claims": [
                    {"id": "a", "path": ["given_name"]},
                    {"id": "b", "path": ["address", "street_address"]},
                    {"id": "c", "path": ["nationalities", null]}
                ],
                "claim_sets": [["a", "b"], ["c"], ["a"]]
            }]
        }));
        let credentials = [pid(
            "one",
            json!({"given_name": "Erika", "nationalities": ["DE", "FR"]}),
        )];
        let result = match_dcql(&q, &credentials);
        assert!(result.can_be_satisfied);
        let candidate = &result.credentials[0].candidates[0];
        assert_eq!(candidate.claim_set, Some(1));
        assert_eq!(candidate.disclosed, json!({"nationalities": ["DE", "FR"]}));
    }

    #[test]
    fn multiple_collects_every_match() {
        let credentials = [
            pid("one", json!({"given_name": "Erika"})),
            pid("two", json!({"family_name": "Mustermann"})),
            pid("three", json!({"given_name": "Max"})),
        ];
        let single = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt", "claims": [{"path": ["given_name"]}]
        }]}));
        let result = match_dcql(&single, &credentials);
        assert_eq!(result.credentials[0].candidates.len(), 1);
        assert_eq!(result.credentials[0].candidates[0].credential_id, "one");

        let multiple = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt", "multiple": true,
            "claims": [{"path": ["given_name"]}]
        }]}));
        let result = match_dcql(&multiple, &credentials);
        let ids: Vec<&str> = result.credentials[0]
            .candidates
            .iter()
            .map(|c| c.credential_id.as_str())
            .collect();
        assert_eq!(ids, vec!["one", "three"]);
    }

    #[test]
    fn values_meta_and_trusted_authorities() {
        let credentials = [pid("one", json!({"age_over_18": true}))];
        let mismatched_value = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt",
            "claims": [{"path": ["age_over_18"], "values": [false]}]
        }]}));
        assert!(!match_dcql(&mismatched_value, &credentials).can_be_satisfied);

        let other_vct = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt", "meta": {"vct_values": ["https://example.com/other"]}
        }]}));
        assert!(!match_dcql(&other_vct, &credentials).can_be_satisfied);

        let aki = query(json!({"credentials": [{
            "id": "pid", "format": "vc+sd-jwt",
            "trusted_authorities": [{"type": "aki", "values": ["aki-1"]}]
        }]}));
        assert!(match_dcql(&aki, &credentials).can_be_satisfied);

        let federation = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt",
            "trusted_authorities": [{"type": "openid_federation", "values": ["https://anchor.example.com"]}]
        }]}));
        assert!(!match_dcql(&federation, &credentials).can_be_satisfied);
    }

    #[test]
    fn submission_is_matched_per_query_id() {
        let q = query(json!({"credentials": [{
            "id": "pid", "format": "dc+sd-jwt", "claims": [{"path": ["given_name"]}]
        }]}));
        let one = BTreeMap::from([(
            "pid".to_string(),
            vec![pid("one", json!({"given_name": "Erika"}))],
        )]);
        assert!(match_dcql_submission(&q, &one).can_be_satisfied);

        let two = BTreeMap::from([(
            "pid".to_string(),
            vec![
                pid("one", json!({"given_name": "Erika"})),
                pid("two", json!({"given_name": "Max"})),
            ],
        )]);
        assert!(!match_dcql_submission(&q, &two).can_be_satisfied);

        let missing_claim = BTreeMap::from([(
            "pid".to_string(),
            vec![pid("one", json!({"family_name": "Mustermann"}))],
        )]);
        assert!(!match_dcql_submission(&q, &missing_claim).can_be_satisfied);
    }

    #[test]
    fn credential_sets_decide_satisfiability() {
        let credentials = [pid("one", json!({"given_name": "Erika"}))];
        let q = query(json!({
            "credentials": [
                {"id": "pid", "format": "dc+sd-jwt"},
                {"id": "mdl", "format": "mso_mdoc", "meta": {"doctype_value": "org.iso.18013.5.1.mDL"}}
            ],
            "credential_sets": [
                {"options": [["mdl"], ["pid"]]},
                {"options": [["mdl"]], "required": false}
            ]
        }));
        let result = match_dcql(&q, &credentials);
        assert!(result.can_be_satisfied);
        let sets = result.credential_sets.unwrap();
        assert_eq!(sets[0].satisfied_option, Some(vec!["pid".to_string()]));
        assert_eq!(sets[1].satisfied_option, None);
        assert!(!result.credentials[1].success);
    }
}
