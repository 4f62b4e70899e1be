use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::QueryMatch;
use crate::{
    core::dcql_query::ClaimsPathSegment,
    error::{Error, Result},
};

/// Credentials chosen to answer one credential query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSelection {
    pub query_id: String,
    pub credentials: Vec<SelectedCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedCredential {
    pub credential_id: String,
    pub paths: Vec<Vec<ClaimsPathSegment>>,
    pub disclosed: Json,
}

/// Pick the credentials to present for a satisfiable match: the first candidate of each
/// query, or all of them for `multiple` queries.
///
/// With credential sets, only the queries of the first satisfied option of each set are
/// answered; unsatisfied optional sets are skipped.
pub fn select_credentials(query_match: &QueryMatch) -> Result<Vec<CredentialSelection>> {
    if !query_match.can_be_satisfied {
        let missing: Vec<&str> = query_match
            .credentials
            .iter()
            .filter(|c| !c.success)
            .map(|c| c.id.as_str())
            .collect();
        return Err(Error::invalid_request(format!(
            "the credential query cannot be satisfied, no credentials for {missing:?}"
        )));
    }

    let wanted: Vec<&str> = match &query_match.credential_sets {
        None => query_match.credentials.iter().map(|c| c.id.as_str()).collect(),
        Some(sets) => {
            let mut wanted: Vec<&str> = Vec::new();
            for id in sets
                .iter()
                .filter_map(|set| set.satisfied_option.as_ref())
                .flatten()
            {
                if !wanted.contains(&id.as_str()) {
                    wanted.push(id);
                }
            }
            wanted
        }
    };

    wanted
        .into_iter()
        .map(|id| {
            let credential_match = query_match
                .credential(id)
                .ok_or_else(|| Error::invalid_request(format!("unknown credential query '{id}'")))?;
            let take = if credential_match.multiple {
                credential_match.candidates.len()
            } else {
                1
            };
            Ok(CredentialSelection {
                query_id: id.to_string(),
                credentials: credential_match
                    .candidates
                    .iter()
                    .take(take)
                    .map(|candidate| SelectedCredential {
                        credential_id: candidate.credential_id.clone(),
                        paths: candidate.paths.clone(),
                        disclosed: candidate.disclosed.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        core::{credential_format::ClaimFormatDesignation, dcql_query::DcqlQuery},
        query::{match_query, test_records::record, CredentialQuery},
    };

    #[test]
    fn selection_follows_credential_sets() {
        let credentials = [
            record("pid-1", ClaimFormatDesignation::DcSdJwt, &["pid"], json!({"name": "Erika"})),
            record("pid-2", ClaimFormatDesignation::DcSdJwt, &["pid"], json!({"name": "Max"})),
            record("mdl", ClaimFormatDesignation::MsoMDoc, &["mDL"], json!({})),
        ];
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [
                {"id": "pid", "format": "dc+sd-jwt", "multiple": true, "claims": [{"path": ["name"]}]},
                {"id": "mdl", "format": "mso_mdoc", "meta": {"doctype_value": "mDL"}},
                {"id": "photo", "format": "jwt_vc_json"}
            ],
            "credential_sets": [
                {"options": [["pid"]]},
                {"options": [["photo"], ["mdl"]], "required": false}
            ]
        }))
        .unwrap();
        let result = match_query(&CredentialQuery::DcqlQuery(query), &credentials).unwrap();
        let selection = select_credentials(&result).unwrap();

        assert_eq!(selection.len(), 2);
        assert_eq!(selection[0].query_id, "pid");
        assert_eq!(selection[0].credentials.len(), 2);
        assert_eq!(selection[1].query_id, "mdl");
        assert_eq!(selection[1].credentials.len(), 1);
        // Selecting does not alter the match.
        assert_eq!(result.credential("pid").unwrap().candidates.len(), 2);
    }

    #[test]
    fn unsatisfiable_match_is_a_client_error() {
        let query: DcqlQuery = serde_json::from_value(json!({
            "credentials": [{"id": "pid", "format": "dc+sd-jwt"}]
        }))
        .unwrap();
        let result = match_query(&CredentialQuery::DcqlQuery(query), &[]).unwrap();
        let err = select_credentials(&result).unwrap_err();
        assert!(err.is_client());
        assert!(err.to_string().contains("pid"));
    }
}
