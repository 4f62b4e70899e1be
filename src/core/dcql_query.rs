use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{core::credential_format::ClaimFormatDesignation, utils::NonEmptyVec};

/// A Digital Credentials Query.
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlQuery {
    credentials: NonEmptyVec<DcqlCredentialQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_sets: Option<NonEmptyVec<DcqlCredentialSetQuery>>,
}

impl DcqlQuery {
    pub fn new(credentials: NonEmptyVec<DcqlCredentialQuery>) -> Self {
        Self {
            credentials,
            credential_sets: None,
        }
    }

    pub fn with_credential_sets(mut self, sets: NonEmptyVec<DcqlCredentialSetQuery>) -> Self {
        self.credential_sets = Some(sets);
        self
    }

    pub fn credentials(&self) -> &[DcqlCredentialQuery] {
        &self.credentials
    }

    pub fn credential_sets(&self) -> Option<&NonEmptyVec<DcqlCredentialSetQuery>> {
        self.credential_sets.as_ref()
    }

    pub fn credential(&self, id: &str) -> Option<&DcqlCredentialQuery> {
        self.credentials.iter().find(|c| c.id == id)
    }

    /// Checks the structural rules that serde cannot express: unique ids, claim sets that
    /// only reference declared claim ids, and credential sets that only reference declared
    /// credential queries.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for credential in self.credentials.iter() {
            if !credential
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                bail!("credential query id '{}' has invalid characters", credential.id)
            }
            if !ids.insert(credential.id.as_str()) {
                bail!("duplicate credential query id '{}'", credential.id)
            }
            credential.validate()?;
        }

        for set in self.credential_sets.iter().flat_map(|s| s.iter()) {
            for option in set.options.iter() {
                if let Some(unknown) = option.iter().find(|id| !ids.contains(id.as_str())) {
                    bail!("credential set references unknown credential query '{unknown}'")
                }
            }
        }

        Ok(())
    }
}

/// A Credential Query object.
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.1>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlCredentialQuery {
    /// Identifies the credential in the response. Unique within the query.
    id: String,
    format: ClaimFormatDesignation,
    /// Format specific constraints such as `vct_values` or `doctype_value`.
    #[serde(default)]
    meta: Map<String, Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<NonEmptyVec<DcqlClaimsQuery>>,
    /// Alternative combinations of claim ids, in order of preference.
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_sets: Option<NonEmptyVec<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trusted_authorities: Option<NonEmptyVec<TrustedAuthoritiesQuery>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    require_cryptographic_holder_binding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multiple: Option<bool>,
}

impl DcqlCredentialQuery {
    pub fn new(id: impl Into<String>, format: ClaimFormatDesignation) -> Self {
        Self {
            id: id.into(),
            format,
            meta: Map::new(),
            claims: None,
            claim_sets: None,
            trusted_authorities: None,
            require_cryptographic_holder_binding: None,
            multiple: None,
        }
    }

    pub fn with_meta(mut self, key: &str, value: Json) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    pub fn with_claims(mut self, claims: NonEmptyVec<DcqlClaimsQuery>) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn with_claim_sets(mut self, claim_sets: NonEmptyVec<Vec<String>>) -> Self {
        self.claim_sets = Some(claim_sets);
        self
    }

    pub fn with_trusted_authorities(
        mut self,
        trusted_authorities: NonEmptyVec<TrustedAuthoritiesQuery>,
    ) -> Self {
        self.trusted_authorities = Some(trusted_authorities);
        self
    }

    pub fn with_multiple(mut self, multiple: bool) -> Self {
        self.multiple = Some(multiple);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &ClaimFormatDesignation {
        &self.format
    }

    pub fn meta(&self) -> &Map<String, Json> {
        &self.meta
    }

    pub fn claims(&self) -> Option<&NonEmptyVec<DcqlClaimsQuery>> {
        self.claims.as_ref()
    }

    pub fn claim_sets(&self) -> Option<&NonEmptyVec<Vec<String>>> {
        self.claim_sets.as_ref()
    }

    pub fn trusted_authorities(&self) -> Option<&NonEmptyVec<TrustedAuthoritiesQuery>> {
        self.trusted_authorities.as_ref()
    }

    /// Defaults to `true` when absent.
    pub fn require_cryptographic_holder_binding(&self) -> bool {
        self.require_cryptographic_holder_binding.unwrap_or(true)
    }

    /// Defaults to `false` when absent.
    pub fn multiple(&self) -> bool {
        self.multiple.unwrap_or(false)
    }

    /// Accepted credential types, read from the format specific meta key.
    ///
    /// `None` means the query does not constrain the type.
    pub fn type_values(&self) -> Option<Vec<&str>> {
        let key = self.format.type_meta_key()?;
        match self.meta.get(key)? {
            Json::String(single) => Some(vec![single.as_str()]),
            Json::Array(values) => Some(values.iter().filter_map(Json::as_str).collect()),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let Some(claim_sets) = &self.claim_sets else {
            return Ok(());
        };
        let Some(claims) = &self.claims else {
            bail!("credential query '{}' has claim_sets without claims", self.id)
        };
        let claim_ids: HashSet<&str> = claims.iter().filter_map(|c| c.id.as_deref()).collect();
        if claim_ids.len() != claims.len() {
            bail!(
                "credential query '{}' uses claim_sets, every claim needs a unique id",
                self.id
            )
        }
        for set in claim_sets.iter() {
            if let Some(unknown) = set.iter().find(|id| !claim_ids.contains(id.as_str())) {
                bail!(
                    "claim set of credential query '{}' references unknown claim '{unknown}'",
                    self.id
                )
            }
        }
        Ok(())
    }
}

/// Expected trust frameworks of the credential issuer.
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.1.1>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TrustedAuthoritiesQuery {
    #[serde(rename = "type")]
    authority_type: TrustedAuthorityType,
    values: NonEmptyVec<String>,
}

impl TrustedAuthoritiesQuery {
    pub fn new(authority_type: TrustedAuthorityType, values: NonEmptyVec<String>) -> Self {
        Self {
            authority_type,
            values,
        }
    }

    pub fn authority_type(&self) -> &TrustedAuthorityType {
        &self.authority_type
    }

    pub fn values(&self) -> &NonEmptyVec<String> {
        &self.values
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustedAuthorityType {
    /// Base64url KeyIdentifier of an X.509 AuthorityKeyIdentifier.
    Aki,
    EtsiTl,
    /// Entity identifier of an OpenID Federation trust anchor.
    OpenidFederation,
    #[serde(untagged)]
    Other(String),
}

/// A Credential Set Query object.
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.2>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlCredentialSetQuery {
    options: NonEmptyVec<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<bool>,
}

impl DcqlCredentialSetQuery {
    pub fn new(options: NonEmptyVec<Vec<String>>) -> Self {
        Self {
            options,
            required: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = Some(false);
        self
    }

    pub fn options(&self) -> &NonEmptyVec<Vec<String>> {
        &self.options
    }

    /// Defaults to `true` when absent.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// A Claims Query object.
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.3>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlClaimsQuery {
    /// Required when the enclosing credential query declares `claim_sets`.
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    path: NonEmptyVec<ClaimsPathSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<NonEmptyVec<DcqlClaimValue>>,
    /// mdoc only, mirrors `IntentToRetain` of ISO 18013-5.
    #[serde(skip_serializing_if = "Option::is_none")]
    intent_to_retain: Option<bool>,
}

impl DcqlClaimsQuery {
    pub fn new(path: NonEmptyVec<ClaimsPathSegment>) -> Self {
        Self {
            id: None,
            path,
            values: None,
            intent_to_retain: None,
        }
    }

    /// Shorthand for a path made only of object keys.
    pub fn keys(keys: &[&str]) -> Result<Self> {
        let path = keys
            .iter()
            .map(|k| ClaimsPathSegment::Key(k.to_string()))
            .collect::<Vec<_>>()
            .try_into()?;
        Ok(Self::new(path))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_values(mut self, values: NonEmptyVec<DcqlClaimValue>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn path(&self) -> &[ClaimsPathSegment] {
        &self.path
    }

    pub fn values(&self) -> Option<&NonEmptyVec<DcqlClaimValue>> {
        self.values.as_ref()
    }

    pub fn intent_to_retain(&self) -> Option<bool> {
        self.intent_to_retain
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DcqlClaimValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl DcqlClaimValue {
    pub fn matches(&self, value: &Json) -> bool {
        match (self, value) {
            (Self::String(expected), Json::String(actual)) => expected == actual,
            (Self::Integer(expected), Json::Number(actual)) => actual.as_i64() == Some(*expected),
            (Self::Boolean(expected), Json::Bool(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// One element of a claims path pointer.
///
/// A string selects an object key, a non-negative integer selects an array element and
/// `null` selects every element of an array.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ClaimsPathSegment {
    Key(String),
    Index(usize),
    Wildcard(()),
}

impl ClaimsPathSegment {
    pub fn wildcard() -> Self {
        Self::Wildcard(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn pid_query() -> Json {
        json!({
          "credentials": [
            {
              "id": "pid",
              "format": "dc+sd-jwt",
              "meta": { "vct_values": ["https://example.com/pid"] },
              "claims": [
                { "id": "a", "path": ["given_name"] },
                { "id": "b", "path": ["address", "street_address"] },
                { "id": "c", "path": ["nationalities", null] }
              ],
              "claim_sets": [["a", "b"], ["c"]]
            },
            {
              "id": "mdl",
              "format": "mso_mdoc",
              "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
              "claims": [
                { "path": ["org.iso.18013.5.1", "given_name"], "intent_to_retain": false }
              ]
            }
          ],
          "credential_sets": [
            { "options": [["pid"], ["mdl"]] }
          ]
        })
    }

    #[test]
    fn parse_and_validate() {
        let query: DcqlQuery = serde_json::from_value(pid_query()).unwrap();
        query.validate().unwrap();

        let pid = query.credential("pid").unwrap();
        assert_eq!(pid.type_values(), Some(vec!["https://example.com/pid"]));
        assert_eq!(
            pid.claims().unwrap()[2].path(),
            &[
                ClaimsPathSegment::Key("nationalities".into()),
                ClaimsPathSegment::wildcard()
            ]
        );
        assert!(query.credential_sets().unwrap()[0].is_required());

        let mdl = query.credential("mdl").unwrap();
        assert_eq!(mdl.type_values(), Some(vec!["org.iso.18013.5.1.mDL"]));
        assert!(!mdl.multiple());
        assert!(mdl.require_cryptographic_holder_binding());

        assert_eq!(serde_json::to_value(&query).unwrap(), pid_query());
    }

    #[test]
    fn claim_sets_must_reference_claim_ids() {
        let mut value = pid_query();
        value["credentials"][0]["claim_sets"] = json!([["a", "z"]]);
        let query: DcqlQuery = serde_json::from_value(value).unwrap();
        let err = query.validate().unwrap_err().to_string();
        assert!(err.contains("unknown claim 'z'"), "{err}");
    }

    #[test]
    fn credential_sets_must_reference_queries() {
        let mut value = pid_query();
        value["credential_sets"] = json!([{ "options": [["passport"]] }]);
        let query: DcqlQuery = serde_json::from_value(value).unwrap();
        assert!(query.validate().is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let query = DcqlQuery::new(
            vec![
                DcqlCredentialQuery::new("x", ClaimFormatDesignation::DcSdJwt),
                DcqlCredentialQuery::new("x", ClaimFormatDesignation::MsoMDoc),
            ]
            .try_into()
            .unwrap(),
        );
        assert!(query.validate().is_err());
    }

    #[test]
    fn claim_values_compare_by_type() {
        assert!(DcqlClaimValue::Integer(42).matches(&json!(42)));
        assert!(!DcqlClaimValue::String("42".into()).matches(&json!(42)));
        assert!(DcqlClaimValue::Boolean(true).matches(&json!(true)));
    }

    #[test]
    fn empty_credentials_are_rejected() {
        assert!(serde_json::from_value::<DcqlQuery>(json!({ "credentials": [] })).is_err());
    }
}
