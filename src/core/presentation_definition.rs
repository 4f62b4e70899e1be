use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::credential_format::ClaimFormatDesignation;
use crate::utils::NonEmptyVec;

/// A JSONPath (RFC 9535) expression selecting a value inside a credential, parsed with
/// [serde_json_path::JsonPath] when the field is evaluated.
pub type JsonPath = String;

/// A presentation definition describes the information a verifier requires of a holder.
///
/// See: <https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-definition>
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PresentationDefinition {
    id: String,
    input_descriptors: Vec<InputDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Map<String, Json>>,
}

impl PresentationDefinition {
    pub fn new(id: impl Into<String>, input_descriptor: InputDescriptor) -> Self {
        Self {
            id: id.into(),
            input_descriptors: vec![input_descriptor],
            name: None,
            purpose: None,
            format: None,
        }
    }

    pub fn add_input_descriptor(mut self, input_descriptor: InputDescriptor) -> Self {
        self.input_descriptors.push(input_descriptor);
        self
    }

    pub fn set_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_descriptors(&self) -> &[InputDescriptor] {
        &self.input_descriptors
    }

    pub fn input_descriptor(&self, id: &str) -> Option<&InputDescriptor> {
        self.input_descriptors.iter().find(|d| d.id == id)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn purpose(&self) -> Option<&str> {
        self.purpose.as_deref()
    }

    /// Formats accepted for every descriptor that does not declare its own.
    pub fn format_designations(&self) -> HashSet<ClaimFormatDesignation> {
        self.format
            .iter()
            .flat_map(|f| f.keys())
            .map(|k| ClaimFormatDesignation::from(k.as_str()))
            .collect()
    }

    /// Rejects duplicate descriptor ids and filters that are not valid JSON schemas.
    pub fn validate(&self) -> Result<()> {
        if self.input_descriptors.is_empty() {
            bail!("presentation definition '{}' has no input descriptors", self.id)
        }
        let mut ids = HashSet::new();
        for descriptor in &self.input_descriptors {
            if !ids.insert(descriptor.id.as_str()) {
                bail!("duplicate input descriptor id '{}'", descriptor.id)
            }
            for field in &descriptor.constraints.fields {
                if let Some(Err(e)) = field.validator() {
                    bail!(
                        "input descriptor '{}' has an invalid filter: {e}",
                        descriptor.id
                    )
                }
            }
        }
        Ok(())
    }
}

/// Describes one credential the verifier requires.
///
/// See: <https://identity.foundation/presentation-exchange/spec/v2.0.0/#input-descriptor-object>
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InputDescriptor {
    id: String,
    #[serde(default)]
    constraints: Constraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    format: Map<String, Json>,
}

impl InputDescriptor {
    pub fn new(id: impl Into<String>, constraints: Constraints) -> Self {
        Self {
            id: id.into(),
            constraints,
            ..Default::default()
        }
    }

    pub fn set_format(mut self, format: ClaimFormatDesignation, params: Json) -> Self {
        self.format.insert(format.to_string(), params);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn purpose(&self) -> Option<&str> {
        self.purpose.as_deref()
    }

    /// Formats this descriptor accepts; empty means "as the definition says".
    pub fn format_designations(&self) -> HashSet<ClaimFormatDesignation> {
        self.format
            .keys()
            .map(|k| ClaimFormatDesignation::from(k.as_str()))
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<ConstraintsField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_disclosure: Option<ConstraintsLimitDisclosure>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(mut self, field: ConstraintsField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn set_limit_disclosure(mut self, limit_disclosure: ConstraintsLimitDisclosure) -> Self {
        self.limit_disclosure = Some(limit_disclosure);
        self
    }

    pub fn fields(&self) -> &[ConstraintsField] {
        &self.fields
    }

    pub fn limit_disclosure(&self) -> Option<ConstraintsLimitDisclosure> {
        self.limit_disclosure
    }

    /// Whether only the selected fields may be released.
    pub fn limits_disclosure(&self) -> bool {
        self.limit_disclosure == Some(ConstraintsLimitDisclosure::Required)
    }
}

/// See: <https://identity.foundation/presentation-exchange/spec/v2.0.0/#limited-disclosure-submissions>
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintsLimitDisclosure {
    Required,
    Preferred,
}

/// A field constraint: a list of alternative JSONPaths and an optional JSON schema filter
/// the selected value has to satisfy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConstraintsField {
    path: NonEmptyVec<JsonPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    intent_to_retain: bool,
}

impl ConstraintsField {
    pub fn new(path: impl Into<JsonPath>) -> Self {
        Self {
            path: NonEmptyVec::new(path.into()),
            id: None,
            name: None,
            filter: None,
            optional: None,
            intent_to_retain: false,
        }
    }

    pub fn add_path(mut self, path: impl Into<JsonPath>) -> Self {
        self.path.push(path.into());
        self
    }

    pub fn set_filter(mut self, filter: Json) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn set_optional(mut self, optional: bool) -> Self {
        self.optional = Some(optional);
        self
    }

    pub fn path(&self) -> &NonEmptyVec<JsonPath> {
        &self.path
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn filter(&self) -> Option<&Json> {
        self.filter.as_ref()
    }

    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }

    pub fn intent_to_retain(&self) -> bool {
        self.intent_to_retain
    }

    /// Compile the filter into a JSON schema validator, `None` if there is no filter.
    pub fn validator(&self) -> Option<Result<JSONSchema>> {
        self.filter.as_ref().map(|filter| {
            JSONSchema::compile(filter)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("filter is not a valid JSON schema")
        })
    }
}
