use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use serde_json_path::JsonPath;

use super::credential_format::ClaimFormatDesignation;

/// Expresses how the presentations in a `vp_token` map onto the input descriptors of a
/// [PresentationDefinition](super::presentation_definition::PresentationDefinition).
///
/// See: <https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-submission>
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationSubmission {
    id: String,
    definition_id: String,
    descriptor_map: Vec<DescriptorMap>,
}

impl PresentationSubmission {
    pub fn new(definition_id: impl Into<String>, descriptor_map: Vec<DescriptorMap>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition_id.into(),
            descriptor_map,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn descriptor_map(&self) -> &[DescriptorMap] {
        &self.descriptor_map
    }
}

/// Locates the presentation for one input descriptor inside the `vp_token`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptorMap {
    id: String,
    format: ClaimFormatDesignation,
    /// `$` when the `vp_token` is a single presentation, `$[n]` when it is an array.
    path: JsonPath,
}

impl DescriptorMap {
    pub fn new(id: impl Into<String>, format: ClaimFormatDesignation, path: JsonPath) -> Self {
        Self {
            id: id.into(),
            format,
            path,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &ClaimFormatDesignation {
        &self.format
    }

    pub fn path(&self) -> &JsonPath {
        &self.path
    }

    /// The single presentation in `vp_token` this entry points to.
    pub fn select<'a>(&self, vp_token: &'a Json) -> anyhow::Result<&'a Json> {
        self.path
            .query(vp_token)
            .exactly_one()
            .map_err(|e| anyhow::anyhow!("descriptor map path '{}': {e}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_paths() {
        let submission: PresentationSubmission = serde_json::from_value(json!({
            "id": "s",
            "definition_id": "d",
            "descriptor_map": [
                { "id": "a", "format": "vc+sd-jwt", "path": "$" },
                { "id": "b", "format": "mso_mdoc", "path": "$[1]" },
                { "id": "c", "format": "vc+sd-jwt", "path": "$.presentations[?@.kind == 'pid'].token" },
                { "id": "d", "format": "mso_mdoc", "path": "$[*]" }
            ]
        }))
        .unwrap();
        let map = submission.descriptor_map();

        let single = json!("eyJ.single");
        assert_eq!(map[0].select(&single).unwrap(), &single);

        let array = json!(["first", "second"]);
        assert_eq!(map[1].select(&array).unwrap(), "second");
        assert!(map[1].select(&single).is_err());
        assert!(map[3].select(&array).is_err());

        let nested = json!({"presentations": [
            {"kind": "mdl", "token": "m"},
            {"kind": "pid", "token": "p"}
        ]});
        assert_eq!(map[2].select(&nested).unwrap(), "p");
    }

    #[test]
    fn invalid_descriptor_path_is_rejected() {
        assert!(serde_json::from_value::<DescriptorMap>(json!({
            "id": "a", "format": "vc+sd-jwt", "path": "$[unterminated"
        }))
        .is_err());
    }
}
