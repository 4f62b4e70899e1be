//! DCQL claims path evaluation over a JSON claim tree.
//!
//! Paths are sequences of [ClaimsPathSegment]s. [project] is shared with presentation
//! definitions, whose JSONPath matches are converted to concrete segments.

use serde_json::{Map, Value as Json};

use crate::core::dcql_query::ClaimsPathSegment;

/// A node selected by a path, with the concrete path (no wildcards) that reaches it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected<'a> {
    pub path: Vec<ClaimsPathSegment>,
    pub value: &'a Json,
}

/// Every node of `root` that `path` selects.
///
/// A key on a non-object, an index past the end or a wildcard on a non-array select
/// nothing; selection never fails.
pub fn select<'a>(root: &'a Json, path: &[ClaimsPathSegment]) -> Vec<Selected<'a>> {
    let mut current = vec![Selected {
        path: vec![],
        value: root,
    }];
    for segment in path {
        let mut next = Vec::new();
        for node in current {
            match (segment, node.value) {
                (ClaimsPathSegment::Key(key), Json::Object(object)) => {
                    if let Some(value) = object.get(key) {
                        next.push(node.child(segment.clone(), value));
                    }
                }
                (ClaimsPathSegment::Index(i), Json::Array(array)) => {
                    if let Some(value) = array.get(*i) {
                        next.push(node.child(segment.clone(), value));
                    }
                }
                (ClaimsPathSegment::Wildcard(()), Json::Array(array)) => {
                    for (i, value) in array.iter().enumerate() {
                        next.push(node.child(ClaimsPathSegment::Index(i), value));
                    }
                }
                _ => {}
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

impl<'a> Selected<'a> {
    fn child(&self, segment: ClaimsPathSegment, value: &'a Json) -> Selected<'a> {
        let mut path = self.path.clone();
        path.push(segment);
        Selected { path, value }
    }
}

/// The smallest subtree of `root` containing every concrete path in `paths`.
///
/// Array elements keep their relative order; unselected elements are dropped.
pub fn project(root: &Json, paths: &[Vec<ClaimsPathSegment>]) -> Json {
    if paths.iter().any(Vec::is_empty) {
        return root.clone();
    }
    match root {
        Json::Object(object) => {
            let mut projected = Map::new();
            for (key, value) in object {
                let children: Vec<Vec<ClaimsPathSegment>> = paths
                    .iter()
                    .filter_map(|p| match p.first() {
                        Some(ClaimsPathSegment::Key(k)) if k == key => Some(p[1..].to_vec()),
                        _ => None,
                    })
                    .collect();
                if !children.is_empty() {
                    projected.insert(key.clone(), project(value, &children));
                }
            }
            Json::Object(projected)
        }
        Json::Array(array) => Json::Array(
            array
                .iter()
                .enumerate()
                .filter_map(|(i, value)| {
                    let children: Vec<Vec<ClaimsPathSegment>> = paths
                        .iter()
                        .filter_map(|p| match p.first() {
                            Some(ClaimsPathSegment::Index(j)) if *j == i => Some(p[1..].to_vec()),
                            Some(ClaimsPathSegment::Wildcard(())) => Some(p[1..].to_vec()),
                            _ => None,
                        })
                        .collect();
                    (!children.is_empty()).then(|| project(value, &children))
                })
                .collect(),
        ),
        _ => root.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> ClaimsPathSegment {
        ClaimsPathSegment::Key(k.into())
    }

    #[test]
    fn wildcard_expands_to_concrete_indices() {
        let claims = json!({"nationalities": ["DE", "FR"], "name": "Erika"});
        let selected = select(
            &claims,
            &[key("nationalities"), ClaimsPathSegment::wildcard()],
        );
        assert_eq!(selected.len(), 2);
        assert_eq!(
            selected[1].path,
            vec![key("nationalities"), ClaimsPathSegment::Index(1)]
        );
        assert_eq!(selected[1].value, &json!("FR"));

        assert!(select(&claims, &[key("name"), ClaimsPathSegment::wildcard()]).is_empty());
        assert!(select(&claims, &[key("nationalities"), ClaimsPathSegment::Index(2)]).is_empty());
    }

    #[test]
    fn projection_keeps_only_selected_paths() {
        let claims = json!({
            "name": "Erika",
            "address": {"street": "Heidestrasse", "locality": "Berlin"},
            "degrees": [{"type": "BSc", "year": 2010}, {"type": "MSc", "year": 2012}]
        });
        let projected = project(
            &claims,
            &[
                vec![key("address"), key("locality")],
                vec![key("degrees"), ClaimsPathSegment::Index(1), key("type")],
            ],
        );
        assert_eq!(
            projected,
            json!({"address": {"locality": "Berlin"}, "degrees": [{"type": "MSc"}]})
        );
    }
}
