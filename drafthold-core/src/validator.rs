/*!
Structural validation of diagram documents.

Validation runs over the JSON shape rather than the typed [`Document`] so the
same checks apply to documents handed in by the editor and to bytes read back
from storage. Errors block persistence; warnings (dangling connection
endpoints, usually a transient desync with concurrent edits) never do.
*/

use crate::model::Document;
use crate::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Outcome of validating one document
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validate a typed document
pub fn validate_document(document: &Document) -> Result<ValidationReport> {
    let value = serde_json::to_value(document)?;
    Ok(validate(&value))
}

/// Validate the JSON shape of a document
pub fn validate(document: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(object) = document.as_object() else {
        errors.push("document must be an object".to_string());
        return ValidationReport::finish(errors, warnings);
    };

    if non_empty_str(object, "id").is_none() {
        errors.push("document id must be a non-empty string".to_string());
    }

    let components = object.get("components").and_then(Value::as_array);
    let connections = object.get("connections").and_then(Value::as_array);
    if components.is_none() {
        errors.push("components must be an array".to_string());
    }
    if connections.is_none() {
        errors.push("connections must be an array".to_string());
    }
    let (Some(components), Some(connections)) = (components, connections) else {
        return ValidationReport::finish(errors, warnings);
    };

    let mut component_ids = HashSet::new();
    for (index, component) in components.iter().enumerate() {
        let Some(fields) = component.as_object() else {
            errors.push(format!("component {index}: must be an object"));
            continue;
        };

        let id = non_empty_str(fields, "id");
        let mut problems = Vec::new();
        if id.is_none() {
            problems.push("missing id");
        }
        if non_empty_str(fields, "type").is_none() {
            problems.push("missing type");
        }
        let position = fields.get("position").and_then(Value::as_object);
        let numeric = |axis: &str| position.and_then(|p| p.get(axis)).is_some_and(Value::is_number);
        if !numeric("x") || !numeric("y") {
            problems.push("non-numeric position");
        }

        if let Some(id) = id {
            component_ids.insert(id);
        }
        if !problems.is_empty() {
            errors.push(format!(
                "component {index} ({}): {}",
                id.unwrap_or("?"),
                problems.join(", ")
            ));
        }
    }

    let mut endpoints = Vec::new();
    for (index, connection) in connections.iter().enumerate() {
        let Some(fields) = connection.as_object() else {
            errors.push(format!("connection {index}: must be an object"));
            continue;
        };

        let id = non_empty_str(fields, "id");
        let source = non_empty_str(fields, "source");
        let target = non_empty_str(fields, "target");

        let mut problems = Vec::new();
        if id.is_none() {
            problems.push("missing id");
        }
        if source.is_none() {
            problems.push("missing source");
        }
        if target.is_none() {
            problems.push("missing target");
        }

        if problems.is_empty() {
            endpoints.push((id.unwrap_or_default(), source, target));
        } else {
            errors.push(format!(
                "connection {index} ({}): {}",
                id.unwrap_or("?"),
                problems.join(", ")
            ));
        }
    }

    for (id, source, target) in endpoints {
        let missing: Vec<&str> = [source, target]
            .into_iter()
            .flatten()
            .filter(|endpoint| !component_ids.contains(endpoint))
            .collect();
        if !missing.is_empty() {
            warnings.push(format!(
                "connection {id} references unknown component(s): {}",
                missing.join(", ")
            ));
        }
    }

    ValidationReport::finish(errors, warnings)
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, Connection};
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "doc",
            "components": [
                {"id": "a", "type": "service", "position": {"x": 0, "y": 0}},
                {"id": "b", "type": "database", "position": {"x": 10.5, "y": -3}}
            ],
            "connections": [
                {"id": "c1", "source": "a", "target": "b", "type": "reads"}
            ]
        })
    }

    #[test]
    fn test_valid_document() {
        let report = validate(&sample());
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_dangling_connection_is_a_warning() {
        let mut doc = sample();
        doc["connections"][0]["target"] = json!("ghost");

        let report = validate(&doc);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("ghost"));
    }

    #[test]
    fn test_component_without_id_is_an_error() {
        let mut doc = sample();
        doc["components"][0].as_object_mut().unwrap().remove("id");

        let report = validate(&doc);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("missing id"));
    }

    #[test]
    fn test_one_error_per_offending_component() {
        let mut doc = sample();
        doc["components"][1] = json!({"id": "b", "type": "", "position": {"x": "1", "y": 2}});

        let report = validate(&doc);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("missing type"));
        assert!(report.errors[0].contains("non-numeric position"));
    }

    #[test]
    fn test_connection_missing_endpoint_is_an_error() {
        let mut doc = sample();
        doc["connections"][0].as_object_mut().unwrap().remove("source");

        let report = validate(&doc);
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("missing source"));
        // no endpoint warning for a connection that already failed
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_shape_errors() {
        assert!(!validate(&json!([])).is_valid);

        let report = validate(&json!({"id": "doc", "components": {}, "connections": null}));
        assert_eq!(
            report.errors,
            vec![
                "components must be an array".to_string(),
                "connections must be an array".to_string()
            ]
        );
    }

    #[test]
    fn test_validate_typed_document() {
        let doc = Document::new("doc")
            .with_component(Component::new("a", "service", 1.0, 2.0))
            .with_connection(Connection::new("c", "a", "missing", "uses"));

        let report = validate_document(&doc).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }
}
