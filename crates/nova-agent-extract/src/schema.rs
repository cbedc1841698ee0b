use jsonschema::JSONSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::FallbackReason;

#[must_use]
pub fn task_candidates_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "assignee": {"type": ["string", "null"]},
                "description": {"type": "string", "minLength": 1, "pattern": "\\S"},
                "due_date": {"type": ["string", "null"]},
                "priority": {"type": ["integer", "null"], "minimum": 1, "maximum": 10},
                "effort_tag": {"enum": ["small", "medium", "large", null]},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "is_blocked": {"type": "boolean"},
                "blocker_reason": {"type": ["string", "null"]}
            },
            "required": ["description", "confidence", "is_blocked"]
        }
    })
}

#[must_use]
pub fn dependencies_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "dependencies": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "depends_on": {"type": "string"}
                    },
                    "required": ["from", "depends_on"]
                }
            }
        },
        "required": ["dependencies"]
    })
}

#[must_use]
pub fn estimate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reach": {"type": "integer", "minimum": 0},
            "impact": {"type": "integer", "minimum": 1, "maximum": 10},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "effort": {"type": "integer", "minimum": 1}
        },
        "required": ["reach", "impact", "confidence", "effort"]
    })
}

#[must_use]
pub fn assistant_action_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {"type": "string"},
            "payload": {"type": "object"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "explanation": {"type": "string"}
        },
        "required": ["action", "explanation"]
    })
}

/// Removes a surrounding markdown code fence, with or without a `json` tag.
#[must_use]
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Validates `instance` against `schema`, collecting every violation.
///
/// # Errors
/// Returns the violation messages, or a single message when the schema
/// itself does not compile.
pub fn validate_against(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let compiled =
        JSONSchema::compile(schema).map_err(|err| vec![format!("invalid schema: {err}")])?;
    if let Err(errors) = compiled.validate(instance) {
        let messages: Vec<String> = errors.map(|err| err.to_string()).collect();
        return Err(messages);
    }
    Ok(())
}

/// Turns raw oracle text into a typed payload: strip fences, parse JSON,
/// check the schema, then deserialize.
///
/// # Errors
/// Returns the [`FallbackReason`] describing the first stage that failed.
pub fn parse_and_validate<T: DeserializeOwned>(
    raw: &str,
    schema: &Value,
) -> Result<T, FallbackReason> {
    let cleaned = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|err| FallbackReason::MalformedOutput {
            message: format!("oracle output is not JSON: {err}"),
        })?;

    validate_against(schema, &value).map_err(|errors| FallbackReason::SchemaViolation { errors })?;

    T::deserialize(&value).map_err(|err| FallbackReason::MalformedOutput {
        message: format!("oracle output does not match payload type: {err}"),
    })
}
