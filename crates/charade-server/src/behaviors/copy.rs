//! Copy behavior - copy request values into the response.

use super::extraction::ExtractionMethod;
use crate::model::{ResolvedResponse, StatusField};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Copy behavior: extract a value from the request and substitute it for a
/// token in every string field of the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyBehavior {
    /// Request field to copy from
    pub from: CopySource,
    /// Token to replace (e.g. "${NAME}")
    pub into: String,
    /// Extraction method
    #[serde(rename = "using")]
    pub extraction: ExtractionMethod,
}

/// Source of the copied value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopySource {
    /// Top-level field: "path", "method", "body", "data", ...
    Simple(String),
    /// Keyed field: {"query": "id"} or {"headers": "X-Request-Id"}
    Nested(HashMap<String, String>),
}

fn leaf_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl CopySource {
    /// Extract the raw value from the request field view.
    pub fn extract(&self, fields: &Value) -> Option<String> {
        match self {
            CopySource::Simple(field) => fields.get(field).map(leaf_to_string),
            CopySource::Nested(map) => {
                let (section, key) = map.iter().next()?;
                let section = fields.get(section)?.as_object()?;
                // header and query keys match case-insensitively
                section
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| leaf_to_string(v))
            }
        }
    }
}

fn substitute_value(value: &mut Value, token: &str, replacement: &str) {
    match value {
        Value::String(s) => {
            if s.contains(token) {
                *s = s.replace(token, replacement);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, token, replacement);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value(item, token, replacement);
            }
        }
        _ => {}
    }
}

/// Replace `token` in every string field of the response: body, headers,
/// data, and the status code when it was configured as a string.
pub fn substitute_response(response: &mut ResolvedResponse, token: &str, replacement: &str) {
    if let Some(body) = response.body.as_mut() {
        substitute_value(body, token, replacement);
    }
    for value in response.headers.values_mut() {
        substitute_value(value, token, replacement);
    }
    if let Some(data) = response.data.as_mut() {
        if data.contains(token) {
            *data = data.replace(token, replacement);
        }
    }
    if let StatusField::Text(text) = &mut response.status {
        if text.contains(token) {
            *text = text.replace(token, replacement);
        }
    }
}

/// Apply one copy behavior. `match_cursor` is the per-stub iterator over
/// multiple extraction matches: each triggering request takes the next match.
pub fn apply_copy(
    response: &mut ResolvedResponse,
    behavior: &CopyBehavior,
    request_fields: &Value,
    match_cursor: &mut usize,
) {
    let replacement = match behavior.from.extract(request_fields) {
        Some(source) => {
            let matches = behavior.extraction.extract_all(&source);
            if matches.is_empty() {
                String::new()
            } else {
                let picked = matches[*match_cursor % matches.len()].clone();
                *match_cursor += 1;
                picked
            }
        }
        None => String::new(),
    };
    substitute_response(response, &behavior.into, &replacement);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Value {
        json!({
            "method": "GET",
            "path": "/users/123",
            "query": {"name": "Alice"},
            "headers": {"X-Request-Id": "abc-1"},
            "body": "id=7;id=8;id=9"
        })
    }

    #[test]
    fn test_copy_source_simple() {
        let source = CopySource::Simple("path".to_string());
        assert_eq!(source.extract(&request()), Some("/users/123".to_string()));
    }

    #[test]
    fn test_copy_source_nested_case_insensitive() {
        let mut map = HashMap::new();
        map.insert("headers".to_string(), "x-request-id".to_string());
        let source = CopySource::Nested(map);
        assert_eq!(source.extract(&request()), Some("abc-1".to_string()));
    }

    #[test]
    fn test_apply_copy_substitutes_everywhere() {
        let behavior = CopyBehavior {
            from: CopySource::Simple("path".to_string()),
            into: "${ID}".to_string(),
            extraction: ExtractionMethod::Regex {
                selector: r"/users/(\d+)".to_string(),
            },
        };
        let mut response = ResolvedResponse {
            body: Some(json!({"user": "${ID}"})),
            ..Default::default()
        };
        response
            .headers
            .insert("Location".to_string(), json!("/users/${ID}"));

        let mut cursor = 0;
        apply_copy(&mut response, &behavior, &request(), &mut cursor);
        assert_eq!(response.body, Some(json!({"user": "123"})));
        assert_eq!(response.headers.get("Location"), Some(&json!("/users/123")));
    }

    #[test]
    fn test_apply_copy_iterates_matches_across_requests() {
        let behavior = CopyBehavior {
            from: CopySource::Simple("body".to_string()),
            into: "${ID}".to_string(),
            extraction: ExtractionMethod::Regex {
                selector: r"id=(\d)".to_string(),
            },
        };
        let mut cursor = 0;
        let mut picked = Vec::new();
        for _ in 0..4 {
            let mut response = ResolvedResponse {
                body: Some(json!("${ID}")),
                ..Default::default()
            };
            apply_copy(&mut response, &behavior, &request(), &mut cursor);
            picked.push(response.body_text());
        }
        assert_eq!(picked, vec!["7", "8", "9", "7"]);
    }

    #[test]
    fn test_missing_source_blanks_token() {
        let behavior = CopyBehavior {
            from: CopySource::Simple("nonexistent".to_string()),
            into: "${GONE}".to_string(),
            extraction: ExtractionMethod::Regex {
                selector: ".*".to_string(),
            },
        };
        let mut response = ResolvedResponse {
            body: Some(json!("value: ${GONE}!")),
            ..Default::default()
        };
        let mut cursor = 0;
        apply_copy(&mut response, &behavior, &request(), &mut cursor);
        assert_eq!(response.body_text(), "value: !");
    }

    #[test]
    fn test_status_token_substitution() {
        let behavior = CopyBehavior {
            from: CopySource::Simple("path".to_string()),
            into: "${CODE}".to_string(),
            extraction: ExtractionMethod::Regex {
                selector: r"(\d+)".to_string(),
            },
        };
        let mut response = ResolvedResponse {
            status: StatusField::Text("${CODE}".to_string()),
            ..Default::default()
        };
        let mut cursor = 0;
        apply_copy(
            &mut response,
            &behavior,
            &json!({"path": "/status/418"}),
            &mut cursor,
        );
        assert_eq!(response.status_code(), 418);
    }
}
