//! Stub synthesis from live upstream responses.

use super::UpstreamResponse;
use crate::imposter::{PredicateGenerator, ProxyConfig, Stub, StubResponse};
use crate::model::{IsResponse, ResponseMode, StatusField};
use crate::predicate::Predicate;
use serde_json::{json, Map, Value};

fn apply_except(value: &str, except: Option<&str>) -> String {
    if let Some(pattern) = except {
        if let Ok(re) = regex::Regex::new(pattern) {
            return re.replace_all(value, "").into_owned();
        }
    }
    value.to_string()
}

fn copy_scalar(fields: &Value, field: &str, except: Option<&str>) -> Option<Value> {
    match fields.get(field)? {
        Value::String(s) => Some(Value::String(apply_except(s, except))),
        other => Some(other.clone()),
    }
}

/// Copy the sub-keys of a map field selected by a generator: `true` copies
/// the whole map, an object of booleans copies the named keys.
fn copy_map_field(fields: &Value, field: &str, selection: &Value) -> Option<Value> {
    let source = fields.get(field)?.as_object()?;
    match selection {
        Value::Bool(true) => Some(Value::Object(source.clone())),
        Value::Object(keys) => {
            let mut copied = Map::new();
            for (key, wanted) in keys {
                if !wanted.as_bool().unwrap_or(false) {
                    continue;
                }
                if let Some((name, value)) =
                    source.iter().find(|(k, _)| k.eq_ignore_ascii_case(key))
                {
                    copied.insert(name.clone(), value.clone());
                }
            }
            if copied.is_empty() {
                None
            } else {
                Some(Value::Object(copied))
            }
        }
        _ => None,
    }
}

/// Build predicates from the live request per the proxy's
/// `predicateGenerators`: each generator's `matches` selects request fields
/// to copy into an `equals` predicate.
pub fn generate_predicates(generators: &[PredicateGenerator], fields: &Value) -> Vec<Predicate> {
    let mut predicates = Vec::new();

    for generator in generators {
        let except = generator.except.as_deref();
        let mut copied = Map::new();

        for (field, selection) in &generator.matches {
            match field.as_str() {
                "query" | "headers" => {
                    if let Some(value) = copy_map_field(fields, field, selection) {
                        copied.insert(field.clone(), value);
                    }
                }
                name => {
                    if selection.as_bool().unwrap_or(false) {
                        if let Some(value) = copy_scalar(fields, name, except) {
                            copied.insert(name.to_string(), value);
                        }
                    }
                }
            }
        }

        if !copied.is_empty() {
            predicates.push(Predicate::equals(copied, generator.case_sensitive));
        }
    }

    predicates
}

fn upstream_body(upstream: &UpstreamResponse) -> Option<Value> {
    let body = upstream.body.as_ref()?;
    // store JSON bodies structurally when the origin declared them as such
    let is_json = upstream
        .headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type")
                && value.as_str().is_some_and(|v| v.contains("json"))
        });
    if is_json {
        if let Some(text) = body.as_str() {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                return Some(parsed);
            }
        }
    }
    Some(body.clone())
}

/// Turn an upstream response into a replayable stub: generated predicates
/// plus a literal `is` response, with an optional wait behavior carrying the
/// observed latency.
pub fn recorded_stub(
    proxy: &ProxyConfig,
    fields: &Value,
    upstream: &UpstreamResponse,
) -> Stub {
    let is = IsResponse {
        status_code: Some(StatusField::Code(upstream.status)),
        headers: upstream.headers.clone().into_iter().collect(),
        body: upstream_body(upstream),
        data: upstream.data.clone(),
        mode: match upstream.mode {
            ResponseMode::Text => None,
            ResponseMode::Binary => Some(ResponseMode::Binary),
        },
    };

    let behaviors = proxy
        .add_wait_behavior
        .then(|| json!([{"wait": upstream.latency_ms}]));

    Stub {
        predicates: generate_predicates(&proxy.predicate_generators, fields),
        responses: vec![StubResponse {
            is: Some(is),
            behaviors,
            ..Default::default()
        }],
    }
}
