//! Predicate evaluation over the neutral request's field view.

use super::{Predicate, PredicateOperator};
use crate::behaviors::{extract_jsonpath_all, extract_xpath_all};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use tracing::warn;

/// Hook for evaluating `inject` predicates; errors are runtime-script
/// failures for the whole request.
pub type InjectFn<'a> = dyn FnMut(&str) -> Result<bool, String> + 'a;

#[derive(Clone, Copy)]
enum StringOp {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

struct MatchOptions<'a> {
    case_sensitive: bool,
    except: Option<&'a str>,
    jsonpath: Option<&'a str>,
    xpath: Option<&'a str>,
}

impl<'a> MatchOptions<'a> {
    fn from(predicate: &'a Predicate) -> Self {
        Self {
            case_sensitive: predicate.case_sensitive.unwrap_or(false),
            except: predicate.except.as_deref().filter(|s| !s.is_empty()),
            jsonpath: predicate.jsonpath.as_ref().map(|s| s.selector.as_str()),
            xpath: predicate.xpath.as_ref().map(|s| s.selector.as_str()),
        }
    }

    fn apply_except(&self, value: &str) -> String {
        if let Some(pattern) = self.except {
            if let Ok(re) = regex::Regex::new(pattern) {
                return re.replace_all(value, "").into_owned();
            }
        }
        value.to_string()
    }

    fn fold(&self, value: &str) -> String {
        if self.case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        }
    }

    fn keys_match(&self, expected: &str, actual: &str) -> bool {
        if self.case_sensitive {
            expected == actual
        } else {
            expected.eq_ignore_ascii_case(actual)
        }
    }
}

/// True iff every predicate in the list matches (implicit AND); an empty
/// list matches everything.
pub fn predicates_match(
    predicates: &[Predicate],
    fields: &Value,
    inject: &mut InjectFn,
) -> Result<bool, String> {
    for predicate in predicates {
        if !predicate_matches(predicate, fields, inject)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a single predicate tree.
pub fn predicate_matches(
    predicate: &Predicate,
    fields: &Value,
    inject: &mut InjectFn,
) -> Result<bool, String> {
    let opts = MatchOptions::from(predicate);
    match &predicate.operator {
        PredicateOperator::And(children) => {
            for child in children {
                if !predicate_matches(child, fields, inject)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        PredicateOperator::Or(children) => {
            for child in children {
                if predicate_matches(child, fields, inject)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        PredicateOperator::Not(inner) => Ok(!predicate_matches(inner, fields, inject)?),
        PredicateOperator::Inject(script) => inject(script),
        PredicateOperator::Equals(spec) => check_fields(spec, fields, &opts, StringOp::Equals),
        PredicateOperator::Contains(spec) => check_fields(spec, fields, &opts, StringOp::Contains),
        PredicateOperator::StartsWith(spec) => {
            check_fields(spec, fields, &opts, StringOp::StartsWith)
        }
        PredicateOperator::EndsWith(spec) => check_fields(spec, fields, &opts, StringOp::EndsWith),
        PredicateOperator::Matches(spec) => check_fields(spec, fields, &opts, StringOp::Matches),
        PredicateOperator::DeepEquals(spec) => {
            for (field, expected) in spec {
                let actual = resolve_field(fields, field, &opts);
                if !deep_equals(expected, &actual, &opts) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        PredicateOperator::Exists(spec) => {
            for (field, expected) in spec {
                let actual = resolve_field(fields, field, &opts);
                if !check_exists(expected, &actual, &opts) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

fn check_fields(
    spec: &Map<String, Value>,
    fields: &Value,
    opts: &MatchOptions,
    op: StringOp,
) -> Result<bool, String> {
    for (field, expected) in spec {
        let actual = resolve_field(fields, field, opts);
        if !match_value(expected, &actual, opts, op) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolve a dotted field path against the request view. Header and query
/// keys are looked up case-insensitively unless the predicate is
/// case-sensitive; a string encountered mid-path is parsed as JSON so body
/// selectors can traverse parsed bodies.
fn resolve_field(fields: &Value, path: &str, opts: &MatchOptions) -> Value {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Value::Null;
    };

    let mut current = lookup_key(fields, first, opts);

    // jsonpath/xpath parameters pre-extract the body before any comparison
    if first == "body" {
        if let Some(selector) = opts.jsonpath {
            let body = value_to_string(&current);
            let extracted = extract_jsonpath_all(&body, selector);
            current = match extracted.len() {
                0 => Value::Null,
                1 => Value::String(extracted.into_iter().next().unwrap_or_default()),
                _ => Value::Array(extracted.into_iter().map(Value::String).collect()),
            };
        } else if let Some(selector) = opts.xpath {
            let body = value_to_string(&current);
            let extracted = extract_xpath_all(&body, selector);
            current = match extracted.len() {
                0 => Value::Null,
                1 => Value::String(extracted.into_iter().next().unwrap_or_default()),
                _ => Value::Array(extracted.into_iter().map(Value::String).collect()),
            };
        }
    }

    for segment in segments {
        if let Value::String(text) = &current {
            current = serde_json::from_str(text).unwrap_or(Value::Null);
        }
        current = lookup_key(&current, segment, opts);
    }
    current
}

fn lookup_key(value: &Value, key: &str, opts: &MatchOptions) -> Value {
    match value {
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| opts.keys_match(key, k))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare an expected value to an actual value under a string operator.
/// Object expectations recurse per key; array expectations compare
/// element-wise; a scalar expectation against a multi-valued actual matches
/// if any element matches.
fn match_value(expected: &Value, actual: &Value, opts: &MatchOptions, op: StringOp) -> bool {
    match expected {
        Value::Object(expected_map) => {
            // parse string bodies when the expectation is structural
            let parsed;
            let actual = match actual {
                Value::String(text) => {
                    parsed = serde_json::from_str(text).unwrap_or(Value::Null);
                    &parsed
                }
                other => other,
            };
            let Value::Object(actual_map) = actual else {
                return false;
            };
            expected_map.iter().all(|(key, expected_value)| {
                let actual_value = actual_map
                    .iter()
                    .find(|(k, _)| opts.keys_match(key, k))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                match_value(expected_value, &actual_value, opts, op)
            })
        }
        Value::Array(expected_items) => {
            let Value::Array(actual_items) = actual else {
                return false;
            };
            expected_items.len() == actual_items.len()
                && expected_items
                    .iter()
                    .zip(actual_items)
                    .all(|(e, a)| match_value(e, a, opts, op))
        }
        scalar => match actual {
            Value::Array(actual_items) => actual_items
                .iter()
                .any(|item| match_value(scalar, item, opts, op)),
            _ => compare_strings(&value_to_string(scalar), &value_to_string(actual), opts, op),
        },
    }
}

fn compare_strings(expected: &str, actual: &str, opts: &MatchOptions, op: StringOp) -> bool {
    let actual = opts.apply_except(actual);
    if let StringOp::Matches = op {
        let Ok(re) = RegexBuilder::new(expected)
            .case_insensitive(!opts.case_sensitive)
            .build()
        else {
            warn!(pattern = expected, "invalid matches pattern");
            return false;
        };
        return re.is_match(&actual);
    }

    let expected = opts.fold(expected);
    let actual = opts.fold(&actual);
    match op {
        StringOp::Equals => expected == actual,
        StringOp::Contains => actual.contains(&expected),
        StringOp::StartsWith => actual.starts_with(&expected),
        StringOp::EndsWith => actual.ends_with(&expected),
        StringOp::Matches => unreachable!("handled above"),
    }
}

/// Structural equality with key-set equality for objects and significant
/// array order. Scalars compare as folded strings so `1` equals `"1"`.
fn deep_equals(expected: &Value, actual: &Value, opts: &MatchOptions) -> bool {
    match expected {
        Value::Object(expected_map) => {
            let parsed;
            let actual = match actual {
                Value::String(text) => {
                    parsed = serde_json::from_str(text).unwrap_or(Value::Null);
                    &parsed
                }
                other => other,
            };
            let Value::Object(actual_map) = actual else {
                return false;
            };
            if expected_map.len() != actual_map.len() {
                return false;
            }
            expected_map.iter().all(|(key, expected_value)| {
                actual_map
                    .iter()
                    .find(|(k, _)| opts.keys_match(key, k))
                    .map(|(_, actual_value)| deep_equals(expected_value, actual_value, opts))
                    .unwrap_or(false)
            })
        }
        Value::Array(expected_items) => {
            let Value::Array(actual_items) = actual else {
                return false;
            };
            expected_items.len() == actual_items.len()
                && expected_items
                    .iter()
                    .zip(actual_items)
                    .all(|(e, a)| deep_equals(e, a, opts))
        }
        scalar => compare_strings(
            &value_to_string(scalar),
            &value_to_string(actual),
            opts,
            StringOp::Equals,
        ),
    }
}

/// `exists` checks presence: a boolean expectation tests whether the field
/// resolves to a non-empty value; object expectations drill further in.
fn check_exists(expected: &Value, actual: &Value, opts: &MatchOptions) -> bool {
    match expected {
        Value::Bool(should_exist) => {
            let exists = match actual {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            };
            exists == *should_exist
        }
        Value::Object(expected_map) => expected_map.iter().all(|(key, inner)| {
            let next = lookup_key(actual, key, opts);
            check_exists(inner, &next, opts)
        }),
        _ => false,
    }
}
