//! Parsing of the `_behaviors` field into an ordered behavior list.

use super::copy::CopyBehavior;
use super::lookup::LookupBehavior;
use super::wait::WaitBehavior;
use serde_json::Value;

/// One behavior in application order.
#[derive(Debug, Clone)]
pub enum Behavior {
    Wait(WaitBehavior),
    Decorate(String),
    Copy(CopyBehavior),
    Lookup(LookupBehavior),
    /// Parsed but never executed; the pipeline records a non-fatal error
    /// and continues with the pre-behavior response.
    ShellTransform(Value),
}

/// The parsed `_behaviors` of one stub response: the ordered entries plus
/// the `repeat` count (default 1) that drives response cycling.
#[derive(Debug, Clone, Default)]
pub struct BehaviorList {
    pub entries: Vec<Behavior>,
    pub repeat: Option<u32>,
}

impl BehaviorList {
    pub fn repeat(&self) -> u32 {
        self.repeat.unwrap_or(1).max(1)
    }
}

fn push_entry(list: &mut BehaviorList, key: &str, value: &Value) -> Result<(), String> {
    match key {
        "wait" => {
            let wait: WaitBehavior = serde_json::from_value(value.clone())
                .map_err(|e| format!("malformed wait behavior: {e}"))?;
            list.entries.push(Behavior::Wait(wait));
        }
        "decorate" => {
            let script = value
                .as_str()
                .ok_or_else(|| "decorate behavior must be a script string".to_string())?;
            list.entries.push(Behavior::Decorate(script.to_string()));
        }
        "copy" => {
            for item in value_as_list(value) {
                let copy: CopyBehavior = serde_json::from_value(item.clone())
                    .map_err(|e| format!("malformed copy behavior: {e}"))?;
                list.entries.push(Behavior::Copy(copy));
            }
        }
        "lookup" => {
            for item in value_as_list(value) {
                let lookup: LookupBehavior = serde_json::from_value(item.clone())
                    .map_err(|e| format!("malformed lookup behavior: {e}"))?;
                list.entries.push(Behavior::Lookup(lookup));
            }
        }
        "repeat" => {
            let repeat = value
                .as_u64()
                .filter(|r| *r >= 1)
                .ok_or_else(|| "repeat must be a positive integer".to_string())?;
            list.repeat = Some(repeat as u32);
        }
        "shellTransform" => {
            list.entries.push(Behavior::ShellTransform(value.clone()));
        }
        other => return Err(format!("unrecognized behavior: {other}")),
    }
    Ok(())
}

fn value_as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Parse a `_behaviors` value. The array form preserves application order;
/// the legacy object form is accepted with its keys applied in map order.
/// Anything that is not an object or array is an input-validation error.
pub fn parse_behaviors(value: Option<&Value>) -> Result<BehaviorList, String> {
    let mut list = BehaviorList::default();
    let Some(value) = value else {
        return Ok(list);
    };

    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                let entry = item
                    .as_object()
                    .ok_or_else(|| "behavior entries must be objects".to_string())?;
                for (key, value) in entry {
                    push_entry(&mut list, key, value)?;
                }
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                push_entry(&mut list, key, value)?;
            }
        }
        other => {
            return Err(format!(
                "_behaviors must be an object or array, got {other}"
            ))
        }
    }
    Ok(list)
}
