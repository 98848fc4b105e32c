//! Embedded scripting sandbox.
//!
//! User scripts (inject responses, inject predicates, decorate behaviors,
//! wait functions, TCP end-of-request resolvers) run in a Rhai engine that
//! exposes a fixed host API and nothing else: a logger routed to the host
//! log stream, byte-buffer helpers for utf8/base64 conversion, and the
//! per-imposter mutable `state` map.
//!
//! Scripts see the legacy calling convention (`request`, `state`, `logger`,
//! `response`) and the bundled `config` map side by side; mutations are read
//! back from the direct bindings first, then reconciled from `config` when a
//! script only touched the bundle. A returned map always wins over in-place
//! mutation.

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, Map, Scope};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Wall-time cap for a single script invocation.
const MAX_SCRIPT_WALL_TIME: Duration = Duration::from_secs(5);

/// A script failure: syntax error, runtime exception, wall-time overrun or a
/// result of the wrong shape. Local to one request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

/// Logger handle exposed to scripts as both `logger` and `console`.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    port: u16,
}

impl ScriptLogger {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn emit(&self, level: &str, message: &Dynamic) {
        let port = self.port;
        match level {
            "debug" => debug!(port, "script: {message}"),
            "warn" => warn!(port, "script: {message}"),
            "error" => error!(port, "script: {message}"),
            _ => info!(port, "script: {message}"),
        }
    }
}

/// Decide whether a script result counts as true.
pub fn truthy(value: &Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(i) = value.as_int() {
        return i != 0;
    }
    if value.is_string() {
        return value
            .clone()
            .into_immutable_string()
            .map(|s| !s.is_empty())
            .unwrap_or(true);
    }
    true
}

fn decode_bytes(text: &str, encoding: &str) -> Result<Vec<u8>, Box<rhai::EvalAltResult>> {
    use base64::Engine as _;
    match encoding {
        "utf8" | "utf-8" => Ok(text.as_bytes().to_vec()),
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| format!("invalid base64: {e}").into()),
        other => Err(format!("unsupported encoding: {other}").into()),
    }
}

fn encode_bytes(bytes: &[u8], encoding: &str) -> Result<String, Box<rhai::EvalAltResult>> {
    use base64::Engine as _;
    match encoding {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "base64" => Ok(base64::engine::general_purpose::STANDARD.encode(bytes)),
        other => Err(format!("unsupported encoding: {other}").into()),
    }
}

/// Build the sandboxed engine: host API registration plus the wall-time cap.
/// One engine per invocation; the progress hook carries the deadline.
fn build_engine() -> Engine {
    let mut engine = Engine::new();

    engine
        .register_type_with_name::<ScriptLogger>("Logger")
        .register_fn("log", |l: &mut ScriptLogger, msg: Dynamic| {
            l.emit("info", &msg)
        })
        .register_fn("debug", |l: &mut ScriptLogger, msg: Dynamic| {
            l.emit("debug", &msg)
        })
        .register_fn("info", |l: &mut ScriptLogger, msg: Dynamic| {
            l.emit("info", &msg)
        })
        .register_fn("warn", |l: &mut ScriptLogger, msg: Dynamic| {
            l.emit("warn", &msg)
        })
        .register_fn("error", |l: &mut ScriptLogger, msg: Dynamic| {
            l.emit("error", &msg)
        });

    engine.register_fn(
        "bytes_from",
        |text: &str, encoding: &str| -> Result<rhai::Blob, Box<rhai::EvalAltResult>> {
            decode_bytes(text, encoding)
        },
    );
    engine.register_fn(
        "to_string",
        |bytes: rhai::Blob, encoding: &str| -> Result<String, Box<rhai::EvalAltResult>> {
            encode_bytes(&bytes, encoding)
        },
    );

    let start = Instant::now();
    engine.on_progress(move |_| {
        if start.elapsed() > MAX_SCRIPT_WALL_TIME {
            Some("script exceeded the 5s wall-time cap".into())
        } else {
            None
        }
    });

    engine
}

fn eval(script: &str, scope: &mut Scope) -> Result<Dynamic, ScriptError> {
    build_engine()
        .eval_with_scope::<Dynamic>(scope, script)
        .map_err(|e| ScriptError(format!("script failed: {e}")))
}

fn json_scope(
    request: &Value,
    state: &Value,
    response: Option<&Value>,
    port: u16,
) -> Result<Scope<'static>, ScriptError> {
    let request_dyn =
        to_dynamic(request).map_err(|e| ScriptError(format!("request conversion: {e}")))?;
    let state_dyn =
        to_dynamic(state).map_err(|e| ScriptError(format!("state conversion: {e}")))?;
    let logger = ScriptLogger::new(port);

    let mut config = Map::new();
    config.insert("request".into(), request_dyn.clone());
    config.insert("state".into(), state_dyn.clone());
    config.insert("logger".into(), Dynamic::from(logger.clone()));

    let mut scope = Scope::new();
    if let Some(response) = response {
        let response_dyn =
            to_dynamic(response).map_err(|e| ScriptError(format!("response conversion: {e}")))?;
        config.insert("response".into(), response_dyn.clone());
        scope.push_dynamic("response", response_dyn);
    }
    scope.push_dynamic("request", request_dyn);
    scope.push_dynamic("state", state_dyn);
    scope.push("logger", logger.clone());
    scope.push("console", logger);
    scope.push("config", config);
    Ok(scope)
}

fn scope_value(scope: &Scope, name: &str) -> Option<Value> {
    scope.get(name).and_then(|d| from_dynamic(d).ok())
}

fn config_entry(scope: &Scope, name: &str) -> Option<Value> {
    let config = scope.get_value::<Map>("config")?;
    from_dynamic(config.get(name)?).ok()
}

/// Read the script's view of `state` back out, preferring the direct binding
/// and falling back to `config.state` when only the bundle was touched.
fn writeback_state(scope: &Scope, state: &mut Value) {
    if let Some(direct) = scope_value(scope, "state") {
        if direct != *state {
            *state = direct;
            return;
        }
    }
    if let Some(bundled) = config_entry(scope, "state") {
        if bundled != *state {
            *state = bundled;
        }
    }
}

/// Evaluate an inject predicate: truthy return means the predicate matches.
pub fn eval_predicate(
    script: &str,
    request: &Value,
    state: &mut Value,
    port: u16,
) -> Result<bool, ScriptError> {
    let mut scope = json_scope(request, state, None, port)?;
    let result = eval(script, &mut scope)?;
    writeback_state(&scope, state);
    Ok(truthy(&result))
}

/// Evaluate an inject response script. The result is the response object:
/// a returned map overrides everything, otherwise in-place mutations of the
/// seeded `response` are taken.
pub fn eval_response(
    script: &str,
    request: &Value,
    state: &mut Value,
    port: u16,
) -> Result<Value, ScriptError> {
    let seed = Value::Object(serde_json::Map::new());
    let mut scope = json_scope(request, state, Some(&seed), port)?;
    let result = eval(script, &mut scope)?;
    writeback_state(&scope, state);

    if !result.is_unit() {
        return from_dynamic(&result)
            .map_err(|e| ScriptError(format!("response script returned a non-object: {e}")));
    }
    let mutated = scope_value(&scope, "response")
        .filter(|v| *v != seed)
        .or_else(|| config_entry(&scope, "response").filter(|v| *v != seed));
    Ok(mutated.unwrap_or(seed))
}

/// Evaluate a decorate script over an already-populated response.
pub fn eval_decorate(
    script: &str,
    request: &Value,
    response: &Value,
    state: &mut Value,
    port: u16,
) -> Result<Value, ScriptError> {
    let mut scope = json_scope(request, state, Some(response), port)?;
    let result = eval(script, &mut scope)?;
    writeback_state(&scope, state);

    if !result.is_unit() && result.is_map() {
        return from_dynamic(&result)
            .map_err(|e| ScriptError(format!("decorate script result: {e}")));
    }
    let mutated = scope_value(&scope, "response")
        .filter(|v| v != response)
        .or_else(|| config_entry(&scope, "response").filter(|v| v != response));
    Ok(mutated.unwrap_or_else(|| response.clone()))
}

/// Evaluate a wait function; must produce a non-negative integer of
/// milliseconds.
pub fn eval_wait(script: &str, request: &Value, port: u16) -> Result<i64, ScriptError> {
    let state = Value::Object(serde_json::Map::new());
    let mut scope = json_scope(request, &state, None, port)?;
    let result = eval(script, &mut scope)?;
    let ms = result
        .as_int()
        .map_err(|_| ScriptError("wait function must return an integer".to_string()))?;
    if ms < 0 {
        return Err(ScriptError(format!("wait function returned {ms} ms")));
    }
    Ok(ms)
}

/// Evaluate a TCP end-of-request resolver over the accumulated request text
/// (base64 in binary mode). Truthy return marks the request complete.
pub fn eval_end_of_request(
    script: &str,
    accumulated: &str,
    port: u16,
) -> Result<bool, ScriptError> {
    let mut scope = Scope::new();
    let logger = ScriptLogger::new(port);
    scope.push("request", accumulated.to_string());
    scope.push("logger", Dynamic::from(logger.clone()));
    scope.push("console", Dynamic::from(logger));
    let result = eval(script, &mut scope)?;
    Ok(truthy(&result))
}
