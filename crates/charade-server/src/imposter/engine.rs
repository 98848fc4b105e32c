//! The per-request pipeline: match, select, resolve, decorate.
//!
//! Protocol servers and the plugin callback both funnel requests through
//! [`handle_request`]. The imposter's lock is never held across an await:
//! matching and cursor movement happen under the write lock, upstream
//! forwarding and wait behaviors happen outside it, and scripts run
//! synchronously under the lock for the duration of the call.

use super::core::{Imposter, ImposterState};
use super::types::{ProxyMode, ResponseKind, StubResponse};
use crate::behaviors::{
    apply_copy, apply_lookup, parse_behaviors, Behavior, BehaviorList, CsvCache,
};
use crate::model::{IsResponse, NeutralRequest, ResolvedResponse, StatusField};
use crate::predicate::predicates_match;
use crate::proxy;
use crate::repository::Repository;
use crate::scripting;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lookup CSV files are shared across imposters.
static CSV_CACHE: Lazy<CsvCache> = Lazy::new(CsvCache::new);

/// What the pipeline produced for one request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A concrete response, with the index of the stub that matched (None
    /// when the default response or empty fallback was used).
    Reply {
        response: ResolvedResponse,
        stub_index: Option<usize>,
    },
    /// A deliberate connection-level misbehavior.
    Fault { fault: String },
    /// The upstream origin could not be reached; 502-equivalent, cursor
    /// not advanced, nothing recorded.
    UpstreamFailure { message: String },
    /// A script blew up; 500-equivalent for HTTP, session close elsewhere.
    ScriptFailure { message: String },
}

/// Run one request through the imposter.
pub async fn handle_request(
    imposter: &Arc<Imposter>,
    repo: &Arc<dyn Repository>,
    request: &NeutralRequest,
) -> Outcome {
    imposter.accepted();
    if imposter.config.record_requests {
        if let Err(e) = repo.add_request(imposter.port(), request.clone()).await {
            warn!(port = imposter.port(), "failed to record request: {e}");
        }
    }

    let fields = request.fields();
    let selected = match select_response(imposter, &fields) {
        Ok(selected) => selected,
        Err(message) => {
            warn!(port = imposter.port(), "predicate script failed: {message}");
            return Outcome::ScriptFailure { message };
        }
    };

    let Some((stub_index, response)) = selected else {
        return fallback(imposter);
    };

    match response.kind() {
        ResponseKind::Fault(fault) => Outcome::Fault { fault },
        ResponseKind::Is(mut is) => {
            if let Some(default) = &imposter.config.default_response {
                is.merge_with_default(default);
            }
            finish(
                imposter,
                Some(stub_index),
                response.behaviors.as_ref(),
                &fields,
                is.into(),
            )
            .await
        }
        ResponseKind::Inject(script) => {
            let result = {
                let mut state = imposter.state.write();
                scripting::eval_response(&script, &fields, &mut state.script_state, imposter.port())
            };
            let value = match result {
                Ok(value) => value,
                Err(e) => {
                    warn!(port = imposter.port(), "inject response failed: {e}");
                    return Outcome::ScriptFailure {
                        message: e.to_string(),
                    };
                }
            };
            let mut is: IsResponse = match serde_json::from_value(value) {
                Ok(is) => is,
                Err(e) => {
                    return Outcome::ScriptFailure {
                        message: format!("inject response has an invalid shape: {e}"),
                    }
                }
            };
            if let Some(default) = &imposter.config.default_response {
                is.merge_with_default(default);
            }
            finish(
                imposter,
                Some(stub_index),
                response.behaviors.as_ref(),
                &fields,
                is.into(),
            )
            .await
        }
        ResponseKind::Proxy(config) => {
            match proxy::forward(&config, request, imposter.config.tcp_mode()).await {
                Err(e) => {
                    warn!(port = imposter.port(), "upstream failure: {e:#}");
                    Outcome::UpstreamFailure {
                        message: format!("{e:#}"),
                    }
                }
                Ok(upstream) => {
                    // the proxy cursor advances only on success, so a dead
                    // origin keeps being retried
                    imposter.advance_cursor(stub_index, response.repeat());
                    if config.mode != ProxyMode::ProxyTransparent {
                        let recorded = proxy::recorded_stub(&config, &fields, &upstream);
                        imposter.record_proxy_stub(recorded, stub_index, config.mode);
                    }
                    let resolved = ResolvedResponse {
                        status: StatusField::Code(upstream.status),
                        headers: upstream.headers,
                        body: upstream.body,
                        data: upstream.data,
                        mode: upstream.mode,
                    };
                    finish(
                        imposter,
                        Some(stub_index),
                        response.behaviors.as_ref(),
                        &fields,
                        resolved,
                    )
                    .await
                }
            }
        }
    }
}

/// Ordered scan, first match wins. The matched stub's cursor is peeked for
/// selection and advanced immediately for everything except proxies.
fn select_response(
    imposter: &Arc<Imposter>,
    fields: &Value,
) -> Result<Option<(usize, StubResponse)>, String> {
    let mut guard = imposter.state.write();
    let port = imposter.port();
    let ImposterState {
        stubs,
        script_state,
        ..
    } = &mut *guard;

    let matched = {
        let mut inject = |script: &str| {
            scripting::eval_predicate(script, fields, script_state, port).map_err(|e| e.to_string())
        };
        let mut matched = None;
        for (index, runtime) in stubs.iter().enumerate() {
            if predicates_match(&runtime.def.predicates, fields, &mut inject)? {
                matched = Some(index);
                break;
            }
        }
        matched
    };

    let Some(index) = matched else {
        return Ok(None);
    };
    let runtime = &mut stubs[index];
    let count = runtime.def.responses.len();
    if count == 0 {
        return Ok(Some((index, StubResponse::default())));
    }
    let response = runtime.def.responses[runtime.cursor.peek(count)].clone();
    if !response.is_proxy() {
        runtime.cursor.advance(response.repeat(), count);
    }
    Ok(Some((index, response)))
}

/// No stub matched: the default response if configured, else an empty
/// 200-equivalent.
fn fallback(imposter: &Arc<Imposter>) -> Outcome {
    let response = imposter
        .config
        .default_response
        .clone()
        .map(ResolvedResponse::from)
        .unwrap_or_default();
    Outcome::Reply {
        response,
        stub_index: None,
    }
}

fn resolved_to_json(resolved: &ResolvedResponse) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "statusCode".to_string(),
        match &resolved.status {
            StatusField::Code(code) => json!(code),
            StatusField::Text(text) => json!(text),
        },
    );
    map.insert(
        "headers".to_string(),
        Value::Object(resolved.headers.clone().into_iter().collect()),
    );
    if let Some(body) = &resolved.body {
        map.insert("body".to_string(), body.clone());
    }
    if let Some(data) = &resolved.data {
        map.insert("data".to_string(), json!(data));
    }
    Value::Object(map)
}

/// Fold a script's response object back into the resolved response,
/// keeping prior values for fields the script left out.
fn update_from_json(resolved: &ResolvedResponse, value: Value) -> Result<ResolvedResponse, String> {
    let is: IsResponse = serde_json::from_value(value)
        .map_err(|e| format!("script produced an invalid response shape: {e}"))?;
    Ok(ResolvedResponse {
        status: is.status_code.unwrap_or_else(|| resolved.status.clone()),
        headers: if is.headers.is_empty() {
            resolved.headers.clone()
        } else {
            is.headers
        },
        body: is.body.or_else(|| resolved.body.clone()),
        data: is.data.or_else(|| resolved.data.clone()),
        mode: is.mode.unwrap_or(resolved.mode),
    })
}

/// Apply the response's behavior list in order.
async fn finish(
    imposter: &Arc<Imposter>,
    stub_index: Option<usize>,
    behaviors_value: Option<&Value>,
    fields: &Value,
    mut resolved: ResolvedResponse,
) -> Outcome {
    let port = imposter.port();
    let list = match parse_behaviors(behaviors_value) {
        Ok(list) => list,
        Err(e) => {
            // malformed shapes are rejected at creation; anything that
            // slipped through is skipped rather than failing the request
            warn!(port, "ignoring malformed _behaviors: {e}");
            BehaviorList::default()
        }
    };

    for entry in &list.entries {
        match entry {
            Behavior::Wait(wait) => match wait.resolve(fields, port) {
                Ok(ms) => {
                    if ms > 0 {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                }
                Err(message) => {
                    warn!(port, "wait behavior failed: {message}");
                    return Outcome::ScriptFailure { message };
                }
            },
            Behavior::Decorate(script) => {
                let response_json = resolved_to_json(&resolved);
                let result = {
                    let mut state = imposter.state.write();
                    scripting::eval_decorate(
                        script,
                        fields,
                        &response_json,
                        &mut state.script_state,
                        port,
                    )
                };
                match result.map_err(|e| e.to_string()).and_then(|value| {
                    update_from_json(&resolved, value)
                }) {
                    Ok(updated) => resolved = updated,
                    Err(message) => {
                        warn!(port, "decorate behavior failed: {message}");
                        return Outcome::ScriptFailure { message };
                    }
                }
            }
            Behavior::Copy(copy) => {
                if let Some(index) = stub_index {
                    let mut state = imposter.state.write();
                    if let Some(runtime) = state.stubs.get_mut(index) {
                        let cursor = runtime.copy_cursors.entry(copy.into.clone()).or_default();
                        apply_copy(&mut resolved, copy, fields, cursor);
                    }
                } else {
                    let mut cursor = 0;
                    apply_copy(&mut resolved, copy, fields, &mut cursor);
                }
            }
            Behavior::Lookup(lookup) => {
                apply_lookup(&mut resolved, lookup, fields, &CSV_CACHE);
            }
            Behavior::ShellTransform(_) => {
                // refused by design: user-supplied shell commands never run.
                // Recorded as a non-fatal error; the response continues
                // through the rest of the pipeline untransformed.
                warn!(port, "shellTransform is not supported and was skipped");
            }
        }
    }

    Outcome::Reply {
        response: resolved,
        stub_index,
    }
}
