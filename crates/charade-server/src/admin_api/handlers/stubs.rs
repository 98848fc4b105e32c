//! Stub CRUD handlers and configuration validation.

use crate::admin_api::handlers::imposters::handle_get;
use crate::admin_api::types::*;
use crate::behaviors::parse_behaviors;
use crate::imposter::{ImposterConfig, ImposterError, ImposterManager, Stub};
use crate::predicate::{Predicate, PredicateOperator};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;

fn predicate_uses_inject(predicate: &Predicate) -> bool {
    match &predicate.operator {
        PredicateOperator::Inject(_) => true,
        PredicateOperator::Not(inner) => predicate_uses_inject(inner),
        PredicateOperator::And(children) | PredicateOperator::Or(children) => {
            children.iter().any(predicate_uses_inject)
        }
        _ => false,
    }
}

/// Validate stubs before they reach the engine: behavior shapes must parse
/// and scripted parts require injection to be allowed. Scripts themselves
/// are never compiled or validated here.
pub fn validate_stubs(stubs: &[Stub], allow_injection: bool) -> Result<(), ImposterError> {
    for stub in stubs {
        for response in &stub.responses {
            let behaviors = parse_behaviors(response.behaviors.as_ref())
                .map_err(ImposterError::BadData)?;
            if !allow_injection {
                if response.inject.is_some() {
                    return Err(ImposterError::InvalidInjection(
                        "inject responses require the server to allow injection".to_string(),
                    ));
                }
                let scripted = behaviors.entries.iter().any(|entry| {
                    matches!(
                        entry,
                        crate::behaviors::Behavior::Decorate(_)
                            | crate::behaviors::Behavior::Wait(
                                crate::behaviors::WaitBehavior::Function(_)
                            )
                    )
                });
                if scripted {
                    return Err(ImposterError::InvalidInjection(
                        "script behaviors require the server to allow injection".to_string(),
                    ));
                }
            }
        }
        if !allow_injection && stub.predicates.iter().any(predicate_uses_inject) {
            return Err(ImposterError::InvalidInjection(
                "inject predicates require the server to allow injection".to_string(),
            ));
        }
    }
    Ok(())
}

/// Imposter-level validation on top of the stub checks.
pub fn validate_config(
    config: &ImposterConfig,
    allow_injection: bool,
) -> Result<(), ImposterError> {
    validate_stubs(&config.stubs, allow_injection)?;
    if !allow_injection && config.end_of_request_resolver.is_some() {
        return Err(ImposterError::InvalidInjection(
            "endOfRequestResolver requires the server to allow injection".to_string(),
        ));
    }
    Ok(())
}

/// PUT /imposters/:port/stubs - replace all stubs (cursors reset)
pub async fn handle_replace_all(
    port: u16,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    #[derive(serde::Deserialize)]
    struct Batch {
        stubs: Vec<Stub>,
    }
    let batch: Batch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };
    if let Err(e) = validate_stubs(&batch.stubs, options.allow_injection) {
        return error_response(&e);
    }

    match manager.repository().update_stubs(port, batch.stubs).await {
        Ok(()) => handle_get(port, None, base_url, manager).await,
        Err(e) => error_response(&e),
    }
}

/// POST /imposters/:port/stubs - insert one stub ({stub, index?})
pub async fn handle_add(
    port: u16,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    #[derive(serde::Deserialize)]
    struct AddStub {
        stub: Stub,
        #[serde(default)]
        index: Option<usize>,
    }
    let add: AddStub = match serde_json::from_slice(&body) {
        Ok(add) => add,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };
    if let Err(e) = validate_stubs(std::slice::from_ref(&add.stub), options.allow_injection) {
        return error_response(&e);
    }

    if let Some(index) = add.index {
        let Some(imposter) = manager.get(port).await else {
            return error_response(&ImposterError::NotFound(port));
        };
        if index > imposter.stubs().len() {
            return error_response(&ImposterError::StubIndexOutOfBounds(index));
        }
    }

    match manager
        .repository()
        .add_stub(port, add.stub, add.index)
        .await
    {
        Ok(()) => handle_get(port, None, base_url, manager).await,
        Err(e) => error_response(&e),
    }
}

/// PUT /imposters/:port/stubs/:index - replace one stub
pub async fn handle_replace(
    port: u16,
    index: usize,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    let stub: Stub = match serde_json::from_slice(&body) {
        Ok(stub) => stub,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };
    if let Err(e) = validate_stubs(std::slice::from_ref(&stub), options.allow_injection) {
        return error_response(&e);
    }

    match manager.repository().replace_stub(port, index, stub).await {
        Ok(()) => handle_get(port, None, base_url, manager).await,
        Err(e) => error_response(&e),
    }
}

/// DELETE /imposters/:port/stubs/:index
pub async fn handle_delete(
    port: u16,
    index: usize,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.repository().delete_stub(port, index).await {
        Ok(()) => handle_get(port, None, base_url, manager).await,
        Err(e) => error_response(&e),
    }
}
