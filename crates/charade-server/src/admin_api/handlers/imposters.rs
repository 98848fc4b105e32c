//! Imposter CRUD handlers.

use crate::admin_api::handlers::stubs::validate_config;
use crate::admin_api::types::*;
use crate::imposter::{engine, ImposterConfig, ImposterError, ImposterManager};
use crate::model::NeutralRequest;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// POST /imposters
pub async fn handle_create(
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    let config: ImposterConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };
    if let Err(e) = validate_config(&config, options.allow_injection) {
        return error_response(&e);
    }

    match manager.start(config).await {
        Ok(imposter) => {
            info!(port = imposter.port(), "imposter created");
            let view = imposter_view(&imposter, ViewOptions::default(), base_url);
            let location = format!("{base_url}/imposters/{}", imposter.port());
            let json = serde_json::to_string_pretty(&view).unwrap_or_else(|_| "{}".to_string());
            Response::builder()
                .status(StatusCode::CREATED)
                .header("Content-Type", "application/json")
                .header("Location", location)
                .body(Full::new(Bytes::from(json)))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
        }
        Err(e) => error_response(&e),
    }
}

/// GET /imposters
pub async fn handle_list(
    manager: Arc<ImposterManager>,
    query: Option<&str>,
    base_url: &str,
) -> Response<Full<Bytes>> {
    let options = ViewOptions::parse(query);
    let imposters: Vec<Value> = manager
        .all()
        .await
        .iter()
        .map(|imposter| imposter_view(imposter, options, base_url))
        .collect();
    json_response(StatusCode::OK, &json!({"imposters": imposters}))
}

/// PUT /imposters - replace the whole collection
pub async fn handle_replace_all(
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
        imposters: Vec<ImposterConfig>,
    }
    let batch: Batch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };
    for config in &batch.imposters {
        if let Err(e) = validate_config(config, options.allow_injection) {
            return error_response(&e);
        }
    }

    manager.stop_all().await;
    for config in batch.imposters {
        if let Err(e) = manager.start(config).await {
            return error_response(&e);
        }
    }
    handle_list(manager, None, base_url).await
}

/// DELETE /imposters - stop everything
pub async fn handle_delete_all(
    manager: Arc<ImposterManager>,
    query: Option<&str>,
    base_url: &str,
) -> Response<Full<Bytes>> {
    let options = ViewOptions::parse(query);
    let stopped: Vec<Value> = manager
        .stop_all()
        .await
        .iter()
        .map(|imposter| imposter_view(imposter, options, base_url))
        .collect();
    json_response(StatusCode::OK, &json!({"imposters": stopped}))
}

/// GET /imposters/:port
pub async fn handle_get(
    port: u16,
    query: Option<&str>,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.get(port).await {
        Some(imposter) => json_response(
            StatusCode::OK,
            &imposter_view(&imposter, ViewOptions::parse(query), base_url),
        ),
        None => error_response(&ImposterError::NotFound(port)),
    }
}

/// DELETE /imposters/:port - idempotent: deleting a missing imposter is a
/// 200 with an empty object.
pub async fn handle_delete(
    port: u16,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.stop(port).await {
        Some(imposter) => {
            info!(port, "imposter deleted");
            json_response(
                StatusCode::OK,
                &imposter_view(&imposter, ViewOptions::default(), base_url),
            )
        }
        None => json_response(StatusCode::OK, &json!({})),
    }
}

/// DELETE /imposters/:port/savedRequests
pub async fn handle_clear_requests(
    port: u16,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.repository().clear_requests(port).await {
        Ok(()) => handle_get(port, None, base_url, manager).await,
        Err(e) => error_response(&e),
    }
}

/// POST /imposters/:port/_requests - the out-of-process protocol callback:
/// a plugin hands in a neutral request and gets the resolved response.
pub async fn handle_plugin_request(
    port: u16,
    req: Request<Incoming>,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    let Some(imposter) = manager.get(port).await else {
        return error_response(&ImposterError::NotFound(port));
    };
    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    #[derive(serde::Deserialize)]
    struct Callback {
        request: NeutralRequest,
    }
    let callback: Callback = match serde_json::from_slice(&body) {
        Ok(callback) => callback,
        Err(e) => return error_response(&ImposterError::InvalidJson(e.to_string())),
    };

    let outcome =
        engine::handle_request(&imposter, manager.repository(), &callback.request).await;
    let reply = match outcome {
        engine::Outcome::Reply {
            response,
            stub_index,
        } => {
            let mut body = json!({
                "matched": stub_index.is_some(),
                "stubIndex": stub_index.unwrap_or(0),
                "response": {
                    "statusCode": response.status_code(),
                    "headers": response.headers,
                }
            });
            if let Some(value) = response.body {
                body["response"]["body"] = value;
            }
            if let Some(data) = response.data {
                body["response"]["data"] = json!(data);
            }
            body
        }
        engine::Outcome::Fault { fault } => json!({
            "matched": true,
            "stubIndex": 0,
            "blocked": true,
            "blockedReason": fault
        }),
        engine::Outcome::UpstreamFailure { message } => json!({
            "matched": true,
            "stubIndex": 0,
            "response": {"statusCode": 502, "body": message}
        }),
        engine::Outcome::ScriptFailure { message } => json!({
            "matched": false,
            "stubIndex": 0,
            "blocked": true,
            "blockedReason": message
        }),
    };
    json_response(StatusCode::OK, &reply)
}
