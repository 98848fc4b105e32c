//! Root, config and log endpoints.

use crate::admin_api::types::{json_response, ApiOptions};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

/// GET / - hypermedia entry point
pub fn handle_root(base_url: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "_links": {
                "imposters": {"href": format!("{base_url}/imposters")},
                "config": {"href": format!("{base_url}/config")},
                "logs": {"href": format!("{base_url}/logs")}
            }
        }),
    )
}

/// GET /config - version, runtime info and effective options
pub fn handle_config(options: &ApiOptions) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "version": env!("CARGO_PKG_VERSION"),
            "options": {
                "port": options.port,
                "allowInjection": options.allow_injection,
                "origin": options.origin,
            },
            "process": {
                "pid": std::process::id(),
                "architecture": std::env::consts::ARCH,
                "platform": std::env::consts::OS,
            }
        }),
    )
}

/// GET /logs - log routing lives outside the server; the endpoint exists
/// for the hypermedia contract and always answers with an empty window.
pub fn handle_logs() -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &json!({"logs": []}))
}
