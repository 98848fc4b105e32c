//! Response helpers, hypermedia links and imposter views for the control
//! plane.

use crate::imposter::{Imposter, ImposterError, Stub};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::{json, Map, Value};

/// Options the control plane was started with.
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub port: u16,
    /// CORS origin; `*` when unset.
    pub origin: Option<String>,
    /// Allow inject responses/predicates and script behaviors.
    pub allow_injection: bool,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            port: 2525,
            origin: None,
            allow_injection: true,
        }
    }
}

/// Query parameters shared by the imposter read endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViewOptions {
    pub replayable: bool,
    pub remove_proxies: bool,
}

impl ViewOptions {
    pub fn parse(query: Option<&str>) -> Self {
        let Some(query) = query else {
            return Self::default();
        };
        let params = crate::model::parse_query_string(query);
        let flag = |key: &str| params.get(key).and_then(Value::as_str) == Some("true");
        Self {
            replayable: flag("replayable"),
            remove_proxies: flag("removeProxies"),
        }
    }
}

/// Base URL for hypermedia links, from the Host header.
pub fn base_url(req: &Request<Incoming>) -> String {
    req.headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| "http://localhost:2525".to_string())
}

fn imposter_links(base_url: &str, port: u16) -> Value {
    json!({
        "self": {"href": format!("{base_url}/imposters/{port}")},
        "stubs": {"href": format!("{base_url}/imposters/{port}/stubs")}
    })
}

fn stub_links(base_url: &str, port: u16, index: usize) -> Value {
    json!({
        "self": {"href": format!("{base_url}/imposters/{port}/stubs/{index}")}
    })
}

/// Drop proxy responses; a stub whose responses all were proxies is dropped
/// entirely.
fn without_proxies(stubs: Vec<Stub>) -> Vec<Stub> {
    stubs
        .into_iter()
        .filter_map(|mut stub| {
            stub.responses.retain(|response| !response.is_proxy());
            if stub.responses.is_empty() {
                None
            } else {
                Some(stub)
            }
        })
        .collect()
}

/// Render one imposter for the API. `replayable` strips the request log,
/// counters and links; `removeProxies` filters proxy responses. The https
/// private key is not part of the serialized config and can never appear.
pub fn imposter_view(imposter: &Imposter, options: ViewOptions, base_url: &str) -> Value {
    let port = imposter.port();
    let mut view = match serde_json::to_value(&imposter.config) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut stubs = imposter.stubs();
    if options.remove_proxies {
        stubs = without_proxies(stubs);
    }
    let stubs: Vec<Value> = stubs
        .iter()
        .enumerate()
        .map(|(index, stub)| {
            let mut stub = match serde_json::to_value(stub) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            if !options.replayable {
                stub.insert("_links".to_string(), stub_links(base_url, port, index));
            }
            Value::Object(stub)
        })
        .collect();
    view.insert("stubs".to_string(), Value::Array(stubs));

    if imposter.config.protocol == "https" {
        if let Some(fingerprint) = imposter.cert_fingerprint.get() {
            view.insert(
                "certificateFingerprint".to_string(),
                Value::String(fingerprint.clone()),
            );
        }
    }

    if !options.replayable {
        view.insert(
            "numberOfRequests".to_string(),
            json!(imposter.request_count()),
        );
        view.insert(
            "requests".to_string(),
            serde_json::to_value(imposter.requests()).unwrap_or_else(|_| json!([])),
        );
        view.insert("_links".to_string(), imposter_links(base_url, port));
    }

    Value::Object(view)
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// The taxonomy error body: `{"errors": [{"code", "message"}]}`.
pub fn error_body(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &json!({"errors": [{"code": code, "message": message}]}),
    )
}

pub fn error_response(error: &ImposterError) -> Response<Full<Bytes>> {
    let status = match error {
        ImposterError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    error_body(status, error.code(), &error.to_string())
}

pub fn not_found() -> Response<Full<Bytes>> {
    error_body(
        StatusCode::NOT_FOUND,
        "no such resource",
        "the requested resource does not exist",
    )
}

pub async fn collect_body(req: Request<Incoming>) -> Result<Bytes, ImposterError> {
    use http_body_util::BodyExt;
    req.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ImposterError::BadData(format!("failed to read request body: {e}")))
}
