//! Route dispatch for the control plane.

use crate::admin_api::handlers::{imposters, stubs, system};
use crate::admin_api::types::{base_url, not_found, ApiOptions};
use crate::imposter::ImposterManager;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Parsed route under `/imposters/:port`.
enum ImposterRoute {
    /// GET/DELETE /imposters/:port
    Root,
    /// PUT/POST /imposters/:port/stubs
    Stubs,
    /// PUT/DELETE /imposters/:port/stubs/:index
    StubByIndex(usize),
    /// DELETE /imposters/:port/savedRequests
    SavedRequests,
    /// POST /imposters/:port/_requests (protocol plugin callback)
    PluginRequests,
}

impl ImposterRoute {
    fn parse(segments: &[&str]) -> Option<Self> {
        match segments {
            [] => Some(ImposterRoute::Root),
            ["stubs"] => Some(ImposterRoute::Stubs),
            ["stubs", index] => index.parse().ok().map(ImposterRoute::StubByIndex),
            ["savedRequests"] => Some(ImposterRoute::SavedRequests),
            ["_requests"] => Some(ImposterRoute::PluginRequests),
            _ => None,
        }
    }
}

/// Main control-plane router. Every response carries the CORS origin.
pub async fn route_request(
    req: Request<Incoming>,
    manager: Arc<ImposterManager>,
    options: Arc<ApiOptions>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let base = base_url(&req);

    debug!("control plane: {method} {path}");

    let mut response = if method == Method::OPTIONS {
        preflight()
    } else {
        dispatch(&method, &path, query.as_deref(), req, &base, manager, &options).await
    };

    let origin = options.origin.as_deref().unwrap_or("*");
    if let Ok(value) = HeaderValue::from_str(origin) {
        response
            .headers_mut()
            .insert("Access-Control-Allow-Origin", value);
    }
    Ok(response)
}

fn preflight() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE")
        .header("Access-Control-Allow-Headers", "Content-Type")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

async fn dispatch(
    method: &Method,
    path: &str,
    query: Option<&str>,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/") => return system::handle_root(base_url),
        (&Method::GET, "/config") => return system::handle_config(options),
        (&Method::GET, "/logs") => return system::handle_logs(),
        _ => {}
    }

    if path == "/imposters" {
        return match *method {
            Method::GET => imposters::handle_list(manager, query, base_url).await,
            Method::POST => imposters::handle_create(req, base_url, manager, options).await,
            Method::PUT => imposters::handle_replace_all(req, base_url, manager, options).await,
            Method::DELETE => imposters::handle_delete_all(manager, query, base_url).await,
            _ => not_found(),
        };
    }

    if let Some(rest) = path.strip_prefix("/imposters/") {
        return route_imposter(method, rest, query, req, base_url, manager, options).await;
    }

    not_found()
}

async fn route_imposter(
    method: &Method,
    path: &str,
    query: Option<&str>,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
    options: &ApiOptions,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.split('/').collect();
    let Some((port_segment, rest)) = segments.split_first() else {
        return not_found();
    };
    let Ok(port) = port_segment.parse::<u16>() else {
        return crate::admin_api::types::error_body(
            StatusCode::BAD_REQUEST,
            "bad data",
            "invalid port number",
        );
    };
    let Some(route) = ImposterRoute::parse(rest) else {
        return not_found();
    };

    match (method, route) {
        (&Method::GET, ImposterRoute::Root) => {
            imposters::handle_get(port, query, base_url, manager).await
        }
        (&Method::DELETE, ImposterRoute::Root) => {
            imposters::handle_delete(port, base_url, manager).await
        }
        (&Method::PUT, ImposterRoute::Stubs) => {
            stubs::handle_replace_all(port, req, base_url, manager, options).await
        }
        (&Method::POST, ImposterRoute::Stubs) => {
            stubs::handle_add(port, req, base_url, manager, options).await
        }
        (&Method::PUT, ImposterRoute::StubByIndex(index)) => {
            stubs::handle_replace(port, index, req, base_url, manager, options).await
        }
        (&Method::DELETE, ImposterRoute::StubByIndex(index)) => {
            stubs::handle_delete(port, index, base_url, manager).await
        }
        (&Method::DELETE, ImposterRoute::SavedRequests) => {
            imposters::handle_clear_requests(port, base_url, manager).await
        }
        (&Method::POST, ImposterRoute::PluginRequests) => {
            imposters::handle_plugin_request(port, req, manager).await
        }
        _ => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imposter_route_parse() {
        assert!(matches!(
            ImposterRoute::parse(&[]),
            Some(ImposterRoute::Root)
        ));
        assert!(matches!(
            ImposterRoute::parse(&["stubs"]),
            Some(ImposterRoute::Stubs)
        ));
        assert!(matches!(
            ImposterRoute::parse(&["stubs", "3"]),
            Some(ImposterRoute::StubByIndex(3))
        ));
        assert!(matches!(
            ImposterRoute::parse(&["savedRequests"]),
            Some(ImposterRoute::SavedRequests)
        ));
        assert!(matches!(
            ImposterRoute::parse(&["_requests"]),
            Some(ImposterRoute::PluginRequests)
        ));
        assert!(ImposterRoute::parse(&["unknown"]).is_none());
        assert!(ImposterRoute::parse(&["stubs", "not-a-number"]).is_none());
    }
}
