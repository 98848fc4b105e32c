//! Upstream forwarding for proxy responses.

mod recorder;

pub use recorder::{generate_predicates, recorded_stub};

use crate::imposter::{ProxyConfig, TcpMode};
use crate::model::{HttpRequest, NeutralRequest, ResponseMode};
use anyhow::{bail, Context};
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Headers never forwarded upstream or replayed downstream.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn http_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default()
    })
}

/// The upstream's answer, converted into neutral response fields.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, Value>,
    pub body: Option<Value>,
    pub data: Option<String>,
    pub mode: ResponseMode,
    pub latency_ms: u64,
}

/// Forward a neutral request to the configured origin.
pub async fn forward(
    proxy: &ProxyConfig,
    request: &NeutralRequest,
    tcp_mode: TcpMode,
) -> anyhow::Result<UpstreamResponse> {
    match request {
        NeutralRequest::Http(http) => forward_http(proxy, http).await,
        NeutralRequest::Tcp(tcp) => forward_tcp(proxy, &tcp.data, tcp_mode).await,
        NeutralRequest::Smtp(_) => bail!("proxying is not supported for smtp imposters"),
    }
}

fn encode_query(query: &HashMap<String, Value>) -> String {
    let mut parts = Vec::new();
    for (key, value) in query {
        match value {
            Value::Array(items) => {
                for item in items {
                    parts.push(format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(item.as_str().unwrap_or_default())
                    ));
                }
            }
            other => parts.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(other.as_str().unwrap_or_default())
            )),
        }
    }
    parts.join("&")
}

async fn forward_http(proxy: &ProxyConfig, request: &HttpRequest) -> anyhow::Result<UpstreamResponse> {
    let base = proxy.to.trim_end_matches('/');
    let query = encode_query(&request.query);
    let target = if query.is_empty() {
        format!("{}{}", base, request.path)
    } else {
        format!("{}{}?{}", base, request.path, query)
    };
    debug!(target, "forwarding upstream");

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut upstream = http_client().request(method, &target);

    for (name, value) in &request.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        match value {
            Value::Array(items) => {
                for item in items {
                    upstream = upstream.header(name, item.as_str().unwrap_or_default());
                }
            }
            Value::String(s) => upstream = upstream.header(name, s),
            other => upstream = upstream.header(name, other.to_string()),
        }
    }
    for (name, value) in &proxy.inject_headers {
        upstream = upstream.header(name, value);
    }
    if let Some(body) = &request.body {
        upstream = upstream.body(body.clone());
    }

    let start = Instant::now();
    let response = upstream
        .send()
        .await
        .with_context(|| format!("upstream request to {target} failed"))?;
    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let value = Value::String(value.to_str().unwrap_or_default().to_string());
        headers.insert(crate::model::header_to_title_case(name.as_str()), value);
    }
    let body_text = response
        .text()
        .await
        .with_context(|| format!("reading upstream body from {target} failed"))?;
    let latency_ms = start.elapsed().as_millis() as u64;

    Ok(UpstreamResponse {
        status,
        headers,
        body: Some(Value::String(body_text)),
        data: None,
        mode: ResponseMode::Text,
        latency_ms,
    })
}

/// Raw TCP forward: connect to `to` (host:port), write the request payload,
/// read until the origin closes or goes idle.
async fn forward_tcp(
    proxy: &ProxyConfig,
    data: &str,
    mode: TcpMode,
) -> anyhow::Result<UpstreamResponse> {
    let target = proxy
        .to
        .strip_prefix("tcp://")
        .unwrap_or(proxy.to.as_str())
        .to_string();

    let payload = match mode {
        TcpMode::Text => data.as_bytes().to_vec(),
        TcpMode::Binary => base64::engine::general_purpose::STANDARD
            .decode(data)
            .with_context(|| "request data is not valid base64")?,
    };

    let start = Instant::now();
    let mut stream = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::net::TcpStream::connect(&target),
    )
    .await
    .with_context(|| format!("connecting to {target} timed out"))?
    .with_context(|| format!("connecting to {target} failed"))?;

    stream.write_all(&payload).await?;

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // first read waits for the origin, later reads only drain what is
        // already in flight
        let wait = if received.is_empty() {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(200)
        };
        match tokio::time::timeout(wait, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => received.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if !received.is_empty() => break,
            Err(_) => bail!("origin {target} sent no response"),
        }
    }
    let latency_ms = start.elapsed().as_millis() as u64;

    let data = match mode {
        TcpMode::Text => String::from_utf8_lossy(&received).into_owned(),
        TcpMode::Binary => base64::engine::general_purpose::STANDARD.encode(&received),
    };

    Ok(UpstreamResponse {
        status: 200,
        headers: HashMap::new(),
        body: None,
        data: Some(data),
        mode: match mode {
            TcpMode::Text => ResponseMode::Text,
            TcpMode::Binary => ResponseMode::Binary,
        },
        latency_ms,
    })
}
