//! HTTP and HTTPS imposter servers.
//!
//! One accept loop per imposter; every connection gets its own task and
//! hyper dispatches a task per request over keepalive. Faults hijack the
//! raw socket underneath hyper: the service arms the fault on the fd and
//! returns an error so hyper aborts without writing.

use super::ServerHandle;
use crate::imposter::{engine, FaultAction, Imposter, ImposterError};
use crate::model::{header_to_title_case, parse_query_string, HttpRequest, NeutralRequest, ResponseMode};
use crate::repository::Repository;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
#[cfg(not(unix))]
type RawFd = i32;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Error returned by the service after a fault hijacked the connection;
/// hyper gives up on the stream without writing anything further.
#[derive(Debug)]
struct ConnectionFault;

impl std::fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection hijacked by fault injection")
    }
}

impl std::error::Error for ConnectionFault {}

pub(super) async fn start(
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    tls: Option<TlsAcceptor>,
) -> Result<ServerHandle, ImposterError> {
    let port = imposter.port();
    let addr = super::bind_addr(&imposter.config);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ImposterError::BindFailed(port, e.to_string()))?;
    info!(port, protocol = %imposter.config.protocol, "imposter listening");

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let accept_task = tokio::spawn(accept_loop(
        listener,
        imposter,
        repo,
        tls,
        cancel.clone(),
        tracker.clone(),
    ));
    Ok(ServerHandle::new(port, cancel, tracker, accept_task))
}

async fn accept_loop(
    listener: TcpListener,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(port = imposter.port(), "imposter accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let imposter = Arc::clone(&imposter);
                    let repo = Arc::clone(&repo);
                    let tls = tls.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        serve_connection(stream, peer, imposter, repo, tls, cancel).await;
                    });
                }
                Err(e) => error!(port = imposter.port(), "accept error: {e}"),
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    #[cfg(unix)]
    let fd = stream.as_raw_fd();
    #[cfg(not(unix))]
    let fd = 0;

    match tls {
        Some(acceptor) => {
            // mutualAuth+rejectUnauthorized aborts right here, before any
            // request is observed
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve(tls_stream, peer, imposter, repo, fd, cancel).await,
                Err(e) => debug!("TLS handshake failed from {peer}: {e}"),
            }
        }
        None => serve(stream, peer, imposter, repo, fd, cancel).await,
    }
}

async fn serve<I>(
    io: I,
    peer: SocketAddr,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    fd: RawFd,
    cancel: CancellationToken,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let imposter = Arc::clone(&imposter);
        let repo = Arc::clone(&repo);
        async move { handle(req, imposter, repo, peer, fd).await }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(TimedIo::new(io)), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("connection ended: {e}");
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

/// Parse the wire request into the neutral form.
async fn neutral_request(req: Request<Incoming>, peer: SocketAddr) -> HttpRequest {
    let method = req.method().to_string();
    let uri = req.uri().clone();

    let mut headers: HashMap<String, Value> = HashMap::new();
    for (name, value) in req.headers() {
        let key = header_to_title_case(name.as_str());
        let value = value.to_str().unwrap_or_default().to_string();
        match headers.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.clone();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                headers.insert(key, Value::String(value));
            }
        }
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
        Err(_) => None,
    };

    HttpRequest {
        request_from: peer.to_string(),
        method,
        path: uri.path().to_string(),
        query: uri.query().map(parse_query_string).unwrap_or_default(),
        headers,
        body,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// CORS preflight for imposters with allowCORS: echo the requested method,
/// headers and origin. Anything else passes through to the stubs.
fn preflight(req: &Request<Incoming>) -> Option<Response<Full<Bytes>>> {
    if req.method() != Method::OPTIONS {
        return None;
    }
    let origin = header_str(req, "origin")?;
    let method = header_str(req, "access-control-request-method")?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", origin)
        .header("Access-Control-Allow-Methods", method);
    if let Some(headers) = header_str(req, "access-control-request-headers") {
        response = response.header("Access-Control-Allow-Headers", headers);
    }
    response.body(Full::new(Bytes::new())).ok()
}

async fn handle(
    req: Request<Incoming>,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    peer: SocketAddr,
    #[allow(unused_variables)] fd: RawFd,
) -> Result<Response<Full<Bytes>>, ConnectionFault> {
    if imposter.config.allow_cors {
        if let Some(response) = preflight(&req) {
            return Ok(response);
        }
    }

    let neutral = NeutralRequest::Http(neutral_request(req, peer).await);
    match engine::handle_request(&imposter, &repo, &neutral).await {
        engine::Outcome::Reply { response, .. } => Ok(wire_response(&response)),
        engine::Outcome::Fault { fault } => {
            #[cfg(unix)]
            super::hijack_fault(fd, FaultAction::parse(&fault));
            Err(ConnectionFault)
        }
        engine::Outcome::UpstreamFailure { message } => Ok(error_response(
            StatusCode::BAD_GATEWAY,
            "bad gateway",
            &message,
        )),
        engine::Outcome::ScriptFailure { message } => Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "invalid injection",
            &message,
        )),
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    let body = json!({"errors": [{"code": code, "message": message}]});
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Serialize the resolved response back to the wire.
fn wire_response(resolved: &crate::model::ResolvedResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(resolved.status_code()).unwrap_or(StatusCode::OK),
    );

    let mut has_content_type = false;
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &resolved.headers {
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            has_content_type |= header_name == hyper::header::CONTENT_TYPE;
            match value {
                Value::Array(values) => {
                    for item in values {
                        if let Ok(v) = HeaderValue::from_str(item.as_str().unwrap_or_default()) {
                            headers.append(header_name.clone(), v);
                        }
                    }
                }
                Value::String(s) => {
                    if let Ok(v) = HeaderValue::from_str(s) {
                        headers.insert(header_name, v);
                    }
                }
                other => {
                    if let Ok(v) = HeaderValue::from_str(&other.to_string()) {
                        headers.insert(header_name, v);
                    }
                }
            }
        }
    }

    // a JSON body picks up a JSON content type unless one was configured
    if !has_content_type {
        if let Some(body) = &resolved.body {
            if !body.is_string() {
                builder = builder.header("Content-Type", "application/json");
            }
        }
    }

    let body = match resolved.mode {
        ResponseMode::Binary => base64::engine::general_purpose::STANDARD
            .decode(resolved.body_text())
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from(resolved.body_text())),
        ResponseMode::Text => Bytes::from(resolved.body_text()),
    };

    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// IO wrapper enforcing the connection deadlines hyper itself does not
/// cover: a write that makes no progress for [`WRITE_TIMEOUT`] fails, and a
/// connection with no read/write activity for [`IDLE_TIMEOUT`] is dropped.
/// The read deadline on request heads is hyper's `header_read_timeout`.
struct TimedIo<I> {
    inner: I,
    write_deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    idle: Pin<Box<tokio::time::Sleep>>,
}

impl<I> TimedIo<I> {
    fn new(inner: I) -> Self {
        Self {
            inner,
            write_deadline: None,
            idle: Box::pin(tokio::time::sleep(IDLE_TIMEOUT)),
        }
    }

    fn bump_idle(&mut self) {
        self.idle
            .as_mut()
            .reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
    }
}

fn timeout_error(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string())
}

impl<I: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for TimedIo<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.bump_idle();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(timeout_error("connection idle timeout")));
                }
                Poll::Pending
            }
        }
    }
}

impl<I: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for TimedIo<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                this.bump_idle();
                Poll::Ready(result)
            }
            Poll::Pending => {
                let deadline = this
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(WRITE_TIMEOUT)));
                if deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(timeout_error("write timeout")));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                this.bump_idle();
                Poll::Ready(result)
            }
            Poll::Pending => {
                let deadline = this
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(WRITE_TIMEOUT)));
                if deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(timeout_error("write timeout")));
                }
                Poll::Pending
            }
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.as_mut().get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolvedResponse, StatusField};

    #[test]
    fn test_wire_response_status_and_body() {
        let resolved = ResolvedResponse {
            status: StatusField::Code(418),
            body: Some(json!("short and stout")),
            ..Default::default()
        };
        let response = wire_response(&resolved);
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn test_wire_response_multi_value_header() {
        let mut resolved = ResolvedResponse::default();
        resolved
            .headers
            .insert("Set-Cookie".to_string(), json!(["a=1", "b=2"]));
        let response = wire_response(&resolved);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_wire_response_json_content_type() {
        let resolved = ResolvedResponse {
            body: Some(json!({"ok": true})),
            ..Default::default()
        };
        let response = wire_response(&resolved);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_wire_response_binary_mode_decodes() {
        let resolved = ResolvedResponse {
            body: Some(json!("aGVsbG8=")),
            mode: ResponseMode::Binary,
            ..Default::default()
        };
        let response = wire_response(&resolved);
        // body is the decoded bytes; content-type untouched
        assert!(response.headers().get("content-type").is_none());
    }

    #[test]
    fn test_error_response_taxonomy_body() {
        let response = error_response(StatusCode::BAD_GATEWAY, "bad gateway", "origin down");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_io_idle_timeout() {
        use tokio::io::AsyncReadExt;

        // the peer stays connected but never sends anything
        let (_peer, server) = tokio::io::duplex(64);
        let mut io = TimedIo::new(server);
        let mut buf = [0u8; 8];
        let result = io.read(&mut buf).await;
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::TimedOut
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_io_write_timeout() {
        use tokio::io::AsyncWriteExt;

        // the peer never drains, so the write stalls once the buffer fills
        let (_peer, server) = tokio::io::duplex(8);
        let mut io = TimedIo::new(server);
        let result = io.write_all(&[0u8; 64]).await;
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::TimedOut
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_io_activity_resets_idle() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut peer, server) = tokio::io::duplex(64);
        let mut io = TimedIo::new(server);

        // traffic well past the idle deadline, in under-deadline steps
        for _ in 0..3 {
            tokio::time::sleep(IDLE_TIMEOUT / 2).await;
            peer.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            io.read_exact(&mut buf).await.unwrap();
        }
    }
}
