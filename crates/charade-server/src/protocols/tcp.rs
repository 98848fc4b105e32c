//! TCP imposter server.
//!
//! One task per connection; a connection can carry many requests. Text
//! mode frames on newline boundaries, binary mode treats whatever arrived
//! as a complete request, and an `endOfRequestResolver` script overrides
//! both: it sees the accumulated text (base64 in binary mode) after every
//! read and a truthy return closes the frame.

use super::ServerHandle;
use crate::imposter::{engine, FaultAction, Imposter, ImposterError, TcpMode};
use crate::model::{NeutralRequest, TcpRequest};
use crate::repository::Repository;
use crate::scripting;
use base64::Engine as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub(super) async fn start(
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
) -> Result<ServerHandle, ImposterError> {
    let port = imposter.port();
    let addr = super::bind_addr(&imposter.config);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ImposterError::BindFailed(port, e.to_string()))?;
    info!(port, mode = ?imposter.config.tcp_mode(), "tcp imposter listening");

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let accept_cancel = cancel.clone();
    let accept_tracker = tracker.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let imposter = Arc::clone(&imposter);
                        let repo = Arc::clone(&repo);
                        let cancel = accept_cancel.clone();
                        accept_tracker.spawn(async move {
                            session(stream, peer, imposter, repo, cancel).await;
                        });
                    }
                    Err(e) => error!(port, "accept error: {e}"),
                }
            }
        }
    });

    Ok(ServerHandle::new(port, cancel, tracker, accept_task))
}

fn encode(mode: TcpMode, bytes: &[u8]) -> String {
    match mode {
        TcpMode::Text => String::from_utf8_lossy(bytes).into_owned(),
        TcpMode::Binary => base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

async fn session(
    mut stream: TcpStream,
    peer: SocketAddr,
    imposter: Arc<Imposter>,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
) {
    let mode = imposter.config.tcp_mode();
    let resolver = imposter.config.end_of_request_resolver.clone();
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stream.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => {
                // connection closed; whatever is buffered is the last frame
                if !buffer.is_empty() {
                    let frame = std::mem::take(&mut buffer);
                    respond(&mut stream, &frame, mode, &imposter, &repo, peer).await;
                }
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(port = imposter.port(), "read error: {e}");
                return;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(resolver) = &resolver {
            let accumulated = encode(mode, &buffer);
            match scripting::eval_end_of_request(&resolver.inject, &accumulated, imposter.port())
            {
                Ok(true) => {
                    let frame = std::mem::take(&mut buffer);
                    if !respond(&mut stream, &frame, mode, &imposter, &repo, peer).await {
                        return;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(port = imposter.port(), "end-of-request resolver failed: {e}");
                    return;
                }
            }
        } else {
            match mode {
                TcpMode::Text => {
                    // frame per newline; a partial line stays buffered
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let frame: Vec<u8> = buffer.drain(..=pos).collect();
                        if !respond(&mut stream, &frame, mode, &imposter, &repo, peer).await {
                            return;
                        }
                    }
                }
                TcpMode::Binary => {
                    let frame = std::mem::take(&mut buffer);
                    if !respond(&mut stream, &frame, mode, &imposter, &repo, peer).await {
                        return;
                    }
                }
            }
        }
    }
}

/// Handle one framed request; returns false when the session must close.
async fn respond(
    stream: &mut TcpStream,
    frame: &[u8],
    mode: TcpMode,
    imposter: &Arc<Imposter>,
    repo: &Arc<dyn Repository>,
    peer: SocketAddr,
) -> bool {
    let payload = match mode {
        // strip the framing newline from the recorded data
        TcpMode::Text => {
            let mut end = frame.len();
            while end > 0 && (frame[end - 1] == b'\n' || frame[end - 1] == b'\r') {
                end -= 1;
            }
            &frame[..end]
        }
        TcpMode::Binary => frame,
    };

    let request = NeutralRequest::Tcp(TcpRequest {
        request_from: peer.to_string(),
        data: encode(mode, payload),
        timestamp: chrono::Utc::now().to_rfc3339(),
    });

    match engine::handle_request(imposter, repo, &request).await {
        engine::Outcome::Reply { response, .. } => {
            let out = response
                .data
                .clone()
                .unwrap_or_else(|| response.body_text());
            if out.is_empty() {
                return true;
            }
            let bytes = match mode {
                TcpMode::Binary => base64::engine::general_purpose::STANDARD
                    .decode(&out)
                    .unwrap_or_else(|_| out.into_bytes()),
                TcpMode::Text => out.into_bytes(),
            };
            stream.write_all(&bytes).await.is_ok()
        }
        engine::Outcome::Fault { fault } => {
            match FaultAction::parse(&fault) {
                FaultAction::Reset => {
                    let _ = stream.set_linger(Some(Duration::from_secs(0)));
                }
                FaultAction::RandomData => {
                    let _ = stream.write_all(&super::random_close_payload()).await;
                }
                FaultAction::Close => {}
            }
            false
        }
        engine::Outcome::UpstreamFailure { message } => {
            warn!(port = imposter.port(), "closing session on upstream failure: {message}");
            false
        }
        engine::Outcome::ScriptFailure { message } => {
            warn!(port = imposter.port(), "closing session on script failure: {message}");
            false
        }
    }
}
