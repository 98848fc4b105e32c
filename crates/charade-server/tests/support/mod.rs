//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use charade_server::admin_api::{AdminApiServer, ApiOptions};
use charade_server::imposter::ImposterManager;
use charade_server::repository::InMemoryRepository;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Boot a control plane on the given port and wait for it to accept.
pub async fn start_control_plane(port: u16) -> Arc<ImposterManager> {
    init();
    let repo = Arc::new(InMemoryRepository::new());
    let manager = Arc::new(ImposterManager::new(repo, port));
    let options = ApiOptions {
        port,
        origin: None,
        allow_injection: true,
    };
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let server = AdminApiServer::new(addr, Arc::clone(&manager), options);
    tokio::spawn(server.run());
    wait_for_port(port).await;
    manager
}

/// Wait (max ~2s) until something is listening on the port.
pub async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("port {port} never came up");
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub fn control_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{port}{path}")
}

/// A bare-bones HTTP origin that counts hits and answers with a
/// distinguishable body per hit. Used by the proxy recording tests.
pub async fn start_counting_origin(port: u16) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&counter);
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let mut buffer = [0u8; 4096];
                let mut received = Vec::new();
                // read until the end of the request head
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) => return,
                        Ok(n) => {
                            received.extend_from_slice(&buffer[..n]);
                            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
                let body = format!("origin-hit-{hit}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Origin: fixture\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    wait_for_port(port).await;
    counter
}
