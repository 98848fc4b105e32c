//! Protocol servers for imposters.
//!
//! Each protocol owns one accept loop; HTTP(S) dispatches a task per
//! request, TCP and SMTP a task per connection. Built-in protocols are
//! looked up through [`lookup`], so a protocol module is swappable behind
//! the same capability.

pub mod http;
pub mod smtp;
pub mod tcp;
pub mod tls;

use crate::imposter::{FaultAction, Imposter, ImposterConfig, ImposterError};
use crate::repository::Repository;
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Drain deadline when stopping a single imposter.
pub const STOP_DEADLINE: Duration = Duration::from_secs(5);
/// Drain deadline when stopping everything.
pub const STOP_ALL_DEADLINE: Duration = Duration::from_secs(10);

/// A running protocol server: the accept task plus the tracker of its
/// in-flight connection tasks.
pub struct ServerHandle {
    port: u16,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn new(
        port: u16,
        cancel: CancellationToken,
        tracker: TaskTracker,
        accept_task: JoinHandle<()>,
    ) -> Self {
        Self {
            port,
            cancel,
            tracker,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, then wait for in-flight work up to the deadline.
    /// A missed deadline is logged, never fatal.
    pub async fn stop(self, deadline: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(port = self.port, "drain deadline elapsed, abandoning tasks");
        }
        self.accept_task.abort();
    }
}

/// The protocol capability: validation at creation time plus server
/// construction.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, _config: &ImposterConfig) -> Result<(), ImposterError> {
        Ok(())
    }

    async fn start(
        &self,
        imposter: Arc<Imposter>,
        repo: Arc<dyn Repository>,
    ) -> Result<ServerHandle, ImposterError>;
}

struct HttpProtocol;
struct HttpsProtocol;
struct TcpProtocol;
struct SmtpProtocol;

#[async_trait]
impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(
        &self,
        imposter: Arc<Imposter>,
        repo: Arc<dyn Repository>,
    ) -> Result<ServerHandle, ImposterError> {
        http::start(imposter, repo, None).await
    }
}

#[async_trait]
impl Protocol for HttpsProtocol {
    fn name(&self) -> &'static str {
        "https"
    }

    fn validate(&self, config: &ImposterConfig) -> Result<(), ImposterError> {
        if config.cert.is_some() != config.key.is_some() {
            return Err(ImposterError::BadData(
                "cert and key must be provided together".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(
        &self,
        imposter: Arc<Imposter>,
        repo: Arc<dyn Repository>,
    ) -> Result<ServerHandle, ImposterError> {
        let material = tls::build(&imposter.config).map_err(|e| {
            ImposterError::BadData(format!("invalid TLS configuration: {e:#}"))
        })?;
        let _ = imposter.cert_fingerprint.set(material.fingerprint.clone());
        http::start(imposter, repo, Some(material.acceptor)).await
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn start(
        &self,
        imposter: Arc<Imposter>,
        repo: Arc<dyn Repository>,
    ) -> Result<ServerHandle, ImposterError> {
        tcp::start(imposter, repo).await
    }
}

#[async_trait]
impl Protocol for SmtpProtocol {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn start(
        &self,
        imposter: Arc<Imposter>,
        repo: Arc<dyn Repository>,
    ) -> Result<ServerHandle, ImposterError> {
        smtp::start(imposter, repo).await
    }
}

static PROTOCOLS: &[&(dyn Protocol)] = &[&HttpProtocol, &HttpsProtocol, &TcpProtocol, &SmtpProtocol];

/// Look up a registered protocol by name.
pub fn lookup(name: &str) -> Option<&'static dyn Protocol> {
    PROTOCOLS.iter().copied().find(|p| p.name() == name)
}

/// The bind address for an imposter: configured host or all interfaces.
pub(crate) fn bind_addr(config: &ImposterConfig) -> String {
    let host = config.host.as_deref().unwrap_or("0.0.0.0");
    format!("{}:{}", host, config.port.unwrap_or(0))
}

/// Deterministic pseudo-random payload for the random-data-then-close
/// fault. Fixed seed so tests can assert the exact bytes.
pub fn random_close_payload() -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    (0..1024).map(|_| rng.gen()).collect()
}

/// Apply a fault action to a raw socket that some other component (hyper)
/// still owns. Reset only arms SO_LINGER 0 so that the impending close
/// turns into an RST; the fd itself stays owned by the stream.
#[cfg(unix)]
pub(crate) fn hijack_fault(fd: std::os::fd::RawFd, action: FaultAction) {
    use std::io::Write;
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;

    let socket = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(fd) });
    match action {
        FaultAction::Reset => {
            let _ = socket.set_linger(Some(Duration::from_secs(0)));
        }
        FaultAction::RandomData => {
            let _ = (&*socket).write_all(&random_close_payload());
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        FaultAction::Close => {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
}
