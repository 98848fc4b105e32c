//! Control-plane server.

use crate::admin_api::router::route_request;
use crate::admin_api::types::ApiOptions;
use crate::imposter::ImposterManager;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// The management API server (default port 2525).
pub struct AdminApiServer {
    addr: SocketAddr,
    manager: Arc<ImposterManager>,
    options: Arc<ApiOptions>,
}

impl AdminApiServer {
    pub fn new(addr: SocketAddr, manager: Arc<ImposterManager>, options: ApiOptions) -> Self {
        Self {
            addr,
            manager,
            options: Arc::new(options),
        }
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("control plane listening on http://{}", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let manager = Arc::clone(&self.manager);
            let options = Arc::clone(&self.options);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let manager = Arc::clone(&manager);
                    let options = Arc::clone(&options);
                    async move { route_request(req, manager, options).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("control plane connection error: {e}");
                }
            });
        }
    }
}
