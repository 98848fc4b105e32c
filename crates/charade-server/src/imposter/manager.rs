//! Imposter lifecycle: start, stop, collision detection, graceful drain.

use super::core::Imposter;
use super::types::{ImposterConfig, ImposterError};
use crate::protocols::{self, ServerHandle, STOP_ALL_DEADLINE, STOP_DEADLINE};
use crate::repository::Repository;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns the `port -> running server` map. The repository is the source of
/// truth for imposter state; this only manages the listeners.
pub struct ImposterManager {
    servers: RwLock<HashMap<u16, ServerHandle>>,
    repo: Arc<dyn Repository>,
    control_port: u16,
}

impl ImposterManager {
    pub fn new(repo: Arc<dyn Repository>, control_port: u16) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            repo,
            control_port,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Validate, store and start an imposter. A failed bind removes the
    /// imposter from the repository again.
    pub async fn start(&self, config: ImposterConfig) -> Result<Arc<Imposter>, ImposterError> {
        let port = config
            .port
            .filter(|p| *p != 0)
            .ok_or_else(|| ImposterError::BadData("port is required (1..65535)".to_string()))?;

        let protocol = protocols::lookup(&config.protocol)
            .ok_or_else(|| ImposterError::InvalidProtocol(config.protocol.clone()))?;
        protocol.validate(&config)?;

        if port == self.control_port {
            return Err(ImposterError::PortInUse(port));
        }
        if self.servers.read().contains_key(&port) {
            return Err(ImposterError::PortInUse(port));
        }

        let imposter = Arc::new(Imposter::new(config));
        // the repository insert is the atomic claim on the port
        self.repo.add(Arc::clone(&imposter)).await?;

        match protocol
            .start(Arc::clone(&imposter), Arc::clone(&self.repo))
            .await
        {
            Ok(handle) => {
                self.servers.write().insert(port, handle);
                info!(port, protocol = protocol.name(), "imposter started");
                Ok(imposter)
            }
            Err(e) => {
                self.repo.delete(port).await;
                Err(e)
            }
        }
    }

    /// Stop one imposter, draining in-flight work. Returns the stopped
    /// imposter, if any; stopping an unknown port is a no-op.
    pub async fn stop(&self, port: u16) -> Option<Arc<Imposter>> {
        let handle = self.servers.write().remove(&port);
        if let Some(handle) = handle {
            handle.stop(STOP_DEADLINE).await;
            info!(port, "imposter stopped");
        }
        self.repo.delete(port).await
    }

    /// Stop everything concurrently under the global drain deadline.
    pub async fn stop_all(&self) -> Vec<Arc<Imposter>> {
        let handles: Vec<ServerHandle> = {
            let mut servers = self.servers.write();
            servers.drain().map(|(_, handle)| handle).collect()
        };
        futures::future::join_all(
            handles
                .into_iter()
                .map(|handle| handle.stop(STOP_ALL_DEADLINE)),
        )
        .await;
        self.repo.delete_all().await
    }

    pub async fn get(&self, port: u16) -> Option<Arc<Imposter>> {
        self.repo.get(port).await
    }

    pub async fn all(&self) -> Vec<Arc<Imposter>> {
        self.repo.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use serde_json::json;

    fn manager() -> ImposterManager {
        ImposterManager::new(Arc::new(InMemoryRepository::new()), 2525)
    }

    fn config(port: u16, protocol: &str) -> ImposterConfig {
        serde_json::from_value(json!({
            "port": port,
            "protocol": protocol,
            "host": "127.0.0.1"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = manager();
        manager.start(config(10180, "http")).await.unwrap();
        assert!(manager.get(10180).await.is_some());
        assert!(manager.stop(10180).await.is_some());
        assert!(manager.get(10180).await.is_none());
        assert!(manager.stop(10180).await.is_none());
    }

    #[tokio::test]
    async fn test_port_collision_detected() {
        let manager = manager();
        manager.start(config(10181, "http")).await.unwrap();
        let err = manager.start(config(10181, "tcp")).await.unwrap_err();
        assert!(matches!(err, ImposterError::PortInUse(10181)));
        // the original imposter is untouched
        assert!(manager.get(10181).await.is_some());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_control_port_protected() {
        let manager = manager();
        let err = manager.start(config(2525, "http")).await.unwrap_err();
        assert!(matches!(err, ImposterError::PortInUse(2525)));
    }

    #[tokio::test]
    async fn test_invalid_protocol_rejected() {
        let manager = manager();
        let err = manager.start(config(10182, "gopher")).await.unwrap_err();
        assert!(matches!(err, ImposterError::InvalidProtocol(_)));
        assert!(manager.get(10182).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_port_rejected() {
        let manager = manager();
        let config: ImposterConfig =
            serde_json::from_value(json!({"protocol": "http"})).unwrap();
        let err = manager.start(config).await.unwrap_err();
        assert!(matches!(err, ImposterError::BadData(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_removes_from_repository() {
        let manager = manager();
        manager.start(config(10183, "http")).await.unwrap();
        // second manager instance, same repo port but the OS socket is taken
        let other = ImposterManager::new(Arc::new(InMemoryRepository::new()), 2525);
        let err = other.start(config(10183, "http")).await.unwrap_err();
        assert!(matches!(err, ImposterError::BindFailed(10183, _)));
        assert!(other.get(10183).await.is_none());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_drains_everything() {
        let manager = manager();
        manager.start(config(10184, "http")).await.unwrap();
        manager.start(config(10185, "tcp")).await.unwrap();
        let stopped = manager.stop_all().await;
        assert_eq!(stopped.len(), 2);
        assert!(manager.all().await.is_empty());
    }
}
