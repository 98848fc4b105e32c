//! Filesystem repository: per-port directories layered over the in-memory
//! store.
//!
//! Layout under the data directory:
//!
//! ```text
//! <root>/<port>/imposter.json   -- config with the current stub list
//! <root>/<port>/requests.json   -- recorded requests
//! ```

use super::{InMemoryRepository, Repository};
use crate::imposter::{Imposter, ImposterConfig, ImposterError, Stub};
use crate::model::NeutralRequest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct FilesystemRepository {
    inner: InMemoryRepository,
    root: PathBuf,
}

impl FilesystemRepository {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            inner: InMemoryRepository::new(),
            root,
        })
    }

    fn port_dir(&self, port: u16) -> PathBuf {
        self.root.join(port.to_string())
    }

    /// Imposter configs found in the data directory, for restoring at boot.
    pub fn load_configs(root: &Path) -> Vec<ImposterConfig> {
        let mut configs = Vec::new();
        let Ok(entries) = std::fs::read_dir(root) else {
            return configs;
        };
        for entry in entries.flatten() {
            let file = entry.path().join("imposter.json");
            if !file.is_file() {
                continue;
            }
            match std::fs::read_to_string(&file)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
            {
                Ok(config) => configs.push(config),
                Err(e) => warn!("skipping unreadable imposter file {file:?}: {e}"),
            }
        }
        configs.sort_by_key(|c: &ImposterConfig| c.port);
        configs
    }

    fn persist_imposter(&self, imposter: &Imposter) {
        let mut config = imposter.config.clone();
        config.stubs = imposter.stubs();
        let dir = self.port_dir(imposter.port());
        let write = std::fs::create_dir_all(&dir).and_then(|_| {
            let json = serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string());
            std::fs::write(dir.join("imposter.json"), json)
        });
        if let Err(e) = write {
            error!(port = imposter.port(), "failed to persist imposter: {e}");
        }
    }

    fn persist_requests(&self, imposter: &Imposter) {
        let dir = self.port_dir(imposter.port());
        let json = serde_json::to_string_pretty(&imposter.requests())
            .unwrap_or_else(|_| "[]".to_string());
        if let Err(e) =
            std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(dir.join("requests.json"), json))
        {
            error!(port = imposter.port(), "failed to persist requests: {e}");
        }
    }

    fn remove_dir(&self, port: u16) {
        let dir = self.port_dir(port);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                error!(port, "failed to remove imposter directory: {e}");
            }
        }
    }

    async fn persist_stubs(&self, port: u16) {
        if let Some(imposter) = self.inner.get(port).await {
            self.persist_imposter(&imposter);
        }
    }
}

#[async_trait]
impl Repository for FilesystemRepository {
    async fn add(&self, imposter: Arc<Imposter>) -> Result<(), ImposterError> {
        self.inner.add(Arc::clone(&imposter)).await?;
        self.persist_imposter(&imposter);
        info!(port = imposter.port(), "imposter persisted");
        Ok(())
    }

    async fn get(&self, port: u16) -> Option<Arc<Imposter>> {
        self.inner.get(port).await
    }

    async fn all(&self) -> Vec<Arc<Imposter>> {
        self.inner.all().await
    }

    async fn exists(&self, port: u16) -> bool {
        self.inner.exists(port).await
    }

    async fn delete(&self, port: u16) -> Option<Arc<Imposter>> {
        let removed = self.inner.delete(port).await;
        if removed.is_some() {
            self.remove_dir(port);
        }
        removed
    }

    async fn delete_all(&self) -> Vec<Arc<Imposter>> {
        let removed = self.inner.delete_all().await;
        for imposter in &removed {
            self.remove_dir(imposter.port());
        }
        removed
    }

    async fn update_stubs(&self, port: u16, stubs: Vec<Stub>) -> Result<(), ImposterError> {
        self.inner.update_stubs(port, stubs).await?;
        self.persist_stubs(port).await;
        Ok(())
    }

    async fn add_stub(
        &self,
        port: u16,
        stub: Stub,
        index: Option<usize>,
    ) -> Result<(), ImposterError> {
        self.inner.add_stub(port, stub, index).await?;
        self.persist_stubs(port).await;
        Ok(())
    }

    async fn replace_stub(
        &self,
        port: u16,
        index: usize,
        stub: Stub,
    ) -> Result<(), ImposterError> {
        self.inner.replace_stub(port, index, stub).await?;
        self.persist_stubs(port).await;
        Ok(())
    }

    async fn delete_stub(&self, port: u16, index: usize) -> Result<(), ImposterError> {
        self.inner.delete_stub(port, index).await?;
        self.persist_stubs(port).await;
        Ok(())
    }

    async fn clear_requests(&self, port: u16) -> Result<(), ImposterError> {
        self.inner.clear_requests(port).await?;
        if let Some(imposter) = self.inner.get(port).await {
            self.persist_requests(&imposter);
        }
        Ok(())
    }

    async fn add_request(&self, port: u16, request: NeutralRequest) -> Result<(), ImposterError> {
        self.inner.add_request(port, request).await?;
        if let Some(imposter) = self.inner.get(port).await {
            if imposter.config.record_requests {
                self.persist_requests(&imposter);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn imposter(port: u16) -> Arc<Imposter> {
        let config: ImposterConfig = serde_json::from_value(json!({
            "port": port,
            "protocol": "http",
            "stubs": [{"responses": [{"is": {"body": "persisted"}}]}]
        }))
        .unwrap();
        Arc::new(Imposter::new(config))
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemRepository::new(dir.path()).unwrap();
        repo.add(imposter(7100)).await.unwrap();

        let configs = FilesystemRepository::load_configs(dir.path());
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].port, Some(7100));
        assert_eq!(configs[0].stubs.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemRepository::new(dir.path()).unwrap();
        repo.add(imposter(7101)).await.unwrap();
        assert!(dir.path().join("7101").exists());
        repo.delete(7101).await.unwrap();
        assert!(!dir.path().join("7101").exists());
    }

    #[tokio::test]
    async fn test_stub_mutation_rewrites_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemRepository::new(dir.path()).unwrap();
        repo.add(imposter(7102)).await.unwrap();
        repo.update_stubs(7102, vec![]).await.unwrap();

        let configs = FilesystemRepository::load_configs(dir.path());
        assert!(configs[0].stubs.is_empty());
    }
}
