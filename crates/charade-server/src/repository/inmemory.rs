//! In-memory repository: a locked map of live imposters.

use super::Repository;
use crate::imposter::{Imposter, ImposterError, Stub};
use crate::model::NeutralRequest;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct InMemoryRepository {
    imposters: RwLock<HashMap<u16, Arc<Imposter>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn require(&self, port: u16) -> Result<Arc<Imposter>, ImposterError> {
        self.imposters
            .read()
            .get(&port)
            .cloned()
            .ok_or(ImposterError::NotFound(port))
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn add(&self, imposter: Arc<Imposter>) -> Result<(), ImposterError> {
        let port = imposter.port();
        let mut imposters = self.imposters.write();
        if imposters.contains_key(&port) {
            return Err(ImposterError::PortInUse(port));
        }
        imposters.insert(port, imposter);
        Ok(())
    }

    async fn get(&self, port: u16) -> Option<Arc<Imposter>> {
        self.imposters.read().get(&port).cloned()
    }

    async fn all(&self) -> Vec<Arc<Imposter>> {
        let mut all: Vec<Arc<Imposter>> = self.imposters.read().values().cloned().collect();
        all.sort_by_key(|i| i.port());
        all
    }

    async fn exists(&self, port: u16) -> bool {
        self.imposters.read().contains_key(&port)
    }

    async fn delete(&self, port: u16) -> Option<Arc<Imposter>> {
        self.imposters.write().remove(&port)
    }

    async fn delete_all(&self) -> Vec<Arc<Imposter>> {
        let mut imposters = self.imposters.write();
        let mut all: Vec<Arc<Imposter>> = imposters.drain().map(|(_, i)| i).collect();
        all.sort_by_key(|i| i.port());
        all
    }

    async fn update_stubs(&self, port: u16, stubs: Vec<Stub>) -> Result<(), ImposterError> {
        self.require(port)?.replace_stubs(stubs);
        Ok(())
    }

    async fn add_stub(
        &self,
        port: u16,
        stub: Stub,
        index: Option<usize>,
    ) -> Result<(), ImposterError> {
        self.require(port)?.add_stub(stub, index);
        Ok(())
    }

    async fn replace_stub(
        &self,
        port: u16,
        index: usize,
        stub: Stub,
    ) -> Result<(), ImposterError> {
        self.require(port)?
            .replace_stub(index, stub)
            .map_err(ImposterError::StubIndexOutOfBounds)
    }

    async fn delete_stub(&self, port: u16, index: usize) -> Result<(), ImposterError> {
        self.require(port)?
            .delete_stub(index)
            .map_err(ImposterError::StubIndexOutOfBounds)
    }

    async fn clear_requests(&self, port: u16) -> Result<(), ImposterError> {
        self.require(port)?.clear_requests();
        Ok(())
    }

    async fn add_request(&self, port: u16, request: NeutralRequest) -> Result<(), ImposterError> {
        self.require(port)?.record_request(request);
        Ok(())
    }
}
