//! Repository contract the core consumes for imposter storage.

mod filesystem;
mod inmemory;

pub use filesystem::FilesystemRepository;
pub use inmemory::InMemoryRepository;

use crate::imposter::{Imposter, ImposterError, Stub};
use crate::model::NeutralRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Storage for running imposters. The in-memory implementation is the
/// source of truth for runtime state; the filesystem implementation layers
/// persistence on top of it.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn add(&self, imposter: Arc<Imposter>) -> Result<(), ImposterError>;
    async fn get(&self, port: u16) -> Option<Arc<Imposter>>;
    async fn all(&self) -> Vec<Arc<Imposter>>;
    async fn exists(&self, port: u16) -> bool;
    async fn delete(&self, port: u16) -> Option<Arc<Imposter>>;
    async fn delete_all(&self) -> Vec<Arc<Imposter>>;
    /// Replace an imposter's stubs; response cursors reset.
    async fn update_stubs(&self, port: u16, stubs: Vec<Stub>) -> Result<(), ImposterError>;
    /// Insert a stub; `None` appends.
    async fn add_stub(
        &self,
        port: u16,
        stub: Stub,
        index: Option<usize>,
    ) -> Result<(), ImposterError>;
    async fn replace_stub(&self, port: u16, index: usize, stub: Stub)
        -> Result<(), ImposterError>;
    async fn delete_stub(&self, port: u16, index: usize) -> Result<(), ImposterError>;
    async fn clear_requests(&self, port: u16) -> Result<(), ImposterError>;
    async fn add_request(&self, port: u16, request: NeutralRequest) -> Result<(), ImposterError>;
}
