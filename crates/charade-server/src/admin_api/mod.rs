//! The REST control plane imposters are managed through.

mod handlers;
mod router;
mod server;
mod types;

pub use server::AdminApiServer;
pub use types::{ApiOptions, ViewOptions};
