//! Storage providers for tandem session state.

pub mod in_memory;
pub mod kv_rest;

pub use in_memory::InMemoryStorage;
pub use kv_rest::KvRestStorage;

use std::sync::Arc;
use tandem_config::{StorageBackend, StorageConfig};
use tandem_core::storage::StorageProvider;
use tracing::{info, warn};

/// Build the configured storage provider.
///
/// A `kv` backend with a missing or invalid URL/token falls back to
/// in-memory storage with a warning, so a misconfigured deployment still
/// serves requests (without cross-instance state).
pub fn build_from_config(config: &StorageConfig) -> Arc<dyn StorageProvider> {
    match config.backend {
        StorageBackend::Memory => {
            info!(backend = "memory", "Session storage initialized");
            Arc::new(InMemoryStorage::new())
        }
        StorageBackend::Kv => {
            let url = config.url.as_deref().unwrap_or_default();
            let token = config.token.as_deref().unwrap_or_default();
            match KvRestStorage::new(url, token) {
                Ok(storage) => {
                    info!(backend = "kv", "Session storage initialized");
                    Arc::new(storage)
                }
                Err(e) => {
                    warn!(error = %e, "KV storage misconfigured, falling back to in-memory storage");
                    Arc::new(InMemoryStorage::new())
                }
            }
        }
    }
}
