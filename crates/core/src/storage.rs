//! Storage provider trait: the minimal TTL key/value store under session state.
//!
//! Implementations: in-process map (default, single instance only) and a
//! networked REST key/value service for multi-instance deployments.
//! Same-key concurrent writes are last-write-wins here; consistency for
//! session records comes from the session store above this layer.

use crate::error::StorageError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// The backend name (e.g., "memory", "kv").
    fn name(&self) -> &str;

    /// Fetch a value. Missing and expired keys are both `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a value, replacing any previous one. `ttl` of `None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), StorageError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
