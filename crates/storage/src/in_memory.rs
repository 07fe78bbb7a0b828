//! In-memory storage: the default backend.
//!
//! Values live in process memory and vanish on restart. Only correct for a
//! single server instance; multi-instance deployments need the KV backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::error::StorageError;
use tandem_core::storage::StorageProvider;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// How often a write sweeps expired entries out of the map.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Table {
    entries: HashMap<String, Entry>,
    next_sweep: Instant,
}

impl Table {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        self.next_sweep = now + SWEEP_INTERVAL;
        before - self.entries.len()
    }
}

/// A TTL map guarded by an async `RwLock`.
///
/// Expired entries are invisible to `get` and removed when read. Writes
/// also sweep the whole map at most once per minute, so keys that are
/// never read again do not accumulate.
#[derive(Clone)]
pub struct InMemoryStorage {
    table: Arc<RwLock<Table>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table {
                entries: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            })),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.table.write().await.purge(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        {
            let table = self.table.read().await;
            match table.entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: remove it, unless a writer replaced it in the meantime.
        let mut table = self.table.write().await;
        if table.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            table.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut table = self.table.write().await;
        if now >= table.next_sweep {
            let removed = table.purge(now);
            if removed > 0 {
                debug!(removed, "Swept expired entries");
            }
        }
        table
            .entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.table.write().await.entries.remove(key);
        Ok(())
    }
}
