//! Session store: the single sanctioned path for reading and writing
//! `OrchestrationState` records.
//!
//! Writes go through [`SessionStore::update_state`], which holds a
//! per-session lock across read → mutate → write. Concurrent updates to one
//! session within this process therefore never lose each other's changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::error::StorageError;
use tandem_core::session::OrchestrationState;
use tandem_core::storage::StorageProvider;
use tracing::{debug, warn};

pub const DEFAULT_KEY_PREFIX: &str = "orchestration:session:";

type SessionLock = Arc<tokio::sync::Mutex<()>>;

pub struct SessionStore {
    storage: Arc<dyn StorageProvider>,
    ttl: Duration,
    key_prefix: String,
    locks: Mutex<HashMap<String, SessionLock>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageProvider>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn storage_name(&self) -> &str {
        self.storage.name()
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }

    /// Load a session. Missing, expired, and unreadable records are all `None`.
    pub async fn get_state(
        &self,
        session_id: &str,
    ) -> Result<Option<OrchestrationState>, StorageError> {
        let Some(raw) = self.storage.get(&self.key(session_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(session_id, error = %e, "Discarding unreadable session record");
                Ok(None)
            }
        }
    }

    /// Atomically replace a session's state with `mutator(current)`.
    ///
    /// `mutator` receives the stored state, or a fresh one when absent. The
    /// result is stamped with `session_id` and the current time and written
    /// with a refreshed TTL.
    pub async fn update_state<F>(
        &self,
        session_id: &str,
        mutator: F,
    ) -> Result<OrchestrationState, StorageError>
    where
        F: FnOnce(OrchestrationState) -> OrchestrationState + Send,
    {
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.read_modify_write(session_id, mutator).await
        };
        self.release_lock(session_id, lock);
        result
    }

    async fn read_modify_write<F>(
        &self,
        session_id: &str,
        mutator: F,
    ) -> Result<OrchestrationState, StorageError>
    where
        F: FnOnce(OrchestrationState) -> OrchestrationState + Send,
    {
        let current = self
            .get_state(session_id)
            .await?
            .unwrap_or_else(|| OrchestrationState::fresh(session_id));
        let previous_time = current.last_update_time;

        let mut next = mutator(current);
        next.session_id = session_id.to_string();
        next.last_update_time = next.last_update_time.max(previous_time);
        next.touch();

        let raw = serde_json::to_string(&next)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage
            .set(&self.key(session_id), raw, Some(self.ttl))
            .await?;
        debug!(session_id, "Session state updated");
        Ok(next)
    }

    /// Delete a session's record.
    pub async fn reset_state(&self, session_id: &str) -> Result<(), StorageError> {
        self.storage.delete(&self.key(session_id)).await
    }

    fn lock_for(&self, session_id: &str) -> SessionLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once no other caller holds it.
    fn release_lock(&self, session_id: &str, lock: SessionLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
