use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::lock::LeaseStore;

/// Shared in-process lease table with real TTL semantics. Multiple
/// [`MemoryLeaseStore`] nodes over one backend behave like a cluster sharing
/// one Redis, which is exactly what multi-node tests need.
#[derive(Debug, Default)]
pub struct MemoryLeaseBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl MemoryLeaseBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current value of an unexpired key.
    pub fn value_of(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("lease backend poisoned");
        Self::purge_expired(&mut entries, key);
        entries.get(key).map(|e| e.value.clone())
    }

    /// Remaining TTL of an unexpired key.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().expect("lease backend poisoned");
        Self::purge_expired(&mut entries, key);
        entries
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Insert a key directly, as if a foreign (possibly crashed) node held
    /// it. Test hook.
    pub fn put(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().expect("lease backend poisoned").insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().expect("lease backend poisoned");
        Self::purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    fn delete_if_value(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.lock().expect("lease backend poisoned");
        Self::purge_expired(&mut entries, key);
        match entries.get(key) {
            Some(entry) if entry.value == value => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    fn expire_if_value(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().expect("lease backend poisoned");
        Self::purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) if entry.value == value => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        if let Some(entry) = entries.get(key) {
            if entry.expires_at <= Instant::now() {
                entries.remove(key);
            }
        }
    }
}

/// One node's view of a [`MemoryLeaseBackend`]. Mirrors the Redis adapter:
/// same key schema, same value schema, same owner-checked semantics.
pub struct MemoryLeaseStore {
    backend: Arc<MemoryLeaseBackend>,
    node_id: String,
    key_prefix: String,
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLeaseStore {
    pub fn new(backend: Arc<MemoryLeaseBackend>, node_id: &str, key_prefix: &str) -> Self {
        Self {
            backend,
            node_id: node_id.to_string(),
            key_prefix: key_prefix.to_string(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lease_key(&self, job: &str) -> String {
        format!("{}job:{}", self.key_prefix, job)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(&self, job: &str, ttl: Duration) -> Result<bool> {
        let key = self.lease_key(job);
        let value = format!("{}:{}", self.node_id, Uuid::new_v4());
        let acquired = self.backend.set_if_absent(&key, &value, ttl);
        if acquired {
            self.held
                .lock()
                .expect("lease table poisoned")
                .insert(job.to_string(), value);
        }
        Ok(acquired)
    }

    async fn release(&self, job: &str) -> Result<()> {
        let value = match self
            .held
            .lock()
            .expect("lease table poisoned")
            .remove(job)
        {
            Some(value) => value,
            None => return Ok(()),
        };
        self.backend.delete_if_value(&self.lease_key(job), &value);
        Ok(())
    }

    async fn extend(&self, job: &str, ttl: Duration) -> Result<bool> {
        let value = match self
            .held
            .lock()
            .expect("lease table poisoned")
            .get(job)
            .cloned()
        {
            Some(value) => value,
            None => return Ok(false),
        };
        Ok(self
            .backend
            .expire_if_value(&self.lease_key(job), &value, ttl))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
