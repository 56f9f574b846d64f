use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use labvm_core::{KvStore, LabVmError, LabVmResult};

struct Slot {
    value: String,
    expires_at: Instant,
}

/// TTL map guarded by an async lock. Expired entries are invisible to reads
/// and dropped lazily, or in bulk by `purge_expired`.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, Slot>>,
    offline: std::sync::atomic::AtomicBool,
    read_only: std::sync::atomic::AtomicBool,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backing service.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    /// Keep serving reads but refuse writes and deletes.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, std::sync::atomic::Ordering::SeqCst);
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, slot| slot.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|s| s.expires_at > now).count()
    }

    fn check_online(&self) -> LabVmResult<()> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LabVmError::RegistryUnavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> LabVmResult<()> {
        self.check_online()?;
        if self.read_only.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LabVmError::RegistryUnavailable("in-memory store is read-only".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> LabVmResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(slot) if slot.expires_at > now => return Ok(Some(slot.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it unless it was rewritten in the meantime.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|s| s.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> LabVmResult<()> {
        self.check_writable()?;
        let slot = Slot {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> LabVmResult<bool> {
        self.check_writable()?;
        let now = Instant::now();
        Ok(self
            .entries
            .write()
            .await
            .remove(key)
            .is_some_and(|s| s.expires_at > now))
    }

    async fn scan_prefix(&self, prefix: &str) -> LabVmResult<Vec<(String, String)>> {
        self.check_online()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut rows: Vec<(String, String)> = entries
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.expires_at > now)
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect();
        rows.sort();
        Ok(rows)
    }
}
