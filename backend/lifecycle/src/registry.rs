//! Durable `(user, lab) -> Session` mapping over a TTL key-value store.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use labvm_core::{KvStore, LabVmResult, Session, SessionKey};

pub const KEY_PREFIX: &str = "labvm:session:";

/// Safety net for entries whose delete never happened.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn storage_key(key: &SessionKey) -> String {
    format!("{KEY_PREFIX}{}:{}", key.user_id, key.lab_id)
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Undecodable entries are dropped and reported as absent.
    pub async fn get(&self, key: &SessionKey) -> LabVmResult<Option<Session>> {
        let skey = storage_key(key);
        let Some(raw) = self.store.get(&skey).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(key = %skey, error = %e, "Dropping undecodable session entry");
                if let Err(e) = self.store.delete(&skey).await {
                    warn!(key = %skey, error = %e, "Failed to drop undecodable session entry");
                }
                Ok(None)
            }
        }
    }

    /// Atomic overwrite; refreshes the TTL.
    pub async fn put(&self, session: &Session) -> LabVmResult<()> {
        let raw = serde_json::to_string(session).map_err(anyhow::Error::from)?;
        self.store
            .set_with_ttl(&storage_key(&session.key()), &raw, self.ttl)
            .await
    }

    pub async fn delete(&self, key: &SessionKey) -> LabVmResult<bool> {
        self.store.delete(&storage_key(key)).await
    }

    pub async fn list_for_user(&self, user_id: &str) -> LabVmResult<Vec<Session>> {
        let prefix = format!("{KEY_PREFIX}{user_id}:");
        let sessions = self.scan(&prefix).await?;
        // A user id containing ':' can share a prefix with another user.
        Ok(sessions.into_iter().filter(|s| s.user_id == user_id).collect())
    }

    pub async fn list_all(&self) -> LabVmResult<Vec<Session>> {
        self.scan(KEY_PREFIX).await
    }

    async fn scan(&self, prefix: &str) -> LabVmResult<Vec<Session>> {
        let rows = self.store.scan_prefix(prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<Session>(&raw) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable session entry");
                    None
                }
            })
            .collect())
    }
}
