use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::user::Identity;

/// External backends never keep an entry longer than this, whatever the
/// refresh token claims.
pub const MAX_STORE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no entry for session key")]
    Missing,
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Capability set every refresh-token backend provides. Implementations are
/// thread-safe by contract; the proxy does not synchronize above them.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    async fn put(&self, key: &str, ciphertext: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<String, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Store keys are a digest of subject and token id, so raw identifiers never
/// reach the backend.
pub fn session_key(identity: &Identity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.subject.as_bytes());
    hasher.update(b"|");
    hasher.update(identity.jti().unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Select a backend from the `store_url` scheme. Only the in-process map is
/// built in; network KV backends plug in behind [`RefreshStore`].
pub fn from_url(store_url: &str) -> Result<Arc<dyn RefreshStore>, StoreError> {
    let parsed = url::Url::parse(store_url)
        .map_err(|err| StoreError::Backend(format!("invalid store url: {err}")))?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(MemoryStore::default())),
        other => Err(StoreError::Backend(format!(
            "unsupported store scheme {other:?}"
        ))),
    }
}

struct Entry {
    ciphertext: String,
    deadline: Instant,
}

/// Process-local map with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

#[async_trait]
impl RefreshStore for MemoryStore {
    async fn put(&self, key: &str, ciphertext: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.write().await.insert(
            key.to_owned(),
            Entry {
                ciphertext: ciphertext.to_owned(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.deadline > Instant::now() => Ok(entry.ciphertext.clone()),
            Some(_) => {
                entries.remove(key);
                Err(StoreError::Missing)
            }
            None => Err(StoreError::Missing),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
