//! Local secure storage boundary.
//!
//! [`SecureStore`] is the trait every on-device persistence need (consent
//! snapshots, consent tokens, baselines, the upload queue's spool) goes
//! through. [`encrypted_file::EncryptedFileStore`] is the production,
//! AES-256-GCM-backed implementation; [`InMemoryStore`] backs unit tests.

pub mod encrypted_file;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::HsiError;

pub use encrypted_file::EncryptedFileStore;

/// Key-value byte storage with read-modify-write semantics good enough for
/// small, infrequently-written records (consent state, tokens, baselines).
/// Not intended for the upload spool's append-heavy log, which uses
/// [`crate::upload::persist::SpoolFile`] directly.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HsiError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), HsiError>;
    async fn delete(&self, key: &str) -> Result<(), HsiError>;
}

/// In-memory [`SecureStore`] used by tests and by the demo CLI when no
/// on-device keystore is configured.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HsiError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), HsiError> {
        self.data
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HsiError> {
        self.data.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.put("k", b"v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
