//! Append-only, length-prefixed spool file backing the upload queue.
//!
//! Each record is a 4-byte little-endian length prefix followed by that
//! many bytes of JSON. The file is replayed front-to-back on construction
//! to reconstruct in-memory state, then every subsequent mutation is
//! appended rather than rewriting the file, so a crash mid-write loses at
//! most the last unflushed record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::HsiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SpoolRecord<T> {
    Upsert(String, T),
    Remove(String),
}

/// A per-file-locked append-only log of `(id, item)` pairs, replayed into
/// a `HashMap` on load.
pub struct SpoolFile<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> SpoolFile<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Replay the file at `path` (creating it if absent) and return both
    /// the handle and the reconstructed item map.
    pub async fn load(path: impl AsRef<Path>) -> Result<(Self, HashMap<String, T>), HsiError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        }

        let mut state = HashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut offset = 0usize;
                while offset + 4 <= bytes.len() {
                    let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
                    offset += 4;
                    if offset + len > bytes.len() {
                        break;
                    }
                    let record: SpoolRecord<T> = serde_json::from_slice(&bytes[offset..offset + len])?;
                    offset += len;
                    match record {
                        SpoolRecord::Upsert(id, item) => {
                            state.insert(id, item);
                        }
                        SpoolRecord::Remove(id) => {
                            state.remove(&id);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HsiError::DeviceStorageFailure(e.to_string())),
        }

        Ok((
            Self {
                path,
                lock: Mutex::new(()),
                _marker: std::marker::PhantomData,
            },
            state,
        ))
    }

    pub async fn upsert(&self, id: &str, item: &T) -> Result<(), HsiError> {
        self.append(&SpoolRecord::Upsert(id.to_string(), item.clone())).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), HsiError> {
        self.append(&SpoolRecord::Remove(id.to_string())).await
    }

    /// Truncate the spool entirely (used by `clearQueue`).
    pub async fn clear(&self) -> Result<(), HsiError> {
        let _guard = self.lock.lock().await;
        tokio::fs::write(&self.path, [])
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))
    }

    async fn append(&self, record: &SpoolRecord<T>) -> Result<(), HsiError> {
        let payload = serde_json::to_vec(record)?;
        let len = (payload.len() as u32).to_le_bytes();

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        file.write_all(&len)
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        file.write_all(&payload)
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Item {
        value: i32,
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("synheart-spool-test-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn upsert_then_reload_reconstructs_state() {
        let path = temp_path("upsert");
        let _ = tokio::fs::remove_file(&path).await;

        let (spool, initial) = SpoolFile::<Item>::load(&path).await.unwrap();
        assert!(initial.is_empty());
        spool.upsert("a", &Item { value: 1 }).await.unwrap();
        spool.upsert("b", &Item { value: 2 }).await.unwrap();

        let (_spool2, reloaded) = SpoolFile::<Item>::load(&path).await.unwrap();
        assert_eq!(reloaded.get("a"), Some(&Item { value: 1 }));
        assert_eq!(reloaded.get("b"), Some(&Item { value: 2 }));
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn remove_drops_item_on_reload() {
        let path = temp_path("remove");
        let _ = tokio::fs::remove_file(&path).await;

        let (spool, _) = SpoolFile::<Item>::load(&path).await.unwrap();
        spool.upsert("a", &Item { value: 1 }).await.unwrap();
        spool.remove("a").await.unwrap();

        let (_spool2, reloaded) = SpoolFile::<Item>::load(&path).await.unwrap();
        assert!(reloaded.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn clear_empties_the_spool() {
        let path = temp_path("clear");
        let _ = tokio::fs::remove_file(&path).await;

        let (spool, _) = SpoolFile::<Item>::load(&path).await.unwrap();
        spool.upsert("a", &Item { value: 1 }).await.unwrap();
        spool.clear().await.unwrap();

        let (_spool2, reloaded) = SpoolFile::<Item>::load(&path).await.unwrap();
        assert!(reloaded.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }
}
