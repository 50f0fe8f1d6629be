//! AES-256-GCM file-backed [`super::SecureStore`].
//!
//! Each key is one file under the store's base directory, holding a JSON
//! envelope of base64 ciphertext + nonce + salt. The encryption key is
//! derived per-entry from the device passphrase with PBKDF2-HMAC-SHA256,
//! salted with random bytes generated at write time (never reused across
//! entries).

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use directories::ProjectDirs;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::HsiError;

use super::SecureStore;

const PBKDF2_ITERATIONS: u32 = 150_000;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct Envelope {
    ciphertext_b64: String,
    nonce_b64: String,
    salt_b64: String,
}

/// Resolve the on-device storage directory via XDG / platform conventions,
/// falling back to `$HOME/.synheart` when no project-dirs base is
/// available (e.g. minimal containers).
pub fn default_base_dir() -> PathBuf {
    ProjectDirs::from("ai", "synheart", "synheart").map_or_else(
        || {
            let mut p =
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".synheart");
            p
        },
        |dirs| dirs.data_local_dir().to_path_buf(),
    )
}

pub struct EncryptedFileStore {
    base_dir: PathBuf,
    passphrase: String,
}

impl EncryptedFileStore {
    /// `passphrase` is the device-local secret the key is derived from; it
    /// never touches disk itself.
    pub fn new(base_dir: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            passphrase: passphrase.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
        out
    }

    fn encrypt(&self, plaintext: &[u8]) -> Envelope {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption over a bounded in-memory buffer cannot fail");

        Envelope {
            ciphertext_b64: BASE64.encode(ciphertext),
            nonce_b64: BASE64.encode(nonce_bytes),
            salt_b64: BASE64.encode(salt),
        }
    }

    fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, HsiError> {
        let salt = BASE64
            .decode(&envelope.salt_b64)
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(&envelope.nonce_b64)
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        let ciphertext = BASE64
            .decode(&envelope.ciphertext_b64)
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;

        let key_bytes = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| HsiError::DeviceStorageFailure("decryption failed".into()))
    }

    async fn read_file(path: &Path) -> Result<Option<Vec<u8>>, HsiError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HsiError::DeviceStorageFailure(e.to_string())),
        }
    }
}

#[async_trait]
impl SecureStore for EncryptedFileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HsiError> {
        let path = self.path_for(key);
        let raw = match Self::read_file(&path).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)?;
        Ok(Some(self.decrypt(&envelope)?))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), HsiError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))?;
        let envelope = self.encrypt(value);
        let bytes = serde_json::to_vec(&envelope)?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| HsiError::DeviceStorageFailure(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), HsiError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HsiError::DeviceStorageFailure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_through_disk_encrypted() {
        let dir = tempfile_dir();
        let store = EncryptedFileStore::new(&dir, "correct horse battery staple");

        store.put("profile", b"top secret payload").await.unwrap();
        let raw_on_disk = std::fs::read(dir.join("profile.json")).unwrap();
        assert!(!raw_on_disk.windows(10).any(|w| w == b"top secret"[..10].as_ref()));

        let back = store.get("profile").await.unwrap().unwrap();
        assert_eq!(back, b"top secret payload");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_to_decrypt() {
        let dir = tempfile_dir();
        let writer = EncryptedFileStore::new(&dir, "passphrase-one");
        writer.put("k", b"v").await.unwrap();

        let reader = EncryptedFileStore::new(&dir, "passphrase-two");
        assert!(reader.get("k").await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile_dir();
        let store = EncryptedFileStore::new(&dir, "pw");
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        dir.push(format!("synheart-test-{}", hex::encode(suffix)));
        dir
    }
}
