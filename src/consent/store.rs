//! `ConsentStore`: the in-memory, observable source of truth for consent
//! state. Every subsystem that gates on consent subscribes to this rather
//! than polling storage.
//!
//! Modeled on the watch-channel snapshot pattern used for reactive entity
//! collections: state lives behind a `watch::Sender`, readers get a cheap
//! `Receiver` clone, and a transition is only published after it has been
//! persisted to secure storage.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Channel, HsiError};
use crate::storage::SecureStore;

use super::types::ConsentSnapshot;

const CONSENT_STORAGE_KEY: &str = "consent_snapshot";

/// A single consent change, published on every successful `update`.
#[derive(Debug, Clone, Copy)]
pub struct ConsentTransition {
    pub before: ConsentSnapshot,
    pub after: ConsentSnapshot,
}

impl ConsentTransition {
    /// Whether `channel` went from granted to revoked in this transition.
    pub fn revoked(&self, channel: Channel) -> bool {
        self.before.channel_granted(channel) && !self.after.channel_granted(channel)
    }
}

/// Observable store for the local [`ConsentSnapshot`].
///
/// Cloning a `ConsentStore` is cheap and shares the same underlying state;
/// this is the handle every module holds.
#[derive(Clone)]
pub struct ConsentStore {
    tx: watch::Sender<ConsentSnapshot>,
    storage: Arc<dyn SecureStore>,
}

impl ConsentStore {
    /// Load the persisted snapshot, or fall back to all-denied if none
    /// exists yet (first run).
    pub async fn load(storage: Arc<dyn SecureStore>, now_ms: i64) -> Result<Self, HsiError> {
        let snapshot = match storage.get(CONSENT_STORAGE_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ConsentSnapshot::denied_all(now_ms),
        };
        let (tx, _rx) = watch::channel(snapshot);
        Ok(Self { tx, storage })
    }

    /// Current snapshot, cloned out.
    pub fn current(&self) -> ConsentSnapshot {
        *self.tx.borrow()
    }

    /// Subscribe to future changes. The receiver always yields the current
    /// value first on `changed()`/`borrow()`, matching `watch` semantics.
    pub fn subscribe(&self) -> watch::Receiver<ConsentSnapshot> {
        self.tx.subscribe()
    }

    /// Apply a new snapshot: validate, persist, then publish.
    ///
    /// Publication only happens after the write to storage succeeds, so a
    /// subscriber never observes a consent state that didn't make it to
    /// disk.
    pub async fn update(&self, next: ConsentSnapshot) -> Result<ConsentTransition, HsiError> {
        next.validate()?;
        let before = self.current();
        let bytes = serde_json::to_vec(&next)?;
        self.storage.put(CONSENT_STORAGE_KEY, &bytes).await?;
        self.tx.send_replace(next);
        Ok(ConsentTransition {
            before,
            after: next,
        })
    }

    /// Convenience check used by channel aggregators and the facade before
    /// doing any work gated on `channel`.
    pub fn require(&self, channel: Channel) -> Result<(), HsiError> {
        if self.current().channel_granted(channel) {
            Ok(())
        } else {
            Err(HsiError::ConsentRequired(channel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    async fn store() -> ConsentStore {
        ConsentStore::load(Arc::new(InMemoryStore::new()), 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn loads_denied_all_when_nothing_persisted() {
        let store = store().await;
        assert!(!store.current().biosignals);
        assert!(store.require(Channel::Biosignals).is_err());
    }

    #[tokio::test]
    async fn update_persists_and_publishes() {
        let store = store().await;
        let mut next = store.current();
        next.biosignals = true;
        let transition = store.update(next).await.unwrap();
        assert!(!transition.before.biosignals);
        assert!(transition.after.biosignals);
        assert!(store.require(Channel::Biosignals).is_ok());
    }

    #[tokio::test]
    async fn subscriber_observes_revocation() {
        let store = store().await;
        let mut granted = store.current();
        granted.motion = true;
        store.update(granted).await.unwrap();

        let mut rx = store.subscribe();
        let mut revoked = store.current();
        revoked.motion = false;
        let transition = store.update(revoked).await.unwrap();
        assert!(transition.revoked(Channel::Motion));

        rx.changed().await.unwrap();
        assert!(!rx.borrow().motion);
    }

    #[tokio::test]
    async fn rejects_invalid_snapshot() {
        let store = store().await;
        let mut bad = store.current();
        bad.cloud_upload = true;
        assert!(store.update(bad).await.is_err());
    }
}
