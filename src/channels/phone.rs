//! Phone channel: motion + screen/foreground-app samples.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapters::PhoneSourceAdapter;
use crate::consent::ConsentStore;
use crate::error::{Channel as ChannelKind, HsiError};
use crate::types::{PhoneSample, PhoneWindowFeatures, WindowType};

use super::ring_buffer::{RingBuffer, Timestamped};
use super::MAX_RETENTION_MS;

impl Timestamped for PhoneSample {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp
    }
}

const RAW_BROADCAST_CAPACITY: usize = 256;

pub struct PhoneChannel {
    consent: ConsentStore,
    adapter: Arc<dyn PhoneSourceAdapter>,
    buffer: Arc<Mutex<RingBuffer<PhoneSample>>>,
    raw_tx: broadcast::Sender<PhoneSample>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PhoneChannel {
    pub fn new(consent: ConsentStore, adapter: Arc<dyn PhoneSourceAdapter>) -> Self {
        let (raw_tx, _rx) = broadcast::channel(RAW_BROADCAST_CAPACITY);
        let (shutdown_tx, _rx2) = watch::channel(false);
        Self {
            consent,
            adapter,
            buffer: Arc::new(Mutex::new(RingBuffer::new(MAX_RETENTION_MS))),
            raw_tx,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), HsiError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        self.adapter.start(tx).await?;

        let buffer = self.buffer.clone();
        let raw_tx = self.raw_tx.clone();
        let consent = self.consent.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut consent_rx = self.consent.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    sample = rx.recv() => {
                        let Some(sample) = sample else { break };
                        if consent.current().channel_granted(ChannelKind::Motion) {
                            buffer.lock().await.insert(sample.clone());
                            let _ = raw_tx.send(sample);
                        }
                    }
                    changed = consent_rx.changed() => {
                        if changed.is_err() { break; }
                        if !consent_rx.borrow().channel_granted(ChannelKind::Motion) {
                            debug!("phone consent revoked, clearing buffer");
                            buffer.lock().await.clear();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.adapter.stop().await;
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "phone channel task join failed");
            }
        }
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<PhoneSample> {
        self.raw_tx.subscribe()
    }

    pub async fn clear_cache(&self) {
        self.buffer.lock().await.clear();
    }

    pub async fn features(&self, now_ms: i64, window: WindowType) -> Option<PhoneWindowFeatures> {
        let buffer = self.buffer.lock().await;
        let samples = buffer.window(now_ms, window.as_millis());
        if samples.is_empty() {
            return None;
        }

        let (mut motion_sum, mut motion_n) = (0.0, 0usize);
        let mut screen_on_count = 0usize;
        let mut screen_known = 0usize;
        let mut foreground_changes = 0usize;
        let mut last_app: Option<&str> = None;

        for s in samples {
            if let Some(v) = s.motion_magnitude {
                motion_sum += v;
                motion_n += 1;
            }
            if let Some(on) = s.screen_on {
                screen_known += 1;
                if on {
                    screen_on_count += 1;
                }
            }
            if let Some(app) = s.foreground_app_id.as_deref() {
                if last_app.is_some_and(|prev| prev != app) {
                    foreground_changes += 1;
                }
                last_app = Some(app);
            }
        }

        let motion_index = if motion_n == 0 { 0.0 } else { motion_sum / motion_n as f64 };
        let screen_on_ratio = if screen_known == 0 {
            0.0
        } else {
            screen_on_count as f64 / screen_known as f64
        };
        // Posture stability: inverse of motion variance proxy — steadier
        // motion readings imply a more stable posture.
        let posture_stability = (1.0 - motion_index.min(1.0)).max(0.0);

        Some(PhoneWindowFeatures {
            motion_index,
            posture_stability,
            screen_on_ratio,
            foreground_app_changes: foreground_changes as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryPhoneAdapter;
    use crate::storage::InMemoryStore;
    use std::sync::Arc as StdArc;

    async fn consented_store() -> ConsentStore {
        let store = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let mut snap = store.current();
        snap.motion = true;
        store.update(snap).await.unwrap();
        store
    }

    #[tokio::test]
    async fn aggregates_screen_and_motion() {
        let consent = consented_store().await;
        let adapter = InMemoryPhoneAdapter::new();
        let channel = PhoneChannel::new(consent, adapter.clone());
        channel.start().await.unwrap();

        for (ts, app) in [(0, "mail"), (1_000, "mail"), (2_000, "maps")] {
            adapter
                .push(PhoneSample {
                    timestamp: ts,
                    motion_magnitude: Some(0.2),
                    screen_on: Some(true),
                    foreground_app_id: Some(app.to_string()),
                })
                .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let features = channel.features(2_000, WindowType::Minutes5).await.unwrap();
        assert_eq!(features.foreground_app_changes, 1.0);
        assert_eq!(features.screen_on_ratio, 1.0);
        channel.stop().await;
    }
}
