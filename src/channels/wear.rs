//! Wear channel: biosignal + motion samples, with adaptive polling cadence
//! that tightens when an interpretation head needs HRV-grade resolution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapters::WearSourceAdapter;
use crate::consent::ConsentStore;
use crate::error::{Channel as ChannelKind, HsiError};
use crate::types::{WearSample, WearWindowFeatures, WindowType};

use super::ring_buffer::{RingBuffer, Timestamped};
use super::MAX_RETENTION_MS;

impl Timestamped for WearSample {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp
    }
}

const IDLE_INTERVAL_MS: u64 = 5_000;
const ACTIVE_INTERVAL_MS: u64 = 1_000;
const RAW_BROADCAST_CAPACITY: usize = 256;

pub struct WearChannel {
    consent: ConsentStore,
    adapter: Arc<dyn WearSourceAdapter>,
    buffer: Arc<Mutex<RingBuffer<WearSample>>>,
    raw_tx: broadcast::Sender<WearSample>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    current_interval_ms: Arc<AtomicU64>,
}

impl WearChannel {
    pub fn new(consent: ConsentStore, adapter: Arc<dyn WearSourceAdapter>) -> Self {
        let (raw_tx, _rx) = broadcast::channel(RAW_BROADCAST_CAPACITY);
        let (shutdown_tx, _rx2) = watch::channel(false);
        Self {
            consent,
            adapter,
            buffer: Arc::new(Mutex::new(RingBuffer::new(MAX_RETENTION_MS))),
            raw_tx,
            shutdown_tx,
            task: Mutex::new(None),
            current_interval_ms: Arc::new(AtomicU64::new(IDLE_INTERVAL_MS)),
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
                        if consent.current().channel_granted(ChannelKind::Biosignals) {
                            buffer.lock().await.insert(sample.clone());
                            let _ = raw_tx.send(sample);
                        }
                    }
                    changed = consent_rx.changed() => {
                        if changed.is_err() { break; }
                        if !consent_rx.borrow().channel_granted(ChannelKind::Biosignals) {
                            debug!("wear consent revoked, clearing buffer");
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
                warn!(error = %e, "wear channel task join failed");
            }
        }
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<WearSample> {
        self.raw_tx.subscribe()
    }

    /// Tightens (or relaxes) the polling cadence depending on whether an
    /// HRV-sensitive head (emotion/focus) is currently active.
    pub async fn set_head_active(&self, active: bool) {
        let target = if active { ACTIVE_INTERVAL_MS } else { IDLE_INTERVAL_MS };
        self.current_interval_ms.store(target, Ordering::Relaxed);
        self.adapter.set_interval(target).await;
    }

    pub async fn update_collection_interval(&self, interval_ms: u64) {
        self.current_interval_ms.store(interval_ms, Ordering::Relaxed);
        self.adapter.set_interval(interval_ms).await;
    }

    pub async fn clear_cache(&self) {
        self.buffer.lock().await.clear();
    }

    /// All RR intervals (milliseconds) from samples in the window,
    /// concatenated in timestamp order. Used by the fusion engine to
    /// derive the emotion feature channel's HRV statistics.
    pub async fn rr_intervals(&self, now_ms: i64, window_ms: i64) -> Vec<f64> {
        let buffer = self.buffer.lock().await;
        buffer
            .window(now_ms, window_ms)
            .iter()
            .flat_map(|s| s.rr_intervals.iter().copied())
            .collect()
    }

    pub async fn features(&self, now_ms: i64, window: WindowType) -> Option<WearWindowFeatures> {
        let buffer = self.buffer.lock().await;
        let samples = buffer.window(now_ms, window.as_millis());
        if samples.is_empty() {
            return None;
        }

        let (mut hr_sum, mut hr_n) = (0.0, 0usize);
        let (mut hrv_sum, mut hrv_n) = (0.0, 0usize);
        let (mut resp_sum, mut resp_n) = (0.0, 0usize);
        let (mut motion_sum, mut motion_n) = (0.0, 0usize);

        for s in samples {
            if let Some(v) = s.hr {
                hr_sum += v;
                hr_n += 1;
            }
            if let Some(v) = s.hrv_rmssd {
                hrv_sum += v;
                hrv_n += 1;
            }
            if let Some(v) = s.resp_rate {
                resp_sum += v;
                resp_n += 1;
            }
            if let Some(v) = s.motion_level {
                motion_sum += v;
                motion_n += 1;
            }
        }

        let interval_ms = self.current_interval_ms.load(Ordering::Relaxed).max(1);
        let expected = (window.as_millis() as f64 / interval_ms as f64).max(1.0);
        let coverage_ratio = (samples.len() as f64 / expected).min(1.0);
        if coverage_ratio < window.min_coverage() {
            return None;
        }

        Some(WearWindowFeatures {
            hr_avg: avg(hr_sum, hr_n),
            hrv_rmssd_avg: avg(hrv_sum, hrv_n),
            resp_rate_avg: avg(resp_sum, resp_n),
            motion_level_avg: avg(motion_sum, motion_n),
            sample_count: samples.len(),
            coverage_ratio,
        })
    }
}

fn avg(sum: f64, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryWearAdapter;
    use crate::storage::InMemoryStore;
    use std::sync::Arc as StdArc;

    async fn consented_store() -> ConsentStore {
        let store = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let mut snap = store.current();
        snap.biosignals = true;
        store.update(snap).await.unwrap();
        store
    }

    fn sample(ts: i64, hr: f64) -> WearSample {
        WearSample {
            timestamp: ts,
            hr: Some(hr),
            hrv_rmssd: Some(40.0),
            resp_rate: Some(14.0),
            motion_level: Some(0.1),
            sleep_stage: None,
            rr_intervals: vec![],
        }
    }

    #[tokio::test]
    async fn accumulates_samples_and_computes_features() {
        let consent = consented_store().await;
        let adapter = InMemoryWearAdapter::new();
        let channel = WearChannel::new(consent, adapter.clone());
        channel.update_collection_interval(1_000).await;
        channel.start().await.unwrap();

        for ts in (0..30_000).step_by(1_000) {
            adapter.push(sample(ts, 70.0)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let features = channel.features(29_000, WindowType::Seconds30).await.unwrap();
        assert_eq!(features.hr_avg, 70.0);
        assert!(features.coverage_ratio > 0.9);
        channel.stop().await;
    }

    #[tokio::test]
    async fn revocation_clears_buffer() {
        let consent = consented_store().await;
        let adapter = InMemoryWearAdapter::new();
        let channel = WearChannel::new(consent.clone(), adapter.clone());
        channel.start().await.unwrap();
        adapter.push(sample(0, 60.0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let mut revoked = consent.current();
        revoked.biosignals = false;
        consent.update(revoked).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(channel.features(100, WindowType::Seconds30).await.is_none());
        channel.stop().await;
    }

    #[tokio::test]
    async fn samples_rejected_without_consent() {
        let consent = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let adapter = InMemoryWearAdapter::new();
        let channel = WearChannel::new(consent, adapter.clone());
        channel.start().await.unwrap();
        adapter.push(sample(0, 60.0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(channel.features(100, WindowType::Seconds30).await.is_none());
        channel.stop().await;
    }
}
