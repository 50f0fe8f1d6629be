//! In-memory source adapters for tests and the demo CLI. Each one holds
//! onto the sender handed to it by `start()` so test code can push samples
//! on demand via `push()`/`emit()`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::HsiError;
use crate::types::{BehaviorEvent, PhoneSample, WearSample};

use super::{BehaviorSourceAdapter, PhoneSourceAdapter, WearSourceAdapter};

#[derive(Default)]
pub struct InMemoryWearAdapter {
    tx: Mutex<Option<mpsc::Sender<WearSample>>>,
    interval_ms: Mutex<u64>,
}

impl InMemoryWearAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a sample as if the source had just produced one. No-op if the
    /// adapter hasn't been started.
    pub async fn push(&self, sample: WearSample) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(sample).await;
        }
    }

    pub async fn current_interval_ms(&self) -> u64 {
        *self.interval_ms.lock().await
    }
}

#[async_trait]
impl WearSourceAdapter for InMemoryWearAdapter {
    async fn start(&self, tx: mpsc::Sender<WearSample>) -> Result<(), HsiError> {
        *self.tx.lock().await = Some(tx);
        Ok(())
    }

    async fn stop(&self) {
        *self.tx.lock().await = None;
    }

    async fn set_interval(&self, interval_ms: u64) {
        *self.interval_ms.lock().await = interval_ms;
    }
}

#[derive(Default)]
pub struct InMemoryPhoneAdapter {
    tx: Mutex<Option<mpsc::Sender<PhoneSample>>>,
}

impl InMemoryPhoneAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push(&self, sample: PhoneSample) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(sample).await;
        }
    }
}

#[async_trait]
impl PhoneSourceAdapter for InMemoryPhoneAdapter {
    async fn start(&self, tx: mpsc::Sender<PhoneSample>) -> Result<(), HsiError> {
        *self.tx.lock().await = Some(tx);
        Ok(())
    }

    async fn stop(&self) {
        *self.tx.lock().await = None;
    }
}

#[derive(Default)]
pub struct InMemoryBehaviorAdapter {
    tx: Mutex<Option<mpsc::Sender<BehaviorEvent>>>,
}

impl InMemoryBehaviorAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push(&self, event: BehaviorEvent) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl BehaviorSourceAdapter for InMemoryBehaviorAdapter {
    async fn start(&self, tx: mpsc::Sender<BehaviorEvent>) -> Result<(), HsiError> {
        *self.tx.lock().await = Some(tx);
        Ok(())
    }

    async fn stop(&self) {
        *self.tx.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wear_adapter_forwards_pushed_samples() {
        let adapter = InMemoryWearAdapter::new();
        let (tx, mut rx) = mpsc::channel(4);
        adapter.start(tx).await.unwrap();
        adapter
            .push(WearSample {
                timestamp: 1,
                hr: Some(70.0),
                hrv_rmssd: None,
                resp_rate: None,
                motion_level: None,
                sleep_stage: None,
                rr_intervals: vec![],
            })
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.hr, Some(70.0));
    }

    #[tokio::test]
    async fn stopped_adapter_drops_pushes() {
        let adapter = InMemoryWearAdapter::new();
        let (tx, mut rx) = mpsc::channel(4);
        adapter.start(tx).await.unwrap();
        adapter.stop().await;
        adapter
            .push(WearSample {
                timestamp: 1,
                hr: None,
                hrv_rmssd: None,
                resp_rate: None,
                motion_level: None,
                sleep_stage: None,
                rr_intervals: vec![],
            })
            .await;
        assert!(rx.try_recv().is_err());
    }
}
