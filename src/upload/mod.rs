//! Upload queue: signs HSV snapshots, batches them, and delivers them to
//! the cloud with exponential backoff on failure. Persisted across
//! restarts via an append-only spool file.

pub mod backoff;
pub mod canonical;
pub mod persist;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::consent::ConsentStore;
use crate::error::HsiError;
use crate::fusion::hsv::HumanStateVector;

use backoff::{delay_for_attempt, MAX_ATTEMPTS};
use persist::SpoolFile;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(5);
const WORKER_TICK: Duration = Duration::from_millis(500);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: String,
    pub hsv: HumanStateVector,
    pub signature: String,
    pub attempts: u32,
    pub next_attempt_at: i64,
}

#[derive(Clone)]
pub struct UploadConfig {
    pub base_url: String,
    pub tenant_id: String,
    pub tenant_secret: String,
    pub batch_size: usize,
    pub batch_wait: Duration,
}

impl UploadConfig {
    pub fn new(base_url: impl Into<String>, tenant_id: impl Into<String>, tenant_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tenant_id: tenant_id.into(),
            tenant_secret: tenant_secret.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_wait: DEFAULT_BATCH_WAIT,
        }
    }
}

/// Token source the queue consults for the bearer it attaches to each
/// batch request; kept as a trait so the queue's tests don't need a full
/// `ConsentTokenService` + mock HTTP server.
#[async_trait::async_trait]
pub trait BearerSource: Send + Sync {
    async fn bearer(&self) -> Option<String>;
    async fn refresh(&self);
}

pub struct UploadQueue {
    config: UploadConfig,
    client: reqwest::Client,
    consent: ConsentStore,
    bearer: Arc<dyn BearerSource>,
    items: Mutex<HashMap<String, UploadItem>>,
    spool: SpoolFile<UploadItem>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    pub async fn load(
        config: UploadConfig,
        spool_path: impl AsRef<std::path::Path>,
        consent: ConsentStore,
        bearer: Arc<dyn BearerSource>,
    ) -> Result<Self, HsiError> {
        let (spool, items) = SpoolFile::load(spool_path).await?;
        let (shutdown_tx, _rx) = watch::channel(false);
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            consent,
            bearer,
            items: Mutex::new(items),
            spool,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Accepts an HSV for upload if `cloudUpload` consent is granted.
    /// Computes the canonical signature and persists the item before
    /// returning, so a crash right after `enqueue` still uploads it.
    pub async fn enqueue(&self, hsv: HumanStateVector) -> Result<(), HsiError> {
        if !self.consent.current().cloud_upload {
            return Err(HsiError::InvalidConfig("cloud upload consent not granted".into()));
        }

        let canonical = canonical::canonicalize(&hsv)?;
        let signature = sign(&self.config.tenant_secret, &canonical);
        let item = UploadItem {
            id: uuid::Uuid::new_v4().to_string(),
            hsv,
            signature,
            attempts: 0,
            next_attempt_at: crate::now_ms(),
        };
        self.spool.upsert(&item.id, &item).await?;
        self.items.lock().await.insert(item.id.clone(), item);
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WORKER_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.drain_due().await {
                            error!(error = %e, "upload queue tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "upload queue task join failed");
            }
        }
    }

    /// Forces an immediate delivery attempt for whatever is currently due,
    /// ignoring the worker's polling cadence.
    pub async fn upload_now(&self) -> Result<(), HsiError> {
        self.drain_due().await
    }

    /// Drains the entire queue, repeatedly attempting batches until empty
    /// or no batch makes progress.
    pub async fn flush_queue(&self) -> Result<(), HsiError> {
        loop {
            let before = self.items.lock().await.len();
            if before == 0 {
                return Ok(());
            }
            self.force_batch().await?;
            let after = self.items.lock().await.len();
            if after == before {
                return Ok(());
            }
        }
    }

    /// Discards all queued items without uploading them.
    pub async fn clear_queue(&self) -> Result<(), HsiError> {
        self.items.lock().await.clear();
        self.spool.clear().await
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    async fn drain_due(&self) -> Result<(), HsiError> {
        let now = crate::now_ms();
        let due = self.due_batch(now).await;
        if due.is_empty() {
            return Ok(());
        }
        self.deliver_batch(due).await
    }

    async fn force_batch(&self) -> Result<(), HsiError> {
        let batch = {
            let items = self.items.lock().await;
            items.values().take(self.config.batch_size).cloned().collect::<Vec<_>>()
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.deliver_batch(batch).await
    }

    async fn due_batch(&self, now: i64) -> Vec<UploadItem> {
        let items = self.items.lock().await;
        items
            .values()
            .filter(|item| item.next_attempt_at <= now)
            .take(self.config.batch_size)
            .cloned()
            .collect()
    }

    /// Delivers a batch one item per request, each carrying its own
    /// `X-Signature` equal to `HMAC-SHA256(tenantSecret, canonicalJson(hsv))`
    /// for that item — the signature an item was stamped with at
    /// `enqueue` time never changes, so the header always matches what
    /// the receiver independently recomputes.
    async fn deliver_batch(&self, batch: Vec<UploadItem>) -> Result<(), HsiError> {
        let Some(bearer) = self.bearer.bearer().await else {
            return Ok(());
        };

        let url = format!("{}/v1/{}/snapshots", self.config.base_url, self.config.tenant_id);
        let mut delivered = Vec::new();
        let mut to_reschedule = Vec::new();
        let mut auth_retry = false;
        let mut rejected: Option<HsiError> = None;

        for item in batch {
            let canonical = canonical::canonicalize(&item.hsv)?;
            let body = format!("[{canonical}]");
            let response = self
                .client
                .post(&url)
                .bearer_auth(&bearer)
                .header("X-Signature", &item.signature)
                .header("Content-Type", "application/json")
                .body(body)
                .timeout(UPLOAD_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => delivered.push(item),
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    auth_retry = true;
                    to_reschedule.push(item);
                }
                Ok(resp) if resp.status().is_client_error() && resp.status() != StatusCode::TOO_MANY_REQUESTS => {
                    warn!(status = %resp.status(), id = %item.id, "upload item rejected, dropping");
                    rejected.get_or_insert_with(|| HsiError::PayloadInvalid(format!("upload rejected: {}", resp.status())));
                    delivered.push(item);
                }
                _ => to_reschedule.push(item),
            }
        }

        if auth_retry {
            self.bearer.refresh().await;
        }

        {
            let mut items = self.items.lock().await;
            for item in &delivered {
                items.remove(&item.id);
                self.spool.remove(&item.id).await?;
            }
        }
        if !delivered.is_empty() {
            debug!(count = delivered.len(), "upload items delivered");
        }

        if !to_reschedule.is_empty() {
            self.reschedule(to_reschedule, auth_retry).await?;
        }

        match rejected {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reschedule(&self, batch: Vec<UploadItem>, auth_retry: bool) -> Result<(), HsiError> {
        let mut items = self.items.lock().await;
        for mut item in batch {
            item.attempts += 1;
            if item.attempts >= MAX_ATTEMPTS && !auth_retry {
                items.remove(&item.id);
                self.spool.remove(&item.id).await?;
                warn!(id = %item.id, "upload item exhausted retries, dropping");
                continue;
            }
            let delay = delay_for_attempt(item.attempts.saturating_sub(1));
            item.next_attempt_at = crate::now_ms() + delay.as_millis() as i64;
            self.spool.upsert(&item.id, &item).await?;
            items.insert(item.id.clone(), item);
        }
        Ok(())
    }
}

fn sign(secret: &str, canonical_json: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical_json.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use std::sync::Arc as StdArc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticBearer;

    #[async_trait::async_trait]
    impl BearerSource for StaticBearer {
        async fn bearer(&self) -> Option<String> {
            Some("test-token".to_string())
        }
        async fn refresh(&self) {}
    }

    async fn consented_store() -> ConsentStore {
        let store = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let mut snap = store.current();
        snap.biosignals = true;
        snap.cloud_upload = true;
        store.update(snap).await.unwrap();
        store
    }

    fn temp_spool(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("synheart-upload-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn signature_matches_independent_hmac_computation() {
        let sig = sign("secret", r#"{"a":1}"#);
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(br#"{"a":1}"#);
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
    }

    #[tokio::test]
    async fn enqueue_without_cloud_consent_is_rejected() {
        let consent = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let path = temp_spool("noconsent");
        let _ = tokio::fs::remove_file(&path).await;
        let queue = UploadQueue::load(
            UploadConfig::new("http://example.invalid", "tenant", "secret"),
            &path,
            consent,
            StdArc::new(StaticBearer),
        )
        .await
        .unwrap();

        let hsv = crate::fusion::placeholder_hsv("s1", "d1");
        assert!(queue.enqueue(hsv).await.is_err());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn successful_batch_delivery_empties_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tenant/snapshots"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let consent = consented_store().await;
        let path = temp_spool("success");
        let _ = tokio::fs::remove_file(&path).await;
        let queue = UploadQueue::load(
            UploadConfig::new(server.uri(), "tenant", "secret"),
            &path,
            consent,
            StdArc::new(StaticBearer),
        )
        .await
        .unwrap();

        queue.enqueue(crate::fusion::placeholder_hsv("s1", "d1")).await.unwrap();
        assert_eq!(queue.len().await, 1);
        queue.upload_now().await.unwrap();
        assert_eq!(queue.len().await, 0);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn server_error_reschedules_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tenant/snapshots"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let consent = consented_store().await;
        let path = temp_spool("retry");
        let _ = tokio::fs::remove_file(&path).await;
        let queue = UploadQueue::load(
            UploadConfig::new(server.uri(), "tenant", "secret"),
            &path,
            consent,
            StdArc::new(StaticBearer),
        )
        .await
        .unwrap();

        queue.enqueue(crate::fusion::placeholder_hsv("s1", "d1")).await.unwrap();
        queue.upload_now().await.unwrap();
        assert_eq!(queue.len().await, 1);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn client_error_drops_item() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tenant/snapshots"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let consent = consented_store().await;
        let path = temp_spool("drop");
        let _ = tokio::fs::remove_file(&path).await;
        let queue = UploadQueue::load(
            UploadConfig::new(server.uri(), "tenant", "secret"),
            &path,
            consent,
            StdArc::new(StaticBearer),
        )
        .await
        .unwrap();

        queue.enqueue(crate::fusion::placeholder_hsv("s1", "d1")).await.unwrap();
        assert!(queue.upload_now().await.is_err());
        assert_eq!(queue.len().await, 0);
        tokio::fs::remove_file(&path).await.ok();
    }
}
