//! `SynheartEngine`: the single process-wide orchestrator wiring the
//! consent subsystem, channel aggregators, fusion engine, interpretation
//! heads, and upload queue behind one lifecycle
//! `{uninitialized -> initialized -> running -> stopped -> disposed}`.
//!
//! Constructed explicitly with its source adapters and storage backend
//! (dependency injection, not a global default), so tests and the demo
//! CLI can swap in-memory adapters without touching this module.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{BehaviorSourceAdapter, PhoneSourceAdapter, WearSourceAdapter};
use crate::channels::{BehaviorChannel, PhoneChannel, WearChannel};
use crate::config::RuntimeConfig;
use crate::consent::{
    ConsentProfile, ConsentSnapshot, ConsentStore, ConsentToken, ConsentTokenService, ConsentTransition, ProfileCache,
};
use crate::error::{Channel, HsiError};
use crate::fusion::hsv::{EmotionState, FocusState, HumanStateVector};
use crate::fusion::FusionEngine;
use crate::heads::{EmotionHead, FocusHead, Head, HeadStatus};
use crate::module_manager::{Module, ModuleManager};
use crate::registry::CapabilityRegistry;
use crate::storage::SecureStore;
use crate::types::{BehaviorEvent, WearSample};
use crate::upload::{BearerSource, UploadQueue};

const MODULE_CONSENT_STORE: &str = "consent_store";
const MODULE_TOKEN_SERVICE: &str = "token_service";
const MODULE_CAPABILITY_REGISTRY: &str = "capability_registry";
const MODULE_WEAR: &str = "wear";
const MODULE_PHONE: &str = "phone";
const MODULE_BEHAVIOR: &str = "behavior";
const MODULE_FUSION: &str = "fusion";
const MODULE_UPLOAD: &str = "upload";

/// `Uninitialized -> Initialized -> Running -> Stopped`; `Stopped ->
/// Running`; any non-`Disposed` state -> `Disposed` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FacadeState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
    Disposed = 4,
}

impl FacadeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Disposed,
        }
    }

    fn can_transition_to(self, to: FacadeState) -> bool {
        use FacadeState::*;
        matches!(
            (self, to),
            (Uninitialized, Initialized)
                | (Initialized, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (_, Disposed)
        )
    }
}

/// Bridges the [`ConsentTokenService`]'s cached bearer onto the upload
/// queue's narrower [`BearerSource`] need, so the queue never has to know
/// about token refresh or JWT decoding.
struct TokenServiceBearer(Arc<ConsentTokenService>);

#[async_trait]
impl BearerSource for TokenServiceBearer {
    async fn bearer(&self) -> Option<String> {
        self.0.current().map(|t| t.jwt)
    }

    async fn refresh(&self) {
        let (_tx, mut shutdown) = watch::channel(false);
        if let Err(e) = self.0.refresh(crate::now_ms(), &mut shutdown).await {
            warn!(error = %e, "on-demand token refresh failed");
        }
    }
}

struct WearModule(Arc<WearChannel>);
#[async_trait]
impl Module for WearModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        self.0.start().await
    }
    async fn stop(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
}

struct PhoneModule(Arc<PhoneChannel>);
#[async_trait]
impl Module for PhoneModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        self.0.start().await
    }
    async fn stop(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
}

struct BehaviorModule(Arc<BehaviorChannel>);
#[async_trait]
impl Module for BehaviorModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        self.0.start().await
    }
    async fn stop(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
}

struct FusionModule(Arc<FusionEngine>);
#[async_trait]
impl Module for FusionModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        self.0.initialize()
    }
    async fn start(&self) -> Result<(), HsiError> {
        self.0.start().await
    }
    async fn stop(&self) -> Result<(), HsiError> {
        self.0.stop().await
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.0.dispose();
        Ok(())
    }
}

struct UploadModule(Arc<UploadQueue>);
#[async_trait]
impl Module for UploadModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        self.0.start().await;
        Ok(())
    }
    async fn stop(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.0.stop().await;
        Ok(())
    }
}

struct TokenServiceModule {
    service: Arc<ConsentTokenService>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for TokenServiceModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        let service = self.service.clone();
        let shutdown = self.shutdown_tx.subscribe();
        *self.task.lock().await = Some(tokio::spawn(async move {
            service.run(shutdown).await;
        }));
        Ok(())
    }
    async fn stop(&self) -> Result<(), HsiError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "token service task join failed");
            }
        }
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.stop().await
    }
}

struct CapabilityRegistryModule {
    registry: Arc<CapabilityRegistry>,
    token_rx: watch::Receiver<Option<ConsentToken>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for CapabilityRegistryModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        let registry = self.registry.clone();
        let token_rx = self.token_rx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        *self.task.lock().await = Some(tokio::spawn(async move {
            tokio::select! {
                () = registry.run(token_rx) => {}
                _ = shutdown.changed() => {}
            }
        }));
        Ok(())
    }
    async fn stop(&self) -> Result<(), HsiError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "capability registry task join failed");
            }
        }
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        self.stop().await
    }
}

/// Everything built once at `initialize()` and torn down at `dispose()`.
struct Inner {
    config: RuntimeConfig,
    module_manager: ModuleManager,
    consent: ConsentStore,
    token_service: Option<Arc<ConsentTokenService>>,
    profiles: Option<Arc<ProfileCache>>,
    wear: Arc<WearChannel>,
    phone: Arc<PhoneChannel>,
    behavior: Arc<BehaviorChannel>,
    fusion: Arc<FusionEngine>,
    emotion_head: Arc<EmotionHead>,
    focus_head: Arc<FocusHead>,
    emotion_enabled: Arc<AtomicBool>,
    focus_enabled: Arc<AtomicBool>,
    cloud_enabled: Arc<AtomicBool>,
    upload: Option<Arc<UploadQueue>>,
    hsv_tx: watch::Sender<HumanStateVector>,
    emotion_tx: broadcast::Sender<EmotionState>,
    focus_tx: broadcast::Sender<FocusState>,
    pipeline_shutdown_tx: watch::Sender<bool>,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
}

/// The single process-wide orchestrator. Construct with `new`, wire it up
/// with `initialize`, then drive data collection with
/// `start_data_collection`/`stop_data_collection`.
pub struct SynheartEngine {
    state: AtomicU8,
    storage: Arc<dyn SecureStore>,
    wear_adapter: Arc<dyn WearSourceAdapter>,
    phone_adapter: Arc<dyn PhoneSourceAdapter>,
    behavior_adapter: Arc<dyn BehaviorSourceAdapter>,
    inner: Mutex<Option<Inner>>,
}

impl SynheartEngine {
    pub fn new(
        storage: Arc<dyn SecureStore>,
        wear_adapter: Arc<dyn WearSourceAdapter>,
        phone_adapter: Arc<dyn PhoneSourceAdapter>,
        behavior_adapter: Arc<dyn BehaviorSourceAdapter>,
    ) -> Self {
        Self {
            state: AtomicU8::new(FacadeState::Uninitialized as u8),
            storage,
            wear_adapter,
            phone_adapter,
            behavior_adapter,
            inner: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FacadeState {
        FacadeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, to: FacadeState) -> Result<(), HsiError> {
        let current = self.state();
        if !current.can_transition_to(to) {
            return Err(HsiError::InvalidConfig(format!(
                "invalid facade state transition {current:?} -> {to:?}"
            )));
        }
        self.state.store(to as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Builds every subsystem, registers it with the module manager, and
    /// runs `initialize` on all of them in dependency order. Starts data
    /// collection immediately if `config.auto_start`.
    pub async fn initialize(&self, config: RuntimeConfig) -> Result<(), HsiError> {
        if self.state() != FacadeState::Uninitialized {
            return Err(HsiError::AlreadyInitialized);
        }
        config.validate()?;

        let consent = ConsentStore::load(self.storage.clone(), crate::now_ms()).await?;

        let token_service = match &config.cloud {
            Some(cloud) => Some(Arc::new(
                ConsentTokenService::load(cloud.consent.clone(), self.storage.clone()).await?,
            )),
            None => None,
        };
        let profiles = config
            .cloud
            .as_ref()
            .map(|cloud| Arc::new(ProfileCache::new(cloud.consent.base_url.clone(), cloud.consent.app_id.clone())));

        let capabilities = Arc::new(CapabilityRegistry::new(
            token_service.as_ref().and_then(|s| s.current()).as_ref(),
        ));
        let token_rx = match &token_service {
            Some(s) => s.subscribe(),
            None => watch::channel(None).1,
        };

        let wear = Arc::new(WearChannel::new(consent.clone(), self.wear_adapter.clone()));
        let phone = Arc::new(PhoneChannel::new(consent.clone(), self.phone_adapter.clone()));
        let behavior = Arc::new(BehaviorChannel::new(consent.clone(), self.behavior_adapter.clone()));

        let fusion = Arc::new(
            FusionEngine::new(
                wear.clone(),
                phone.clone(),
                behavior.clone(),
                uuid::Uuid::new_v4().to_string(),
                config.device.device_id.clone(),
            )
            .with_cadence_hz(config.fusion_cadence_hz),
        );

        let emotion_head = Arc::new(EmotionHead::new(capabilities.subscribe()));
        let focus_head = Arc::new(FocusHead::new(capabilities.subscribe()));

        let upload = match &config.cloud {
            Some(cloud) => {
                let bearer: Arc<dyn BearerSource> = match &token_service {
                    Some(s) => Arc::new(TokenServiceBearer(s.clone())),
                    None => {
                        return Err(HsiError::InvalidConfig(
                            "cloud upload configured without a consent token service".into(),
                        ))
                    }
                };
                let spool_path = default_spool_path(&config.device.device_id);
                Some(Arc::new(
                    UploadQueue::load(cloud.upload.clone(), spool_path, consent.clone(), bearer).await?,
                ))
            }
            None => None,
        };

        let module_manager = ModuleManager::new();
        module_manager
            .register(MODULE_CONSENT_STORE, Arc::new(NoopModule), vec![])
            .await?;

        let mut capability_deps = vec![MODULE_CONSENT_STORE];
        if let Some(service) = &token_service {
            module_manager
                .register(
                    MODULE_TOKEN_SERVICE,
                    Arc::new(TokenServiceModule {
                        service: service.clone(),
                        shutdown_tx: watch::channel(false).0,
                        task: Mutex::new(None),
                    }),
                    vec![MODULE_CONSENT_STORE],
                )
                .await?;
            capability_deps.push(MODULE_TOKEN_SERVICE);
        }
        module_manager
            .register(
                MODULE_CAPABILITY_REGISTRY,
                Arc::new(CapabilityRegistryModule {
                    registry: capabilities.clone(),
                    token_rx,
                    shutdown_tx: watch::channel(false).0,
                    task: Mutex::new(None),
                }),
                capability_deps,
            )
            .await?;

        module_manager
            .register(MODULE_WEAR, Arc::new(WearModule(wear.clone())), vec![MODULE_CONSENT_STORE])
            .await?;
        module_manager
            .register(MODULE_PHONE, Arc::new(PhoneModule(phone.clone())), vec![MODULE_CONSENT_STORE])
            .await?;
        module_manager
            .register(
                MODULE_BEHAVIOR,
                Arc::new(BehaviorModule(behavior.clone())),
                vec![MODULE_CONSENT_STORE],
            )
            .await?;
        module_manager
            .register(
                MODULE_FUSION,
                Arc::new(FusionModule(fusion.clone())),
                vec![MODULE_WEAR, MODULE_PHONE, MODULE_BEHAVIOR],
            )
            .await?;
        if let Some(queue) = &upload {
            module_manager
                .register(
                    MODULE_UPLOAD,
                    Arc::new(UploadModule(queue.clone())),
                    vec![MODULE_CAPABILITY_REGISTRY, MODULE_FUSION],
                )
                .await?;
        }

        module_manager.initialize_all().await?;

        let (hsv_tx, _rx) = watch::channel(crate::fusion::placeholder_hsv(&fusion.current().meta.session_id, &config.device.device_id));
        let (emotion_tx, _rx) = broadcast::channel(64);
        let (focus_tx, _rx) = broadcast::channel(64);
        let (pipeline_shutdown_tx, _rx) = watch::channel(false);

        let auto_start = config.auto_start;
        *self.inner.lock().await = Some(Inner {
            config,
            module_manager,
            consent,
            token_service,
            profiles,
            wear,
            phone,
            behavior,
            fusion,
            emotion_head,
            focus_head,
            emotion_enabled: Arc::new(AtomicBool::new(true)),
            focus_enabled: Arc::new(AtomicBool::new(true)),
            cloud_enabled: Arc::new(AtomicBool::new(true)),
            upload,
            hsv_tx,
            emotion_tx,
            focus_tx,
            pipeline_shutdown_tx,
            pipeline_task: Mutex::new(None),
        });
        self.transition(FacadeState::Initialized)?;

        if auto_start {
            self.start_data_collection().await?;
        }
        Ok(())
    }

    /// Starts every module and the head-processing pipeline.
    pub async fn start_data_collection(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        self.transition(FacadeState::Running)?;
        inner.module_manager.start_all().await?;

        let fusion_rx = inner.fusion.subscribe();
        let emotion_head = inner.emotion_head.clone();
        let focus_head = inner.focus_head.clone();
        let emotion_enabled = inner.emotion_enabled.clone();
        let focus_enabled = inner.focus_enabled.clone();
        let cloud_enabled = inner.cloud_enabled.clone();
        let hsv_tx = inner.hsv_tx.clone();
        let emotion_tx = inner.emotion_tx.clone();
        let focus_tx = inner.focus_tx.clone();
        let upload = inner.upload.clone();
        let consent = inner.consent.clone();
        let mut shutdown = inner.pipeline_shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut fusion_rx = fusion_rx;
            loop {
                tokio::select! {
                    changed = fusion_rx.changed() => {
                        if changed.is_err() { break; }
                        let mut hsv = fusion_rx.borrow_and_update().clone();
                        if emotion_enabled.load(Ordering::Relaxed) && emotion_head.status() == HeadStatus::Ready {
                            match emotion_head.process(hsv.clone()).await {
                                Ok(next) => hsv = next,
                                Err(e) => warn!(error = %e, "emotion head failed, stream disabled until restart"),
                            }
                        }
                        if focus_enabled.load(Ordering::Relaxed) && focus_head.status() == HeadStatus::Ready {
                            match focus_head.process(hsv.clone()).await {
                                Ok(next) => hsv = next,
                                Err(e) => warn!(error = %e, "focus head failed, stream disabled until restart"),
                            }
                        }
                        if let Some(emotion) = hsv.emotion {
                            let _ = emotion_tx.send(emotion);
                        }
                        if let Some(focus) = hsv.focus {
                            let _ = focus_tx.send(focus);
                        }
                        if let Some(queue) = &upload {
                            if cloud_enabled.load(Ordering::Relaxed) && consent.current().cloud_upload {
                                if let Err(e) = queue.enqueue(hsv.clone()).await {
                                    warn!(error = %e, "failed to enqueue hsv for upload");
                                }
                            }
                        }
                        hsv_tx.send_replace(hsv);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *inner.pipeline_task.lock().await = Some(handle);
        info!("data collection started");
        Ok(())
    }

    pub async fn stop_data_collection(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        self.transition(FacadeState::Stopped)?;
        let _ = inner.pipeline_shutdown_tx.send(true);
        if let Some(handle) = inner.pipeline_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "head pipeline task join failed");
            }
        }
        inner.module_manager.stop_all().await
    }

    pub async fn start_wear(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.wear.start().await
    }

    pub async fn stop_wear(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.wear.stop().await;
        Ok(())
    }

    pub async fn start_phone(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.phone.start().await
    }

    pub async fn stop_phone(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.phone.stop().await;
        Ok(())
    }

    pub async fn start_behavior(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.behavior.start().await
    }

    pub async fn stop_behavior(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.behavior.stop().await;
        Ok(())
    }

    pub async fn enable_emotion(&self, enabled: bool) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        inner.emotion_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            inner.wear.set_head_active(inner.focus_enabled.load(Ordering::Relaxed)).await;
        } else {
            inner.wear.set_head_active(true).await;
        }
        Ok(())
    }

    pub async fn enable_focus(&self, enabled: bool) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        inner.focus_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Clears the emotion head's `Error` state, resuming its stream.
    pub async fn restart_emotion(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.emotion_head.restart();
        Ok(())
    }

    /// Clears the focus head's `Error` state, resuming its stream.
    pub async fn restart_focus(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.focus_head.restart();
        Ok(())
    }

    pub async fn enable_cloud(&self, enabled: bool) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        if enabled && inner.upload.is_none() {
            return Err(HsiError::InvalidConfig(
                "cloud upload was not configured at initialize()".into(),
            ));
        }
        inner.cloud_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub async fn update_consent(&self, next: ConsentSnapshot) -> Result<ConsentTransition, HsiError> {
        let guard = self.inner.lock().await;
        guard.as_ref().ok_or(HsiError::NotInitialized)?.consent.update(next).await
    }

    pub async fn grant_consent(
        &self,
        biosignals: bool,
        behavior: bool,
        motion: bool,
        cloud_upload: bool,
    ) -> Result<ConsentTransition, HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        let mut next = inner.consent.current();
        next.biosignals = biosignals;
        next.behavior = behavior;
        next.motion = motion;
        next.cloud_upload = cloud_upload;
        next.explicitly_denied = false;
        next.timestamp = crate::now_ms();
        inner.consent.update(next).await
    }

    pub async fn deny_consent(&self, channel: Channel) -> Result<ConsentTransition, HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        let mut next = inner.consent.current();
        set_channel(&mut next, channel, false);
        next.explicitly_denied = true;
        next.timestamp = crate::now_ms();
        inner.consent.update(next).await
    }

    /// Revokes `channel` locally and, if a cloud is configured, makes a
    /// best-effort `POST /api/v1/sdk/consent-revoke` call. The remote call
    /// never fails the local revocation.
    pub async fn revoke_consent(&self, channel: Channel) -> Result<ConsentTransition, HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        let mut next = inner.consent.current();
        set_channel(&mut next, channel, false);
        next.explicitly_denied = true;
        next.timestamp = crate::now_ms();
        let transition = inner.consent.update(next).await?;

        if let Some(cloud) = &inner.config.cloud {
            let profile_id = inner
                .token_service
                .as_ref()
                .and_then(|s| s.current())
                .map(|t| t.profile_id)
                .unwrap_or_default();
            let client = reqwest::Client::new();
            let url = format!("{}/api/v1/sdk/consent-revoke", cloud.consent.base_url);
            if let Err(e) = client
                .post(&url)
                .json(&serde_json::json!({
                    "app_id": cloud.consent.app_id,
                    "device_id": inner.config.device.device_id,
                    "profile_id": profile_id,
                }))
                .send()
                .await
            {
                warn!(error = %e, "best-effort cloud consent revoke failed");
            }
        }
        Ok(transition)
    }

    /// Lists the app's consent profile catalog, cached for 24h.
    pub async fn get_available_profiles(&self, active_only: bool) -> Result<Vec<ConsentProfile>, HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        let profiles = inner
            .profiles
            .as_ref()
            .ok_or_else(|| HsiError::InvalidConfig("cloud upload was not configured".into()))?;
        profiles.get_available_profiles(active_only).await
    }

    pub async fn get_consent_status(&self) -> Result<ConsentSnapshot, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.consent.current())
    }

    pub async fn upload_now(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        match &inner.upload {
            Some(queue) => queue.upload_now().await,
            None => Err(HsiError::InvalidConfig("cloud upload was not configured".into())),
        }
    }

    pub async fn flush_upload_queue(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        match &inner.upload {
            Some(queue) => queue.flush_queue().await,
            None => Err(HsiError::InvalidConfig("cloud upload was not configured".into())),
        }
    }

    /// Clears every on-device cache: channel buffers and the upload spool.
    pub async fn delete_local_data(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        inner.wear.clear_cache().await;
        inner.phone.clear_cache().await;
        inner.behavior.clear_cache().await;
        if let Some(queue) = &inner.upload {
            queue.clear_queue().await?;
        }
        Ok(())
    }

    /// Clears the named module's local cache (`"wear"`, `"phone"`,
    /// `"behavior"`, or `"upload"`).
    pub async fn delete_module_data(&self, module: &str) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        match module {
            MODULE_WEAR => inner.wear.clear_cache().await,
            MODULE_PHONE => inner.phone.clear_cache().await,
            MODULE_BEHAVIOR => inner.behavior.clear_cache().await,
            MODULE_UPLOAD => {
                if let Some(queue) = &inner.upload {
                    queue.clear_queue().await?;
                }
            }
            other => {
                return Err(HsiError::InvalidConfig(format!("unknown module: {other}")));
            }
        }
        Ok(())
    }

    /// Best-effort request that the cloud purge this device's stored data.
    pub async fn delete_cloud_data(&self) -> Result<(), HsiError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(HsiError::NotInitialized)?;
        let Some(cloud) = &inner.config.cloud else {
            return Err(HsiError::InvalidConfig("cloud upload was not configured".into()));
        };
        let client = reqwest::Client::new();
        let url = format!("{}/sdk/delete-data", cloud.consent.base_url);
        client
            .post(&url)
            .json(&serde_json::json!({ "device_id": inner.config.device.device_id }))
            .send()
            .await
            .map_err(|e| HsiError::NetworkTransient(e.to_string()))?;
        Ok(())
    }

    pub async fn subscribe_hsv(&self) -> Result<watch::Receiver<HumanStateVector>, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.hsv_tx.subscribe())
    }

    pub async fn subscribe_emotion(&self) -> Result<broadcast::Receiver<EmotionState>, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.emotion_tx.subscribe())
    }

    pub async fn subscribe_focus(&self) -> Result<broadcast::Receiver<FocusState>, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.focus_tx.subscribe())
    }

    pub async fn subscribe_wear_samples(&self) -> Result<broadcast::Receiver<WearSample>, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.wear.subscribe_raw())
    }

    pub async fn subscribe_behavior_events(&self) -> Result<broadcast::Receiver<BehaviorEvent>, HsiError> {
        let guard = self.inner.lock().await;
        Ok(guard.as_ref().ok_or(HsiError::NotInitialized)?.behavior.subscribe_raw())
    }

    /// Tears down every module in reverse dependency order and releases
    /// the wired-up state. Terminal: the engine cannot be re-initialized.
    pub async fn dispose(&self) -> Result<(), HsiError> {
        self.transition(FacadeState::Disposed)?;
        if let Some(inner) = self.inner.lock().await.take() {
            let _ = inner.pipeline_shutdown_tx.send(true);
            if let Some(handle) = inner.pipeline_task.lock().await.take() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "head pipeline task join failed during dispose");
                }
            }
            inner.module_manager.dispose_all().await?;
        }
        Ok(())
    }
}

fn set_channel(snapshot: &mut ConsentSnapshot, channel: Channel, granted: bool) {
    match channel {
        Channel::Biosignals => snapshot.biosignals = granted,
        Channel::Motion => snapshot.motion = granted,
        Channel::Behavior => snapshot.behavior = granted,
    }
}

fn default_spool_path(device_id: &str) -> std::path::PathBuf {
    crate::storage::encrypted_file::default_base_dir().join(format!("upload-spool-{device_id}.log"))
}

struct NoopModule;
#[async_trait]
impl Module for NoopModule {
    async fn initialize(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn start(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), HsiError> {
        Ok(())
    }
    async fn dispose(&self) -> Result<(), HsiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
    use crate::config::DeviceIdentity;
    use crate::storage::InMemoryStore;

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            platform: "test".into(),
        }
    }

    fn engine() -> SynheartEngine {
        SynheartEngine::new(
            Arc::new(InMemoryStore::new()),
            InMemoryWearAdapter::new(),
            InMemoryPhoneAdapter::new(),
            InMemoryBehaviorAdapter::new(),
        )
    }

    #[tokio::test]
    async fn lifecycle_follows_declared_transitions() {
        let engine = engine();
        assert_eq!(engine.state(), FacadeState::Uninitialized);

        engine
            .initialize(RuntimeConfig::new(device()))
            .await
            .unwrap();
        assert_eq!(engine.state(), FacadeState::Initialized);

        engine.start_data_collection().await.unwrap();
        assert_eq!(engine.state(), FacadeState::Running);

        engine.stop_data_collection().await.unwrap();
        assert_eq!(engine.state(), FacadeState::Stopped);

        engine.dispose().await.unwrap();
        assert_eq!(engine.state(), FacadeState::Disposed);
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let engine = engine();
        engine.initialize(RuntimeConfig::new(device())).await.unwrap();
        let err = engine.initialize(RuntimeConfig::new(device())).await.unwrap_err();
        assert!(matches!(err, HsiError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn grant_consent_unlocks_channel() {
        let engine = engine();
        engine.initialize(RuntimeConfig::new(device())).await.unwrap();
        let status = engine.get_consent_status().await.unwrap();
        assert!(!status.biosignals);

        engine.grant_consent(true, false, false, false).await.unwrap();
        let status = engine.get_consent_status().await.unwrap();
        assert!(status.biosignals);
    }

    #[tokio::test]
    async fn cloud_actions_require_cloud_config() {
        let engine = engine();
        engine.initialize(RuntimeConfig::new(device())).await.unwrap();
        assert!(engine.upload_now().await.is_err());
        assert!(engine.enable_cloud(true).await.is_err());
    }

    #[tokio::test]
    async fn hsv_pipeline_emits_after_start() {
        let engine = engine();
        engine
            .initialize(RuntimeConfig::new(device()))
            .await
            .unwrap();
        let mut rx = engine.subscribe_hsv().await.unwrap();
        engine.start_data_collection().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed())
            .await
            .expect("hsv stream should emit within the fusion cadence")
            .unwrap();
        engine.stop_data_collection().await.unwrap();
        engine.dispose().await.unwrap();
    }
}
