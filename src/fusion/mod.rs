//! Fusion Engine: the fixed-cadence ticker that pulls windowed features
//! from each channel, normalizes them, computes the axis bundles and
//! embedding, and publishes the resulting [`HumanStateVector`].

pub mod axes;
pub mod embedding;
pub mod hsv;
pub mod normalize;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::channels::{BehaviorChannel, PhoneChannel, WearChannel};
use crate::error::HsiError;
use crate::types::WindowType;

use axes::NormalizedFeatures;
use embedding::FEATURE_DIM;
use hsv::{EmotionFeatureChannel, HsvMeta, HumanStateVector, HSV_VERSION};

const DEFAULT_CADENCE_HZ: f64 = 2.0;
const FEATURE_WINDOW: WindowType = WindowType::Seconds30;

/// `Idle -> Initialized -> Running -> Stopped`; `Running -> Error`;
/// `Error -> Initialized`; terminal `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FusionState {
    Idle = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
    Error = 4,
    Disposed = 5,
}

impl FusionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopped,
            4 => Self::Error,
            _ => Self::Disposed,
        }
    }

    fn can_transition_to(self, to: FusionState) -> bool {
        use FusionState::*;
        matches!(
            (self, to),
            (Idle, Initialized)
                | (Initialized, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Initialized)
                | (Running, Error)
                | (Error, Initialized)
                | (_, Disposed)
        )
    }
}

pub fn placeholder_hsv(session_id: &str, device: &str) -> HumanStateVector {
    HumanStateVector {
        version: HSV_VERSION.to_string(),
        timestamp: 0,
        emotion: None,
        focus: None,
        behavior: crate::types::BehaviorWindowFeatures {
            tap_rate_norm: 0.0,
            keystroke_rate: 0.0,
            typing_burstiness: 0.0,
            scroll_velocity: 0.0,
            app_switch_rate: 0.0,
            idle_gaps: 0.0,
            focus_hint: 0.0,
        },
        context: crate::types::PhoneWindowFeatures {
            motion_index: 0.0,
            posture_stability: 0.0,
            screen_on_ratio: 0.0,
            foreground_app_changes: 0.0,
        },
        meta: HsvMeta {
            session_id: session_id.to_string(),
            device: device.to_string(),
            sampling_rate_hz: 0.0,
            embedding: vec![0.0; hsv::EMBEDDING_DIM],
            axes: {
                let zero = NormalizedFeatures {
                    hr_norm: 0.0,
                    hrv_norm: 0.0,
                    wear_motion_norm: 0.0,
                    tap_rate_norm: 0.0,
                    keystroke_rate_norm: 0.0,
                    typing_burstiness: 0.0,
                    idle_gaps: 0.0,
                    phone_motion_norm: 0.0,
                    posture_stability: 0.0,
                    screen_on_ratio: 0.0,
                    foreground_changes_norm: 0.0,
                };
                let (affect, engagement, activity, context) = axes::compute(&zero);
                hsv::AxisBundles {
                    affect,
                    engagement,
                    activity,
                    context,
                }
            },
            emotion_feature_channel: EmotionFeatureChannel {
                hr_mean: 0.0,
                rmssd: 0.0,
                sdnn: 0.0,
                pnn50: 0.0,
                mean_rr: 0.0,
            },
        },
    }
}

pub struct FusionEngine {
    state: AtomicU8,
    wear: Arc<WearChannel>,
    phone: Arc<PhoneChannel>,
    behavior: Arc<BehaviorChannel>,
    hsv_tx: watch::Sender<HumanStateVector>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    imputer: Mutex<normalize::EwmaImputer>,
    session_id: String,
    device_id: String,
    cadence_hz: f64,
}

impl FusionEngine {
    pub fn new(
        wear: Arc<WearChannel>,
        phone: Arc<PhoneChannel>,
        behavior: Arc<BehaviorChannel>,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        let device_id = device_id.into();
        let (hsv_tx, _rx) = watch::channel(placeholder_hsv(&session_id, &device_id));
        let (shutdown_tx, _rx2) = watch::channel(false);
        Self {
            state: AtomicU8::new(FusionState::Idle as u8),
            wear,
            phone,
            behavior,
            hsv_tx,
            shutdown_tx,
            task: Mutex::new(None),
            imputer: Mutex::new(normalize::EwmaImputer::new()),
            session_id,
            device_id,
            cadence_hz: DEFAULT_CADENCE_HZ,
        }
    }

    pub fn with_cadence_hz(mut self, cadence_hz: f64) -> Self {
        self.cadence_hz = cadence_hz;
        self
    }

    pub fn state(&self) -> FusionState {
        FusionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, to: FusionState) -> Result<(), HsiError> {
        let current = self.state();
        if !current.can_transition_to(to) {
            return Err(HsiError::InvalidConfig(format!(
                "invalid fusion state transition {current:?} -> {to:?}"
            )));
        }
        self.state.store(to as u8, Ordering::SeqCst);
        Ok(())
    }

    pub fn initialize(&self) -> Result<(), HsiError> {
        self.transition(FusionState::Initialized)
    }

    pub fn subscribe(&self) -> watch::Receiver<HumanStateVector> {
        self.hsv_tx.subscribe()
    }

    pub fn current(&self) -> HumanStateVector {
        self.hsv_tx.borrow().clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), HsiError> {
        self.transition(FusionState::Running)?;
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_secs_f64(1.0 / self.cadence_hz);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.tick().await {
                            error!(error = %e, "fusion tick failed");
                            let _ = engine.transition(FusionState::Error);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HsiError> {
        self.transition(FusionState::Stopped)?;
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "fusion engine task join failed");
            }
        }
        Ok(())
    }

    pub fn dispose(&self) {
        let _ = self.transition(FusionState::Disposed);
        let _ = self.shutdown_tx.send(true);
    }

    async fn tick(&self) -> Result<(), HsiError> {
        let now_ms = crate::now_ms();
        let wear = self.wear.features(now_ms, FEATURE_WINDOW).await;
        let behavior = self.behavior.features(now_ms, FEATURE_WINDOW).await;
        let phone = self.phone.features(now_ms, FEATURE_WINDOW).await;

        let mut imputer = self.imputer.lock().await;
        let hr_norm = observe_or_impute(&mut imputer, "hr_norm", wear.as_ref().map(|w| w.hr_avg / 200.0), 0.0, 1.0);
        let hrv_norm = observe_or_impute(&mut imputer, "hrv_norm", wear.as_ref().map(|w| w.hrv_rmssd_avg / 100.0), 0.0, 1.0);
        let resp_norm = observe_or_impute(&mut imputer, "resp_norm", wear.as_ref().map(|w| w.resp_rate_avg / 40.0), 0.0, 1.0);
        let wear_motion_norm = observe_or_impute(&mut imputer, "wear_motion_norm", wear.as_ref().map(|w| w.motion_level_avg), 0.0, 1.0);

        let tap_rate_norm = observe_or_impute(&mut imputer, "tap_rate_norm", behavior.as_ref().map(|b| b.tap_rate_norm), 0.0, 1.0);
        let keystroke_rate = observe_or_impute(&mut imputer, "keystroke_rate", behavior.as_ref().map(|b| b.keystroke_rate), 0.0, 300.0);
        let keystroke_rate_norm = (keystroke_rate / 120.0).clamp(0.0, 1.0);
        let typing_burstiness = observe_or_impute(&mut imputer, "typing_burstiness", behavior.as_ref().map(|b| b.typing_burstiness), -1.0, 1.0);
        let scroll_velocity = observe_or_impute(&mut imputer, "scroll_velocity", behavior.as_ref().map(|b| b.scroll_velocity), 0.0, 10_000.0);
        let app_switch_rate = observe_or_impute(&mut imputer, "app_switch_rate", behavior.as_ref().map(|b| b.app_switch_rate), 0.0, 120.0);
        let app_switch_norm = (app_switch_rate / 30.0).clamp(0.0, 1.0);
        let idle_gaps = observe_or_impute(&mut imputer, "idle_gaps", behavior.as_ref().map(|b| b.idle_gaps), 0.0, 1.0);
        let focus_hint = observe_or_impute(&mut imputer, "focus_hint", behavior.as_ref().map(|b| b.focus_hint), 0.0, 1.0);

        let phone_motion_norm = observe_or_impute(&mut imputer, "phone_motion_norm", phone.as_ref().map(|p| p.motion_index), 0.0, 1.0);
        let posture_stability = observe_or_impute(&mut imputer, "posture_stability", phone.as_ref().map(|p| p.posture_stability), 0.0, 1.0);
        let screen_on_ratio = observe_or_impute(&mut imputer, "screen_on_ratio", phone.as_ref().map(|p| p.screen_on_ratio), 0.0, 1.0);
        let foreground_changes_norm = observe_or_impute(&mut imputer, "foreground_changes_norm", phone.as_ref().map(|p| p.foreground_app_changes / 20.0), 0.0, 1.0);
        drop(imputer);

        let normalized = NormalizedFeatures {
            hr_norm,
            hrv_norm,
            wear_motion_norm,
            tap_rate_norm,
            keystroke_rate_norm,
            typing_burstiness,
            idle_gaps,
            phone_motion_norm,
            posture_stability,
            screen_on_ratio,
            foreground_changes_norm,
        };
        let (affect, engagement, activity, context_axis) = axes::compute(&normalized);

        let feature_vector: [f64; FEATURE_DIM] = [
            hr_norm,
            hrv_norm,
            wear_motion_norm,
            resp_norm,
            tap_rate_norm,
            keystroke_rate_norm,
            typing_burstiness,
            (scroll_velocity / 2_000.0).clamp(0.0, 1.0),
            app_switch_norm,
            idle_gaps,
            focus_hint,
            phone_motion_norm,
            posture_stability,
            screen_on_ratio,
            foreground_changes_norm,
            0.0,
        ];
        let embedding = embedding::project(&feature_vector);

        let rr_intervals = self.wear.rr_intervals(now_ms, FEATURE_WINDOW.as_millis()).await;
        let hr_mean = wear.as_ref().map(|w| w.hr_avg).unwrap_or(0.0);
        let emotion_feature_channel = EmotionFeatureChannel::derive(hr_mean, &rr_intervals);

        let hsv = HumanStateVector {
            version: HSV_VERSION.to_string(),
            timestamp: now_ms,
            emotion: None,
            focus: None,
            behavior: behavior.unwrap_or(crate::types::BehaviorWindowFeatures {
                tap_rate_norm,
                keystroke_rate,
                typing_burstiness,
                scroll_velocity,
                app_switch_rate,
                idle_gaps,
                focus_hint,
            }),
            context: phone.unwrap_or(crate::types::PhoneWindowFeatures {
                motion_index: phone_motion_norm,
                posture_stability,
                screen_on_ratio,
                foreground_app_changes: foreground_changes_norm * 20.0,
            }),
            meta: HsvMeta {
                session_id: self.session_id.clone(),
                device: self.device_id.clone(),
                sampling_rate_hz: self.cadence_hz,
                embedding: embedding.to_vec(),
                axes: hsv::AxisBundles {
                    affect,
                    engagement,
                    activity,
                    context: context_axis,
                },
                emotion_feature_channel,
            },
        };

        if !hsv.is_well_formed() {
            return Err(HsiError::Fatal("fusion tick produced a non-finite HSV".into()));
        }

        self.hsv_tx.send_replace(hsv);
        Ok(())
    }
}

fn observe_or_impute(
    imputer: &mut normalize::EwmaImputer,
    key: &'static str,
    value: Option<f64>,
    lo: f64,
    hi: f64,
) -> f64 {
    match value {
        Some(v) => imputer.observe(key, v, lo, hi),
        None => imputer.impute(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
    use crate::consent::ConsentStore;
    use crate::storage::InMemoryStore;
    use std::sync::Arc as StdArc;

    async fn consented_store() -> ConsentStore {
        let store = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let mut snap = store.current();
        snap.biosignals = true;
        snap.motion = true;
        snap.behavior = true;
        store.update(snap).await.unwrap();
        store
    }

    async fn engine() -> StdArc<FusionEngine> {
        let consent = consented_store().await;
        let wear = StdArc::new(WearChannel::new(consent.clone(), InMemoryWearAdapter::new()));
        let phone = StdArc::new(PhoneChannel::new(consent.clone(), InMemoryPhoneAdapter::new()));
        let behavior = StdArc::new(BehaviorChannel::new(consent, InMemoryBehaviorAdapter::new()));
        wear.start().await.unwrap();
        phone.start().await.unwrap();
        behavior.start().await.unwrap();
        StdArc::new(FusionEngine::new(wear, phone, behavior, "sess-1", "device-1"))
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = engine().await;
            assert!(engine.start().await.is_err());
        });
    }

    #[tokio::test]
    async fn tick_emits_well_formed_hsv_with_no_data() {
        let engine = engine().await;
        engine.initialize().unwrap();
        engine.tick().await.unwrap();
        let hsv = engine.current();
        assert!(hsv.is_well_formed());
        assert_eq!(hsv.behavior.tap_rate_norm, 0.0);
        assert_eq!(hsv.context.screen_on_ratio, 0.0);
    }

    #[tokio::test]
    async fn state_machine_follows_declared_transitions() {
        let engine = engine().await;
        assert_eq!(engine.state(), FusionState::Idle);
        engine.initialize().unwrap();
        assert_eq!(engine.state(), FusionState::Initialized);
        engine.start().await.unwrap();
        assert_eq!(engine.state(), FusionState::Running);
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), FusionState::Stopped);
    }
}
