//! Emotion head: maps the HRV-derived [`EmotionFeatureChannel`] onto a
//! calm/stressed/amused/valence reading.
//!
//! Grounded on [`EmotionFeatureChannel`] rather than embedding slot
//! position, so the head's only dependency on the fusion engine is the
//! named contract in `HsvMeta`.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::HsiError;
use crate::fusion::hsv::{EmotionState, HumanStateVector};
use crate::registry::{features, CapabilitySet};

use super::{HeadState, HeadStatus};

/// Heart rates at or above this are treated as fully "aroused" for the
/// arousal proxy below.
const HR_AROUSAL_CEILING: f64 = 120.0;
/// RMSSD at or above this is treated as fully "calm" autonomic tone.
const RMSSD_CALM_CEILING: f64 = 100.0;

pub struct EmotionHead {
    capabilities: watch::Receiver<CapabilitySet>,
    state: HeadState,
}

impl EmotionHead {
    pub fn new(capabilities: watch::Receiver<CapabilitySet>) -> Self {
        Self {
            capabilities,
            state: HeadState::new(),
        }
    }
}

#[async_trait]
impl super::Head for EmotionHead {
    fn name(&self) -> &'static str {
        "emotion"
    }

    async fn process(&self, mut hsv: HumanStateVector) -> Result<HumanStateVector, HsiError> {
        if self.state.status() == HeadStatus::Error {
            return Err(HsiError::HeadUnavailable("emotion"));
        }

        if !self.capabilities.borrow().is_enabled(features::EMOTION) {
            return Ok(hsv);
        }

        let channel = hsv.meta.emotion_feature_channel;
        if channel.hr_mean <= 0.0 {
            return Ok(hsv);
        }

        if !channel.hr_mean.is_finite()
            || !channel.rmssd.is_finite()
            || !channel.sdnn.is_finite()
            || !channel.pnn50.is_finite()
        {
            self.state.mark_error();
            return Err(HsiError::Fatal(
                "emotion head received non-finite feature channel, head disabled".into(),
            ));
        }

        hsv.emotion = Some(infer(channel));
        Ok(hsv)
    }

    fn status(&self) -> HeadStatus {
        self.state.status()
    }

    fn restart(&self) {
        self.state.restart();
    }
}

fn infer(channel: crate::fusion::hsv::EmotionFeatureChannel) -> EmotionState {
    let arousal = (channel.hr_mean / HR_AROUSAL_CEILING).clamp(0.0, 1.0);
    let hrv_calm = (channel.rmssd / RMSSD_CALM_CEILING).clamp(0.0, 1.0);
    let variability = channel.pnn50.clamp(0.0, 1.0);

    let stressed = (arousal * (1.0 - hrv_calm)).clamp(0.0, 1.0);
    let calm = (hrv_calm * (1.0 - arousal)).clamp(0.0, 1.0);
    let amused = (variability * hrv_calm * arousal.max(0.2)).clamp(0.0, 1.0);
    let valence = (calm + amused - stressed).clamp(-1.0, 1.0);

    EmotionState {
        calm,
        stressed,
        amused,
        valence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::hsv::EmotionFeatureChannel;

    fn enabled_capabilities() -> watch::Receiver<CapabilitySet> {
        let registry = crate::registry::CapabilityRegistry::new(None);
        registry.on_token_update(Some(&crate::consent::ConsentToken {
            jwt: "x".into(),
            expires_at: i64::MAX,
            profile_id: "p1".into(),
            scopes: [features::EMOTION.to_string()].into_iter().collect(),
            claims: serde_json::Map::new(),
        }));
        registry.subscribe()
    }

    fn base_hsv() -> HumanStateVector {
        crate::fusion::placeholder_hsv("s1", "d1")
    }

    #[tokio::test]
    async fn drops_tick_with_no_heart_rate() {
        use super::super::Head;
        let head = EmotionHead::new(enabled_capabilities());
        let hsv = head.process(base_hsv()).await.unwrap();
        assert!(hsv.emotion.is_none());
    }

    #[tokio::test]
    async fn disabled_capability_passes_through() {
        use super::super::Head;
        let registry = crate::registry::CapabilityRegistry::new(None);
        let head = EmotionHead::new(registry.subscribe());
        let mut hsv = base_hsv();
        hsv.meta.emotion_feature_channel.hr_mean = 90.0;
        let result = head.process(hsv).await.unwrap();
        assert!(result.emotion.is_none());
    }

    #[tokio::test]
    async fn high_hr_low_hrv_reads_as_stressed() {
        use super::super::Head;
        let head = EmotionHead::new(enabled_capabilities());
        let mut hsv = base_hsv();
        hsv.meta.emotion_feature_channel = EmotionFeatureChannel {
            hr_mean: 110.0,
            rmssd: 10.0,
            sdnn: 10.0,
            pnn50: 0.05,
            mean_rr: 600.0,
        };
        let result = head.process(hsv).await.unwrap();
        let emotion = result.emotion.unwrap();
        assert!(emotion.stressed > emotion.calm);
        assert!(emotion.valence < 0.0);
    }

    #[tokio::test]
    async fn non_finite_input_disables_the_head_until_restart() {
        use super::super::Head;
        let head = EmotionHead::new(enabled_capabilities());
        let mut hsv = base_hsv();
        hsv.meta.emotion_feature_channel = EmotionFeatureChannel {
            hr_mean: 90.0,
            rmssd: f64::NAN,
            sdnn: 10.0,
            pnn50: 0.05,
            mean_rr: 600.0,
        };
        assert!(head.process(hsv.clone()).await.is_err());
        assert_eq!(head.status(), HeadStatus::Error);

        // Once disabled, even a well-formed tick is rejected without being
        // processed.
        let mut good_hsv = base_hsv();
        good_hsv.meta.emotion_feature_channel.hr_mean = 80.0;
        assert!(head.process(good_hsv.clone()).await.is_err());

        head.restart();
        assert_eq!(head.status(), HeadStatus::Ready);
        assert!(head.process(good_hsv).await.is_ok());
    }
}
