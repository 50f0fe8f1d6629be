//! The Human State Vector and its constituent types.

use serde::{Deserialize, Serialize};

use crate::types::{BehaviorWindowFeatures, PhoneWindowFeatures};

pub const HSV_VERSION: &str = "1.0.0";
pub const EMBEDDING_DIM: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AffectAxis {
    pub arousal_index: f64,
    pub valence_estimate: f64,
    pub valence_stability: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngagementAxis {
    pub cadence_index: f64,
    pub stability_index: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActivityAxis {
    pub motion_index: f64,
    pub posture_index: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextAxis {
    pub screen_active_ratio: f64,
    pub foreground_switch_index: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisBundles {
    pub affect: AffectAxis,
    pub engagement: EngagementAxis,
    pub activity: ActivityAxis,
    pub context: ContextAxis,
}

/// The five HRV-derived features the emotion head needs. Carried
/// alongside the embedding as a named contract rather than implied by
/// embedding slot position, so the coupling between fusion and the head
/// is explicit and can be changed without renumbering slots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmotionFeatureChannel {
    pub hr_mean: f64,
    pub rmssd: f64,
    pub sdnn: f64,
    pub pnn50: f64,
    pub mean_rr: f64,
}

impl EmotionFeatureChannel {
    /// Derive the channel from a window's HR average and raw RR
    /// intervals (milliseconds). Returns all-zero if no RR data is
    /// available; `hr_mean` still reflects the channel average.
    pub fn derive(hr_mean: f64, rr_intervals_ms: &[f64]) -> Self {
        if rr_intervals_ms.len() < 2 {
            return Self {
                hr_mean,
                rmssd: 0.0,
                sdnn: 0.0,
                pnn50: 0.0,
                mean_rr: rr_intervals_ms.first().copied().unwrap_or(0.0),
            };
        }

        let mean_rr = rr_intervals_ms.iter().sum::<f64>() / rr_intervals_ms.len() as f64;
        let variance = rr_intervals_ms
            .iter()
            .map(|rr| (rr - mean_rr).powi(2))
            .sum::<f64>()
            / rr_intervals_ms.len() as f64;
        let sdnn = variance.sqrt();

        let diffs: Vec<f64> = rr_intervals_ms.windows(2).map(|w| w[1] - w[0]).collect();
        let rmssd = (diffs.iter().map(|d| d.powi(2)).sum::<f64>() / diffs.len() as f64).sqrt();
        let pnn50 = diffs.iter().filter(|d| d.abs() > 50.0).count() as f64 / diffs.len() as f64;

        Self {
            hr_mean,
            rmssd,
            sdnn,
            pnn50,
            mean_rr,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmotionState {
    pub calm: f64,
    pub stressed: f64,
    pub amused: f64,
    pub valence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FocusState {
    pub focus_score: f64,
    pub distraction_index: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsvMeta {
    pub session_id: String,
    pub device: String,
    pub sampling_rate_hz: f64,
    pub embedding: Vec<f64>,
    pub axes: AxisBundles,
    pub emotion_feature_channel: EmotionFeatureChannel,
}

/// Versioned, immutable-once-created record summarizing inferred human
/// state at one fusion tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanStateVector {
    pub version: String,
    /// Epoch milliseconds (UTC).
    pub timestamp: i64,
    pub emotion: Option<EmotionState>,
    pub focus: Option<FocusState>,
    pub behavior: BehaviorWindowFeatures,
    pub context: PhoneWindowFeatures,
    pub meta: HsvMeta,
}

impl HumanStateVector {
    /// All numeric fields finite and `embedding.len() == EMBEDDING_DIM`,
    /// per the wire-format invariant.
    pub fn is_well_formed(&self) -> bool {
        if self.meta.embedding.len() != EMBEDDING_DIM {
            return false;
        }
        self.meta.embedding.iter().all(|v| v.is_finite())
            && self.behavior.tap_rate_norm.is_finite()
            && self.context.motion_index.is_finite()
            && self.meta.sampling_rate_hz.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emotion_feature_channel_from_rr_intervals() {
        let channel = EmotionFeatureChannel::derive(72.0, &[800.0, 820.0, 780.0, 810.0]);
        assert_eq!(channel.hr_mean, 72.0);
        assert!(channel.sdnn > 0.0);
        assert!(channel.rmssd > 0.0);
    }

    #[test]
    fn emotion_feature_channel_handles_sparse_rr() {
        let channel = EmotionFeatureChannel::derive(0.0, &[]);
        assert_eq!(channel.mean_rr, 0.0);
        assert_eq!(channel.sdnn, 0.0);
    }
}
