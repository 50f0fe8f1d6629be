//! Core data model shared across the runtime: windowed feature shapes and
//! raw per-channel samples.
//!
//! This module covers the parts of the data model that are not owned by a
//! more specific subsystem (consent types live in [`crate::consent::types`],
//! behavior session types in [`crate::channels::behavior`], HSV and
//! embedding types in [`crate::fusion::hsv`]). It is the vendor-agnostic
//! record shapes that flow between channel aggregators and the fusion
//! engine.

use serde::{Deserialize, Serialize};

/// Aggregation horizon for a channel's windowed features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Seconds30,
    Minutes5,
    Hours1,
    Hours24,
}

impl WindowType {
    /// Window length in milliseconds.
    pub const fn as_millis(&self) -> i64 {
        match self {
            WindowType::Seconds30 => 30_000,
            WindowType::Minutes5 => 5 * 60_000,
            WindowType::Hours1 => 60 * 60_000,
            WindowType::Hours24 => 24 * 60 * 60_000,
        }
    }

    /// Minimum fraction of the window that must be covered by samples for
    /// features to be emitted rather than treated as "no data".
    pub fn min_coverage(&self) -> f64 {
        match self {
            WindowType::Seconds30 => 0.5,
            WindowType::Minutes5 => 0.3,
            WindowType::Hours1 => 0.1,
            WindowType::Hours24 => 0.05,
        }
    }
}

/// Sleep stage classification reported by wear sources (vendor-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    Awake,
    Light,
    Deep,
    Rem,
    Unknown,
}

/// A single raw wear (biosignal/motion) sample, as delivered by a
/// [`crate::adapters::WearSourceAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WearSample {
    /// Epoch milliseconds (UTC), wall-clock time of the reading.
    pub timestamp: i64,
    pub hr: Option<f64>,
    pub hrv_rmssd: Option<f64>,
    pub resp_rate: Option<f64>,
    pub motion_level: Option<f64>,
    pub sleep_stage: Option<SleepStage>,
    #[serde(default)]
    pub rr_intervals: Vec<f64>,
}

/// Tagged union of behavior interaction events (spec §3 `BehaviorEvent`).
///
/// This is the *channel-level* raw event used for windowed aggregation and
/// raw-sample fan-out; see [`crate::channels::behavior::SessionEvent`] for
/// the richer, typed payload used by explicit session tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorEventKind {
    Tap,
    Scroll,
    Swipe,
    Typing,
    Notification,
    Call,
    AppSwitch,
}

/// A single behavior event within a session. Insertion order matters: it
/// is an ordered sequence per `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub session_id: String,
    /// Epoch milliseconds (UTC).
    pub timestamp: i64,
    pub kind: BehaviorEventKind,
    #[serde(default)]
    pub metrics: std::collections::HashMap<String, f64>,
}

/// Windowed features derived from the wear channel.
///
/// Invariant: only constructed when `coverage_ratio >= window.min_coverage()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WearWindowFeatures {
    pub hr_avg: f64,
    pub hrv_rmssd_avg: f64,
    pub resp_rate_avg: f64,
    pub motion_level_avg: f64,
    pub sample_count: usize,
    pub coverage_ratio: f64,
}

/// Windowed features derived from the behavior channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BehaviorWindowFeatures {
    pub tap_rate_norm: f64,
    pub keystroke_rate: f64,
    pub typing_burstiness: f64,
    pub scroll_velocity: f64,
    pub app_switch_rate: f64,
    pub idle_gaps: f64,
    pub focus_hint: f64,
}

/// Windowed features derived from the phone channel (motion/screen/foreground).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhoneWindowFeatures {
    pub motion_index: f64,
    pub posture_stability: f64,
    pub screen_on_ratio: f64,
    pub foreground_app_changes: f64,
}

/// A single phone-channel raw sample (motion + screen/foreground state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneSample {
    /// Epoch milliseconds (UTC).
    pub timestamp: i64,
    pub motion_magnitude: Option<f64>,
    pub screen_on: Option<bool>,
    pub foreground_app_id: Option<String>,
}
