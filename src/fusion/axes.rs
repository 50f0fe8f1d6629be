//! Axis bundle formulas: affect from HRV/arousal proxies, engagement from
//! interaction cadence + stability, activity from motion proxies, context
//! from screen/foreground state.
//!
//! Inputs are assumed already clipped to `[0,1]` by the caller (the
//! fusion tick's normalization pass); each formula below documents which
//! feature it is monotone in, per the HSV invariant.

use super::hsv::{ActivityAxis, AffectAxis, ContextAxis, EngagementAxis};

/// Normalized, per-tick inputs to the axis formulas. Values in `[0,1]`
/// unless noted.
pub struct NormalizedFeatures {
    pub hr_norm: f64,
    pub hrv_norm: f64,
    pub wear_motion_norm: f64,
    pub tap_rate_norm: f64,
    pub keystroke_rate_norm: f64,
    pub typing_burstiness: f64,
    pub idle_gaps: f64,
    pub phone_motion_norm: f64,
    pub posture_stability: f64,
    pub screen_on_ratio: f64,
    pub foreground_changes_norm: f64,
}

/// Monotone increasing in `hr_norm`, decreasing in `hrv_norm` (elevated
/// heart rate with suppressed HRV reads as higher arousal).
fn arousal_index(f: &NormalizedFeatures) -> f64 {
    (f.hr_norm * (1.0 - f.hrv_norm)).clamp(0.0, 1.0)
}

/// Monotone increasing in `hrv_norm`: higher HRV is read as a more
/// positive/calm autonomic state.
fn valence_estimate(f: &NormalizedFeatures) -> f64 {
    (2.0 * f.hrv_norm - 1.0).clamp(-1.0, 1.0)
}

/// Monotone increasing in `hrv_norm`: a high, steady HRV reading is
/// treated as a stable affective state.
fn valence_stability(f: &NormalizedFeatures) -> f64 {
    (2.0 * f.hrv_norm - 1.0).clamp(-1.0, 1.0)
}

/// Monotone increasing in tap/keystroke cadence.
fn cadence_index(f: &NormalizedFeatures) -> f64 {
    (0.5 * f.tap_rate_norm + 0.5 * f.keystroke_rate_norm).clamp(0.0, 1.0)
}

/// Monotone decreasing in idle time and typing burstiness: steady,
/// low-idle interaction reads as stable engagement.
fn stability_index(f: &NormalizedFeatures) -> f64 {
    (1.0 - f.idle_gaps).clamp(0.0, 1.0) * (1.0 - f.typing_burstiness.abs()).clamp(0.0, 1.0)
}

/// Monotone increasing in both wear and phone motion readings.
fn motion_index(f: &NormalizedFeatures) -> f64 {
    (0.5 * f.wear_motion_norm + 0.5 * f.phone_motion_norm).clamp(0.0, 1.0)
}

/// Monotone increasing in `posture_stability`.
fn posture_index(f: &NormalizedFeatures) -> f64 {
    f.posture_stability.clamp(0.0, 1.0)
}

/// Monotone increasing in `screen_on_ratio`.
fn screen_active_ratio(f: &NormalizedFeatures) -> f64 {
    f.screen_on_ratio.clamp(0.0, 1.0)
}

/// Monotone increasing in `foreground_changes_norm`.
fn foreground_switch_index(f: &NormalizedFeatures) -> f64 {
    f.foreground_changes_norm.clamp(0.0, 1.0)
}

pub fn compute(f: &NormalizedFeatures) -> (AffectAxis, EngagementAxis, ActivityAxis, ContextAxis) {
    (
        AffectAxis {
            arousal_index: arousal_index(f),
            valence_estimate: valence_estimate(f),
            valence_stability: valence_stability(f),
        },
        EngagementAxis {
            cadence_index: cadence_index(f),
            stability_index: stability_index(f),
        },
        ActivityAxis {
            motion_index: motion_index(f),
            posture_index: posture_index(f),
        },
        ContextAxis {
            screen_active_ratio: screen_active_ratio(f),
            foreground_switch_index: foreground_switch_index(f),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NormalizedFeatures {
        NormalizedFeatures {
            hr_norm: 0.5,
            hrv_norm: 0.5,
            wear_motion_norm: 0.2,
            tap_rate_norm: 0.3,
            keystroke_rate_norm: 0.3,
            typing_burstiness: 0.0,
            idle_gaps: 0.1,
            phone_motion_norm: 0.2,
            posture_stability: 0.8,
            screen_on_ratio: 0.9,
            foreground_changes_norm: 0.1,
        }
    }

    #[test]
    fn arousal_increases_with_hr_and_low_hrv() {
        let low_hr = base();
        let mut high_hr = base();
        high_hr.hr_norm = 0.9;
        let (low, _, _, _) = compute(&low_hr);
        let (high, _, _, _) = compute(&high_hr);
        assert!(high.arousal_index >= low.arousal_index);
    }

    #[test]
    fn all_axes_in_declared_ranges() {
        let (affect, engagement, activity, context) = compute(&base());
        assert!((0.0..=1.0).contains(&affect.arousal_index));
        assert!((-1.0..=1.0).contains(&affect.valence_estimate));
        assert!((0.0..=1.0).contains(&engagement.cadence_index));
        assert!((0.0..=1.0).contains(&activity.motion_index));
        assert!((0.0..=1.0).contains(&context.screen_active_ratio));
    }
}
