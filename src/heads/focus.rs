//! Focus head: combines the behavior channel's interaction-cadence focus
//! hint with the fusion engine's engagement/context axes into a single
//! focus/distraction reading.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::HsiError;
use crate::fusion::hsv::{FocusState, HumanStateVector};
use crate::registry::{features, CapabilitySet};

use super::{HeadState, HeadStatus};

pub struct FocusHead {
    capabilities: watch::Receiver<CapabilitySet>,
    state: HeadState,
}

impl FocusHead {
    pub fn new(capabilities: watch::Receiver<CapabilitySet>) -> Self {
        Self {
            capabilities,
            state: HeadState::new(),
        }
    }
}

#[async_trait]
impl super::Head for FocusHead {
    fn name(&self) -> &'static str {
        "focus"
    }

    async fn process(&self, mut hsv: HumanStateVector) -> Result<HumanStateVector, HsiError> {
        if self.state.status() == HeadStatus::Error {
            return Err(HsiError::HeadUnavailable("focus"));
        }

        if !self.capabilities.borrow().is_enabled(features::FOCUS) {
            return Ok(hsv);
        }

        let focus_score = (0.6 * hsv.behavior.focus_hint + 0.4 * hsv.meta.axes.engagement.stability_index)
            .clamp(0.0, 1.0);
        let distraction_index = (0.5 * hsv.meta.axes.context.foreground_switch_index
            + 0.5 * hsv.behavior.idle_gaps)
            .clamp(0.0, 1.0);

        if !focus_score.is_finite() || !distraction_index.is_finite() {
            self.state.mark_error();
            return Err(HsiError::Fatal(
                "focus head produced a non-finite reading, head disabled".into(),
            ));
        }

        hsv.focus = Some(FocusState {
            focus_score,
            distraction_index,
        });
        Ok(hsv)
    }

    fn status(&self) -> HeadStatus {
        self.state.status()
    }

    fn restart(&self) {
        self.state.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_capabilities() -> watch::Receiver<CapabilitySet> {
        let registry = crate::registry::CapabilityRegistry::new(None);
        registry.on_token_update(Some(&crate::consent::ConsentToken {
            jwt: "x".into(),
            expires_at: i64::MAX,
            profile_id: "p1".into(),
            scopes: [features::FOCUS.to_string()].into_iter().collect(),
            claims: serde_json::Map::new(),
        }));
        registry.subscribe()
    }

    #[tokio::test]
    async fn disabled_capability_passes_through() {
        use super::super::Head;
        let registry = crate::registry::CapabilityRegistry::new(None);
        let head = FocusHead::new(registry.subscribe());
        let hsv = head.process(crate::fusion::placeholder_hsv("s1", "d1")).await.unwrap();
        assert!(hsv.focus.is_none());
    }

    #[tokio::test]
    async fn steady_low_idle_behavior_reads_as_focused() {
        use super::super::Head;
        let head = FocusHead::new(enabled_capabilities());
        let mut hsv = crate::fusion::placeholder_hsv("s1", "d1");
        hsv.behavior.focus_hint = 0.9;
        hsv.behavior.idle_gaps = 0.05;
        hsv.meta.axes.engagement.stability_index = 0.8;
        let result = head.process(hsv).await.unwrap();
        let focus = result.focus.unwrap();
        assert!(focus.focus_score > 0.7);
        assert!(focus.distraction_index < 0.3);
    }

    #[tokio::test]
    async fn non_finite_reading_disables_the_head_until_restart() {
        use super::super::Head;
        let head = FocusHead::new(enabled_capabilities());
        let mut hsv = crate::fusion::placeholder_hsv("s1", "d1");
        hsv.behavior.focus_hint = f64::NAN;
        assert!(head.process(hsv).await.is_err());
        assert_eq!(head.status(), HeadStatus::Error);

        head.restart();
        assert_eq!(head.status(), HeadStatus::Ready);
    }
}
