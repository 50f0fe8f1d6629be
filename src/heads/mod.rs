//! Interpretation heads: optional post-processing stages that read a
//! [`HumanStateVector`] produced by the fusion engine and attach
//! higher-level inferences (emotion, focus) gated by consent/capability.

pub mod emotion;
pub mod focus;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use crate::error::HsiError;
use crate::fusion::hsv::HumanStateVector;

pub use emotion::EmotionHead;
pub use focus::FocusHead;

/// Lifecycle of an interpretation head. A head starts `Ready`; a
/// persistent model error transitions it to `Error`, which disables its
/// stream until an explicit restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    Ready,
    Error,
}

/// `AtomicU8`-backed `HeadStatus` storage shared between a head's
/// `process` (which sets it) and the facade pipeline (which reads it
/// before every tick).
#[derive(Default)]
pub struct HeadState(AtomicU8);

impl HeadState {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn status(&self) -> HeadStatus {
        match self.0.load(Ordering::Relaxed) {
            0 => HeadStatus::Ready,
            _ => HeadStatus::Error,
        }
    }

    pub fn mark_error(&self) {
        self.0.store(1, Ordering::Relaxed);
    }

    pub fn restart(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// A head consumes one HSV tick and may annotate it in place. A head with
/// nothing to add this tick (capability disabled, insufficient signal)
/// returns the vector unchanged rather than erroring. `process` returning
/// `Err` after a persistent failure implies the head has already
/// transitioned itself to `Error` via its own `HeadState`.
#[async_trait]
pub trait Head: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, hsv: HumanStateVector) -> Result<HumanStateVector, HsiError>;

    fn status(&self) -> HeadStatus;

    /// Clears `Error` state so the pipeline resumes feeding this head.
    fn restart(&self);

    async fn stop(&self) {}
}
