//! Source adapter boundary traits.
//!
//! Real wear/phone/behavior sources (BLE wearables, platform sensor APIs,
//! OS accessibility services) live outside this crate; each channel talks
//! to its source only through one of these traits, so swapping in a real
//! adapter never touches aggregation or fusion code. An in-memory adapter
//! is provided for each for tests and the demo CLI.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::HsiError;
use crate::types::{BehaviorEvent, PhoneSample, WearSample};

/// Pushes [`WearSample`]s at a polling cadence the channel controls via
/// [`WearSourceAdapter::set_interval`].
#[async_trait]
pub trait WearSourceAdapter: Send + Sync {
    async fn start(&self, tx: mpsc::Sender<WearSample>) -> Result<(), HsiError>;
    async fn stop(&self);
    /// Changes polling cadence; takes effect by cancelling and
    /// re-subscribing to the underlying source stream.
    async fn set_interval(&self, interval_ms: u64);
}

/// Pushes [`PhoneSample`]s (motion + screen/foreground state).
#[async_trait]
pub trait PhoneSourceAdapter: Send + Sync {
    async fn start(&self, tx: mpsc::Sender<PhoneSample>) -> Result<(), HsiError>;
    async fn stop(&self);
}

/// Pushes [`BehaviorEvent`]s (taps, scrolls, typing, notifications, calls).
#[async_trait]
pub trait BehaviorSourceAdapter: Send + Sync {
    async fn start(&self, tx: mpsc::Sender<BehaviorEvent>) -> Result<(), HsiError>;
    async fn stop(&self);
}

pub mod in_memory;

pub use in_memory::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
