//! Synheart - on-device Human State Inference runtime.
//!
//! Aggregates consented wear/phone/behavior signals into a versioned
//! Human State Vector through a deterministic pipeline: channel
//! aggregation → fusion → interpretation heads → (optional) cloud
//! upload, all gated by a consent subsystem that is the runtime's single
//! source of truth for what may be collected or exported.

use std::sync::{Arc, OnceLock};

pub mod adapters;
pub mod channels;
pub mod config;
pub mod consent;
pub mod error;
pub mod facade;
pub mod fusion;
pub mod heads;
pub mod module_manager;
pub mod registry;
pub mod storage;
pub mod types;
pub mod upload;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use error::HsiError;
pub use facade::{FacadeState, SynheartEngine};

/// Runtime version embedded in every Human State Vector.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name recorded alongside uploaded snapshots.
pub const PRODUCER_NAME: &str = "synheart-runtime";

static ENGINE: OnceLock<Arc<SynheartEngine>> = OnceLock::new();

/// Process-wide singleton accessor, purely for API ergonomics. Callers
/// who want an explicitly scoped, disposable instance (most tests, and
/// any host embedding more than one engine) should construct
/// `SynheartEngine::new` directly instead.
pub fn synheart_engine(
    storage: Arc<dyn storage::SecureStore>,
    wear_adapter: Arc<dyn adapters::WearSourceAdapter>,
    phone_adapter: Arc<dyn adapters::PhoneSourceAdapter>,
    behavior_adapter: Arc<dyn adapters::BehaviorSourceAdapter>,
) -> Arc<SynheartEngine> {
    ENGINE
        .get_or_init(|| Arc::new(SynheartEngine::new(storage, wear_adapter, phone_adapter, behavior_adapter)))
        .clone()
}

/// Current wall-clock time as epoch milliseconds (UTC). All runtime
/// timestamps flow through here so tests can observe real clock behavior
/// without a mockable-clock abstraction.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
