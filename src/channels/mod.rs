//! Channel aggregators: wear, phone, and behavior. Each owns a consent
//! gate, a time-ordered ring buffer, and a raw-sample broadcast stream,
//! and presents the same shape: `start`/`stop`, `features(window)`,
//! `clear_cache`, `update_collection_interval`.

pub mod behavior;
pub mod phone;
pub mod ring_buffer;
pub mod wear;

pub use behavior::BehaviorChannel;
pub use phone::PhoneChannel;
pub use wear::WearChannel;

/// Default retention: the largest window any channel serves.
pub const MAX_RETENTION_MS: i64 = crate::types::WindowType::Hours24.as_millis();
