//! Error taxonomy for the Synheart runtime.

use thiserror::Error;

/// Data channel identifiers used in channel-scoped error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Biosignals,
    Motion,
    Behavior,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Biosignals => "biosignals",
            Channel::Motion => "motion",
            Channel::Behavior => "behavior",
        };
        f.write_str(s)
    }
}

/// Structured errors surfaced by the runtime's public API.
///
/// Recovery policy: transient I/O errors (`NetworkTransient`) are retried
/// locally by the owning subsystem and normally never reach a caller;
/// everything else propagates to the facade caller as-is.
#[derive(Debug, Error)]
pub enum HsiError {
    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error("operation requires consent for channel: {0}")]
    ConsentRequired(Channel),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("app not found")]
    AppNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("invalid payload: {0}")]
    PayloadInvalid(String),

    #[error("device storage failure: {0}")]
    DeviceStorageFailure(String),

    #[error("sensor unavailable for channel: {0}")]
    SensorUnavailable(Channel),

    #[error("interpretation head unavailable: {0}")]
    HeadUnavailable(&'static str),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HsiError {
    /// True for errors that are locally retried by their owning subsystem
    /// rather than being a hard failure the caller must handle. Permanent
    /// cloud-side rejections (bad credentials, unknown app, malformed
    /// request) are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, HsiError::NetworkTransient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_display() {
        assert_eq!(Channel::Biosignals.to_string(), "biosignals");
        assert_eq!(Channel::Motion.to_string(), "motion");
        assert_eq!(Channel::Behavior.to_string(), "behavior");
    }

    #[test]
    fn transient_classification() {
        assert!(HsiError::NetworkTransient("timeout".into()).is_transient());
        assert!(!HsiError::InvalidCredentials.is_transient());
        assert!(!HsiError::AppNotFound.is_transient());
        assert!(!HsiError::BadRequest("bad field".into()).is_transient());
        assert!(!HsiError::Fatal("nan in hsv".into()).is_transient());
    }
}
