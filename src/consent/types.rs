//! Consent data model: `ConsentSnapshot`, `ConsentToken`, `ConsentProfile`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Channel, HsiError};

/// Locally-held boolean bundle describing what may be collected and
/// exported. Defaults to all-denied; `explicitly_denied` distinguishes
/// "user declined" from "never asked".
///
/// Invariant: `cloud_upload => (biosignals || behavior || motion)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsentSnapshot {
    pub biosignals: bool,
    pub behavior: bool,
    pub motion: bool,
    pub cloud_upload: bool,
    #[serde(default)]
    pub explicitly_denied: bool,
    /// Epoch milliseconds (UTC) this snapshot was created.
    pub timestamp: i64,
}

impl ConsentSnapshot {
    /// The all-denied snapshot created at first init.
    pub fn denied_all(now_ms: i64) -> Self {
        Self {
            biosignals: false,
            behavior: false,
            motion: false,
            cloud_upload: false,
            explicitly_denied: false,
            timestamp: now_ms,
        }
    }

    /// Validate the snapshot invariant; used by `ConsentStore::update`
    /// before persisting.
    pub fn validate(&self) -> Result<(), HsiError> {
        if self.cloud_upload && !(self.biosignals || self.behavior || self.motion) {
            return Err(HsiError::InvalidConfig(
                "cloud_upload requires at least one data channel granted".into(),
            ));
        }
        Ok(())
    }

    /// Whether the named channel is currently granted.
    pub fn channel_granted(&self, channel: Channel) -> bool {
        match channel {
            Channel::Biosignals => self.biosignals,
            Channel::Motion => self.motion,
            Channel::Behavior => self.behavior,
        }
    }
}

/// Remote-issued token scoping what may be collected and exported.
/// Kept in secure storage and refreshed when within the expiry window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentToken {
    pub jwt: String,
    /// Epoch milliseconds (UTC).
    pub expires_at: i64,
    pub profile_id: String,
    pub scopes: HashSet<String>,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl ConsentToken {
    /// `is_valid <=> now < expires_at`.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }

    /// Whether `now` falls within the 5-minute refresh window before expiry.
    pub fn within_refresh_window(&self, now_ms: i64) -> bool {
        self.expires_at - now_ms <= 5 * 60_000
    }
}

/// Catalog entry describing which channels are permitted for a given token
/// issuance. Immutable once fetched; cached with a 24-hour TTL by
/// [`crate::consent::profile::ProfileCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentProfile {
    pub profile_id: String,
    pub name: String,
    pub active: bool,
    pub vitals: bool,
    pub sleep: bool,
    pub motion: bool,
    pub screen_state: bool,
    pub behavior: bool,
    pub interpretation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_all_is_all_false() {
        let s = ConsentSnapshot::denied_all(0);
        assert!(!s.biosignals && !s.behavior && !s.motion && !s.cloud_upload);
        assert!(!s.explicitly_denied);
    }

    #[test]
    fn cloud_upload_requires_a_channel() {
        let mut s = ConsentSnapshot::denied_all(0);
        s.cloud_upload = true;
        assert!(s.validate().is_err());
        s.biosignals = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn channel_granted_reads_the_right_field() {
        let mut s = ConsentSnapshot::denied_all(0);
        s.motion = true;
        assert!(s.channel_granted(Channel::Motion));
        assert!(!s.channel_granted(Channel::Biosignals));
    }

    #[test]
    fn token_validity_and_refresh_window() {
        let token = ConsentToken {
            jwt: "x".into(),
            expires_at: 10 * 60_000,
            profile_id: "p1".into(),
            scopes: HashSet::new(),
            claims: serde_json::Map::new(),
        };
        assert!(token.is_valid(0));
        assert!(!token.is_valid(10 * 60_000));
        assert!(!token.within_refresh_window(0));
        assert!(token.within_refresh_window(6 * 60_000));
    }
}
