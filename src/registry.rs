//! Capability Registry: derives what the device is currently permitted to
//! run from the latest decoded consent token, so the facade never has to
//! inspect token claims directly before enabling a head or the upload
//! queue.

use std::collections::HashMap;

use tokio::sync::watch;

use crate::consent::ConsentToken;

/// How much of a feature is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityLevel {
    Disabled,
    Enabled,
    EnabledWithLevel(u8),
}

impl CapabilityLevel {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CapabilityLevel::Disabled)
    }
}

/// Well-known feature names consulted by the facade and interpretation
/// heads. Plain `&'static str` keys, matching the token's own scope
/// strings, rather than a closed enum — new scopes can appear server-side
/// without a client release.
pub mod features {
    pub const EMOTION: &str = "emotion";
    pub const FOCUS: &str = "focus";
    pub const CLOUD_UPLOAD: &str = "cloud_upload";
}

/// Snapshot of feature capabilities, rebuilt from token claims whenever
/// the token changes.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    levels: HashMap<String, CapabilityLevel>,
}

impl CapabilitySet {
    pub fn level(&self, feature: &str) -> CapabilityLevel {
        self.levels
            .get(feature)
            .copied()
            .unwrap_or(CapabilityLevel::Disabled)
    }

    pub fn is_enabled(&self, feature: &str) -> bool {
        self.level(feature).is_enabled()
    }

    /// Build a capability set from a token's scopes and claims.
    ///
    /// A scope string present in `scopes` enables the feature at
    /// `CapabilityLevel::Enabled`; an integer claim named `"<feature>_level"`
    /// upgrades it to `EnabledWithLevel`.
    fn from_token(token: &ConsentToken) -> Self {
        let mut levels = HashMap::new();
        for scope in &token.scopes {
            let level = token
                .claims
                .get(&format!("{scope}_level"))
                .and_then(|v| v.as_u64())
                .map(|n| CapabilityLevel::EnabledWithLevel(n as u8))
                .unwrap_or(CapabilityLevel::Enabled);
            levels.insert(scope.clone(), level);
        }
        Self { levels }
    }
}

/// Watches a [`crate::consent::ConsentTokenService`] subscription and
/// republishes the derived [`CapabilitySet`] whenever the token changes.
pub struct CapabilityRegistry {
    tx: watch::Sender<CapabilitySet>,
}

impl CapabilityRegistry {
    pub fn new(initial_token: Option<&ConsentToken>) -> Self {
        let initial = initial_token.map(CapabilitySet::from_token).unwrap_or_default();
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> CapabilitySet {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CapabilitySet> {
        self.tx.subscribe()
    }

    /// Recompute and publish from an updated token (or `None` if the
    /// token was cleared, e.g. on logout).
    pub fn on_token_update(&self, token: Option<&ConsentToken>) {
        let set = token.map(CapabilitySet::from_token).unwrap_or_default();
        self.tx.send_replace(set);
    }

    /// Drive `on_token_update` from a token service's watch stream until
    /// the channel closes.
    pub async fn run(&self, mut token_rx: watch::Receiver<Option<ConsentToken>>) {
        loop {
            if token_rx.changed().await.is_err() {
                return;
            }
            let token = token_rx.borrow().clone();
            self.on_token_update(token.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn token_with_scopes(scopes: &[&str]) -> ConsentToken {
        ConsentToken {
            jwt: "x".into(),
            expires_at: i64::MAX,
            profile_id: "p1".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            claims: serde_json::Map::new(),
        }
    }

    #[test]
    fn unscoped_feature_is_disabled() {
        let registry = CapabilityRegistry::new(None);
        assert!(!registry.current().is_enabled(features::EMOTION));
    }

    #[test]
    fn scope_enables_feature() {
        let registry = CapabilityRegistry::new(Some(&token_with_scopes(&[features::EMOTION])));
        assert!(registry.current().is_enabled(features::EMOTION));
        assert!(!registry.current().is_enabled(features::FOCUS));
    }

    #[test]
    fn level_claim_upgrades_capability() {
        let mut token = token_with_scopes(&[features::FOCUS]);
        token
            .claims
            .insert("focus_level".into(), serde_json::json!(3));
        let registry = CapabilityRegistry::new(Some(&token));
        assert_eq!(
            registry.current().level(features::FOCUS),
            CapabilityLevel::EnabledWithLevel(3)
        );
    }

    #[test]
    fn on_token_update_republishes() {
        let registry = CapabilityRegistry::new(None);
        let mut rx = registry.subscribe();
        registry.on_token_update(Some(&token_with_scopes(&[features::CLOUD_UPLOAD])));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(rx.borrow().is_enabled(features::CLOUD_UPLOAD));
    }
}
