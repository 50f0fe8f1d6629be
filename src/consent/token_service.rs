//! `ConsentTokenService`: fetches and refreshes the cloud-issued
//! [`ConsentToken`], running a background refresh worker that races a
//! fixed poll interval against an exponential backoff retry when the
//! cloud is unreachable, and against shutdown.
//!
//! The worker shape (interval tick vs. shutdown vs. bounded retry with
//! doubling backoff) mirrors the lease-expiry background worker pattern:
//! a `watch<bool>` shutdown flag raced with `tokio::select!` against both
//! the scan interval and the backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::HsiError;
use crate::storage::SecureStore;

use super::types::ConsentToken;

const TOKEN_STORAGE_KEY: &str = "consent_token";
const MAX_FETCH_RETRIES: u32 = 3;
const REFRESH_POLL_SECS: u64 = 60;

/// Cloud endpoint configuration for the Consent Token Service.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_api_key: String,
    pub device_id: String,
    pub platform: String,
    pub consent_profile_id: String,
    pub user_id: Option<String>,
    pub region: Option<String>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    device_id: &'a str,
    platform: &'a str,
    consent_profile_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
}

/// The consent-token endpoint replies with one of two shapes; which one a
/// deployment uses depends on its cloud's API generation, not on anything
/// the client controls.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenResponseBody {
    Issued {
        token: String,
        expires_at: i64,
        profile_id: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
    OAuthStyle {
        access_token: String,
        expires_in: i64,
        consent_profile_id: String,
        #[serde(default)]
        #[allow(dead_code)]
        token_type: String,
        #[serde(default)]
        scopes: Option<Vec<String>>,
    },
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Fetches, caches, and refreshes consent tokens from the cloud.
///
/// Holds the latest token behind a `watch` channel so subscribers (the
/// capability registry, the upload queue) always see the current token
/// without polling.
pub struct ConsentTokenService {
    config: CloudConfig,
    client: reqwest::Client,
    storage: Arc<dyn SecureStore>,
    tx: watch::Sender<Option<ConsentToken>>,
}

impl ConsentTokenService {
    pub async fn load(config: CloudConfig, storage: Arc<dyn SecureStore>) -> Result<Self, HsiError> {
        let cached = match storage.get(TOKEN_STORAGE_KEY).await? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        let (tx, _rx) = watch::channel(cached);
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            storage,
            tx,
        })
    }

    pub fn current(&self) -> Option<ConsentToken> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ConsentToken>> {
        self.tx.subscribe()
    }

    /// Decode a JWT's payload segment without verifying its signature.
    /// The token's authenticity is established by TLS + the cloud issuer;
    /// on-device code only ever reads claims, never re-signs or re-issues.
    fn decode_claims(jwt: &str) -> Result<serde_json::Map<String, serde_json::Value>, HsiError> {
        let payload_segment = jwt
            .split('.')
            .nth(1)
            .ok_or_else(|| HsiError::PayloadInvalid("malformed JWT: missing payload segment".into()))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload_segment)
            .map_err(|e| HsiError::PayloadInvalid(format!("JWT payload not base64url: {e}")))?;
        match serde_json::from_slice(&decoded)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(HsiError::PayloadInvalid("JWT payload is not an object".into())),
        }
    }

    /// Build a [`ConsentToken`] from a parsed response body. Scopes and
    /// expiry are taken from the body when the shape provides them
    /// directly; `OAuthStyle` responses that omit `scopes` fall back to
    /// decoding the access token's own JWT payload for them.
    fn token_from_response(body: TokenResponseBody, now_ms: i64) -> Result<ConsentToken, HsiError> {
        match body {
            TokenResponseBody::Issued {
                token,
                expires_at,
                profile_id,
                scopes,
            } => {
                let claims = Self::decode_claims(&token).unwrap_or_default();
                Ok(ConsentToken {
                    jwt: token,
                    expires_at,
                    profile_id,
                    scopes: scopes.into_iter().collect(),
                    claims,
                })
            }
            TokenResponseBody::OAuthStyle {
                access_token,
                expires_in,
                consent_profile_id,
                scopes,
                ..
            } => {
                let claims = Self::decode_claims(&access_token).unwrap_or_default();
                let scopes = match scopes {
                    Some(s) => s.into_iter().collect(),
                    None => claims
                        .get("scopes")
                        .and_then(|v| v.as_array())
                        .map(|arr| arr.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                        .unwrap_or_default(),
                };
                Ok(ConsentToken {
                    jwt: access_token,
                    expires_at: now_ms + expires_in * 1000,
                    profile_id: consent_profile_id,
                    scopes,
                    claims,
                })
            }
        }
    }

    /// One round-trip fetch against the cloud, no retry. Maps HTTP status
    /// to the error taxonomy the facade and `is_transient` rely on: `401`
    /// is never retried, `404` means the app itself is unknown, any other
    /// `4xx` carries the cloud's own message, and everything else
    /// (including a transport failure) is treated as transient.
    async fn fetch_once(&self, now_ms: i64) -> Result<ConsentToken, HsiError> {
        let resp = self
            .client
            .post(format!("{}/api/v1/sdk/consent-token", self.config.base_url))
            .bearer_auth(&self.config.app_api_key)
            .json(&TokenRequest {
                app_id: &self.config.app_id,
                device_id: &self.config.device_id,
                platform: &self.config.platform,
                consent_profile_id: &self.config.consent_profile_id,
                user_id: self.config.user_id.as_deref(),
                region: self.config.region.as_deref(),
            })
            .send()
            .await
            .map_err(|e| HsiError::NetworkTransient(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HsiError::InvalidCredentials);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HsiError::AppNotFound);
        }
        if status.is_client_error() {
            let message = resp
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message.or(b.error))
                .unwrap_or_else(|| format!("token endpoint returned {status}"));
            return Err(HsiError::BadRequest(message));
        }
        if !status.is_success() {
            return Err(HsiError::NetworkTransient(format!("token endpoint returned {status}")));
        }

        let body: TokenResponseBody = resp
            .json()
            .await
            .map_err(|e| HsiError::PayloadInvalid(e.to_string()))?;
        Self::token_from_response(body, now_ms)
    }

    /// Fetch with bounded retry (doubling backoff, capped), racing
    /// `shutdown`. Returns `Ok(None)` if shutdown fired mid-retry.
    async fn fetch_with_retry(
        &self,
        now_ms: i64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<ConsentToken>, HsiError> {
        let mut last_err = None;
        for attempt in 0..=MAX_FETCH_RETRIES {
            match self.fetch_once(now_ms).await {
                Ok(token) => return Ok(Some(token)),
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    if attempt == MAX_FETCH_RETRIES {
                        break;
                    }
                    let backoff = Duration::from_secs(1u64 << attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "token fetch failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("loop always records an error before exhausting retries"))
    }

    /// Fetch a fresh token and persist + publish it.
    pub async fn refresh(
        &self,
        now_ms: i64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<ConsentToken>, HsiError> {
        let token = match self.fetch_with_retry(now_ms, shutdown).await? {
            Some(t) => t,
            None => return Ok(None),
        };
        let bytes = serde_json::to_vec(&token)?;
        self.storage.put(TOKEN_STORAGE_KEY, &bytes).await?;
        self.tx.send_replace(Some(token.clone()));
        Ok(Some(token))
    }

    /// Background worker: polls every [`REFRESH_POLL_SECS`] and refreshes
    /// when the cached token is missing or within its refresh window.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(REFRESH_POLL_SECS));
        info!("consent token refresh worker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = crate::now_ms();
                    let needs_refresh = match self.current() {
                        Some(t) => t.within_refresh_window(now_ms),
                        None => true,
                    };
                    if !needs_refresh {
                        continue;
                    }
                    match self.refresh(now_ms, &mut shutdown).await {
                        Ok(Some(_)) => debug!("consent token refreshed"),
                        Ok(None) => { info!("consent token worker shutting down mid-retry"); return; }
                        Err(e) => warn!(error = %e, "consent token refresh failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("consent token refresh worker shutting down");
                    return;
                }
            }
        }
    }
}
