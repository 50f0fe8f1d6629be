//! `ProfileCache`: fetches the app's catalog of [`ConsentProfile`]
//! definitions from the cloud and caches it for 24 hours, single-flighted
//! per `active_only` filter so concurrent lookups only trigger one HTTP
//! round-trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::HsiError;

use super::types::ConsentProfile;

const PROFILE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Deserialize)]
struct ProfilesResponse {
    profiles: Vec<ConsentProfile>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

struct CachedProfiles {
    profiles: Vec<ConsentProfile>,
    fetched_at: Instant,
}

impl CachedProfiles {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < PROFILE_TTL
    }
}

/// Cloud-backed, TTL-cached catalog of an app's [`ConsentProfile`]
/// definitions.
///
/// Profiles are immutable once fetched (a profile's permission set does
/// not change without a new `profile_id`), so a stale cache entry is never
/// silently served past its TTL — it is simply refetched. The
/// `active_only` filter is cached separately since it selects a different
/// result set from the same endpoint.
pub struct ProfileCache {
    base_url: String,
    app_id: String,
    client: reqwest::Client,
    entries: Mutex<HashMap<bool, CachedProfiles>>,
}

impl ProfileCache {
    pub fn new(base_url: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            app_id: app_id.into(),
            client: reqwest::Client::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns cached profiles if the cache for this `active_only` filter
    /// is under 24h old, otherwise fetches and caches.
    pub async fn get_available_profiles(&self, active_only: bool) -> Result<Vec<ConsentProfile>, HsiError> {
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(&active_only) {
                if cached.is_fresh(Instant::now()) {
                    return Ok(cached.profiles.clone());
                }
            }
        }

        let profiles = self.fetch(active_only).await?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            active_only,
            CachedProfiles {
                profiles: profiles.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(profiles)
    }

    async fn fetch(&self, active_only: bool) -> Result<Vec<ConsentProfile>, HsiError> {
        let resp = self
            .client
            .get(format!(
                "{}/api/v1/apps/{}/consent-profiles",
                self.base_url, self.app_id
            ))
            .query(&[("active_only", active_only)])
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
                .unwrap_or_else(|| format!("consent-profiles endpoint returned {status}"));
            return Err(HsiError::BadRequest(message));
        }
        if !status.is_success() {
            return Err(HsiError::NetworkTransient(format!(
                "consent-profiles endpoint returned {status}"
            )));
        }

        let body: ProfilesResponse = resp.json().await.map_err(|e| HsiError::PayloadInvalid(e.to_string()))?;
        Ok(body.profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_profile(id: &str, active: bool) -> ConsentProfile {
        ConsentProfile {
            profile_id: id.to_string(),
            name: "default".into(),
            active,
            vitals: true,
            sleep: true,
            motion: true,
            screen_state: false,
            behavior: true,
            interpretation: true,
        }
    }

    #[tokio::test]
    async fn fetches_and_caches_by_filter() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/apps/app1/consent-profiles"))
            .and(query_param("active_only", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "profiles": [sample_profile("p1", true)],
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = ProfileCache::new(mock_server.uri(), "app1");
        let first = cache.get_available_profiles(true).await.unwrap();
        let second = cache.get_available_profiles(true).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second[0].profile_id, "p1");
    }

    #[tokio::test]
    async fn unknown_app_is_not_found() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/apps/missing/consent-profiles"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let cache = ProfileCache::new(mock_server.uri(), "missing");
        let err = cache.get_available_profiles(false).await.unwrap_err();
        assert!(matches!(err, HsiError::AppNotFound));
    }
}
