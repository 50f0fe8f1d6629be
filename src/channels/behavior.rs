//! Behavior channel: interaction events, with explicit and idle-threshold
//! session tracking.
//!
//! Sessions close two ways: explicitly via [`BehaviorChannel::end_session`],
//! or implicitly when no event arrives for `idle_threshold_ms` (default
//! 2s). `end_session` carries the spec's 15s hard cap — a session that
//! doesn't acknowledge within that window is marked incomplete, but the
//! events already buffered for it are preserved either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapters::BehaviorSourceAdapter;
use crate::consent::ConsentStore;
use crate::error::{Channel as ChannelKind, HsiError};
use crate::types::{BehaviorEvent, BehaviorEventKind, BehaviorWindowFeatures, WindowType};

use super::ring_buffer::{RingBuffer, Timestamped};
use super::MAX_RETENTION_MS;

impl Timestamped for BehaviorEvent {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp
    }
}

const RAW_BROADCAST_CAPACITY: usize = 256;
const DEFAULT_IDLE_THRESHOLD_MS: i64 = 2_000;
const SESSION_END_HARD_CAP: Duration = Duration::from_secs(15);

/// Emitted when a behavior session closes, explicitly or by idle timeout.
#[derive(Debug, Clone)]
pub struct BehaviorSessionSummary {
    pub session_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub event_count: usize,
    /// False if the session was closed by the 15s hard cap before an
    /// explicit `end` acknowledgement arrived.
    pub completed: bool,
}

struct OpenSession {
    session_id: String,
    start_ts: i64,
    last_event_ts: i64,
    event_count: usize,
}

pub struct BehaviorChannel {
    consent: ConsentStore,
    adapter: Arc<dyn BehaviorSourceAdapter>,
    buffer: Arc<Mutex<RingBuffer<BehaviorEvent>>>,
    raw_tx: broadcast::Sender<BehaviorEvent>,
    session_tx: broadcast::Sender<BehaviorSessionSummary>,
    open_session: Arc<Mutex<Option<OpenSession>>>,
    /// Summaries of sessions already closed, keyed by session id, so a
    /// repeat `end()` call for the same id is idempotent rather than
    /// synthesizing a fresh (zeroed) summary.
    closed_sessions: Arc<Mutex<HashMap<String, BehaviorSessionSummary>>>,
    idle_threshold_ms: i64,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BehaviorChannel {
    pub fn new(consent: ConsentStore, adapter: Arc<dyn BehaviorSourceAdapter>) -> Self {
        let (raw_tx, _rx) = broadcast::channel(RAW_BROADCAST_CAPACITY);
        let (session_tx, _rx2) = broadcast::channel(64);
        let (shutdown_tx, _rx3) = watch::channel(false);
        Self {
            consent,
            adapter,
            buffer: Arc::new(Mutex::new(RingBuffer::new(MAX_RETENTION_MS))),
            raw_tx,
            session_tx,
            open_session: Arc::new(Mutex::new(None)),
            closed_sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), HsiError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        self.adapter.start(tx).await?;

        let buffer = self.buffer.clone();
        let raw_tx = self.raw_tx.clone();
        let session_tx = self.session_tx.clone();
        let open_session = self.open_session.clone();
        let closed_sessions = self.closed_sessions.clone();
        let consent = self.consent.clone();
        let idle_threshold_ms = self.idle_threshold_ms;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut consent_rx = self.consent.subscribe();
        let mut idle_check = tokio::time::interval(Duration::from_millis(500));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if !consent.current().channel_granted(ChannelKind::Behavior) {
                            continue;
                        }
                        buffer.lock().await.insert(event.clone());
                        let mut session = open_session.lock().await;
                        match session.as_mut() {
                            Some(s) if s.session_id == event.session_id => {
                                s.last_event_ts = event.timestamp;
                                s.event_count += 1;
                            }
                            _ => {
                                *session = Some(OpenSession {
                                    session_id: event.session_id.clone(),
                                    start_ts: event.timestamp,
                                    last_event_ts: event.timestamp,
                                    event_count: 1,
                                });
                            }
                        }
                        let _ = raw_tx.send(event);
                    }
                    _ = idle_check.tick() => {
                        let now_ms = crate::now_ms();
                        let mut session = open_session.lock().await;
                        if let Some(s) = session.as_ref() {
                            if now_ms - s.last_event_ts >= idle_threshold_ms {
                                let summary = BehaviorSessionSummary {
                                    session_id: s.session_id.clone(),
                                    start_ts: s.start_ts,
                                    end_ts: s.last_event_ts,
                                    event_count: s.event_count,
                                    completed: true,
                                };
                                closed_sessions.lock().await.insert(summary.session_id.clone(), summary.clone());
                                let _ = session_tx.send(summary);
                                *session = None;
                            }
                        }
                    }
                    changed = consent_rx.changed() => {
                        if changed.is_err() { break; }
                        if !consent_rx.borrow().channel_granted(ChannelKind::Behavior) {
                            debug!("behavior consent revoked, clearing buffer");
                            buffer.lock().await.clear();
                            *open_session.lock().await = None;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.adapter.stop().await;
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "behavior channel task join failed");
            }
        }
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<BehaviorEvent> {
        self.raw_tx.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<BehaviorSessionSummary> {
        self.session_tx.subscribe()
    }

    /// Explicitly opens a session, superseding any session already open
    /// under a different id.
    pub async fn start_session(&self, session_id: impl Into<String>) {
        let now_ms = crate::now_ms();
        *self.open_session.lock().await = Some(OpenSession {
            session_id: session_id.into(),
            start_ts: now_ms,
            last_event_ts: now_ms,
            event_count: 0,
        });
    }

    /// Closes `session_id` explicitly. Waits up to 15s for any in-flight
    /// events to settle; on timeout the summary is marked incomplete but
    /// events already recorded are kept.
    ///
    /// Idempotent: a session id already closed (by a prior `end()` or by
    /// idle timeout) returns the same cached summary instead of
    /// synthesizing a new one.
    pub async fn end(&self, session_id: &str) -> BehaviorSessionSummary {
        if let Some(cached) = self.closed_sessions.lock().await.get(session_id) {
            return cached.clone();
        }

        let wait = async {
            loop {
                {
                    let session = self.open_session.lock().await;
                    match session.as_ref() {
                        Some(s) if s.session_id == session_id => {}
                        _ => break,
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        let completed = tokio::time::timeout(SESSION_END_HARD_CAP, wait).await.is_ok();
        let mut session = self.open_session.lock().await;
        let summary = match session.take() {
            Some(s) if s.session_id == session_id => BehaviorSessionSummary {
                session_id: s.session_id,
                start_ts: s.start_ts,
                end_ts: s.last_event_ts,
                event_count: s.event_count,
                completed,
            },
            other => {
                *session = other;
                BehaviorSessionSummary {
                    session_id: session_id.to_string(),
                    start_ts: crate::now_ms(),
                    end_ts: crate::now_ms(),
                    event_count: 0,
                    completed,
                }
            }
        };
        self.closed_sessions.lock().await.insert(session_id.to_string(), summary.clone());
        let _ = self.session_tx.send(summary.clone());
        summary
    }

    pub async fn clear_cache(&self) {
        self.buffer.lock().await.clear();
    }

    pub async fn features(&self, now_ms: i64, window: WindowType) -> Option<BehaviorWindowFeatures> {
        let buffer = self.buffer.lock().await;
        let samples = buffer.window(now_ms, window.as_millis());
        if samples.is_empty() {
            return None;
        }

        let mut counts: HashMap<BehaviorEventKind, usize> = HashMap::new();
        let mut scroll_velocity_sum = 0.0;
        let mut scroll_n = 0usize;
        let mut gaps_ms: Vec<i64> = Vec::new();
        let mut typing_ts: Vec<i64> = Vec::new();
        let mut prev_ts: Option<i64> = None;

        for event in samples {
            *counts.entry(event.kind).or_insert(0) += 1;
            if let Some(prev) = prev_ts {
                gaps_ms.push(event.timestamp - prev);
            }
            prev_ts = Some(event.timestamp);
            if event.kind == BehaviorEventKind::Scroll {
                if let Some(v) = event.metrics.get("velocity") {
                    scroll_velocity_sum += v;
                    scroll_n += 1;
                }
            }
            if event.kind == BehaviorEventKind::Typing {
                typing_ts.push(event.timestamp);
            }
        }

        let window_minutes = (window.as_millis() as f64 / 60_000.0).max(1.0 / 60.0);
        let per_minute = |kind: BehaviorEventKind| {
            *counts.get(&kind).unwrap_or(&0) as f64 / window_minutes
        };

        let tap_rate = per_minute(BehaviorEventKind::Tap);
        let tap_rate_norm = (tap_rate / 60.0).min(1.0);
        let keystroke_rate = per_minute(BehaviorEventKind::Typing);
        let app_switch_rate = per_minute(BehaviorEventKind::AppSwitch);

        let scroll_velocity = if scroll_n == 0 {
            0.0
        } else {
            scroll_velocity_sum / scroll_n as f64
        };

        // Burstiness (Barabási coefficient on inter-typing-event gaps):
        // (sigma - mu) / (sigma + mu), bounded to [-1, 1], 0 if too few
        // gaps to estimate.
        let typing_burstiness = burstiness(&typing_ts);

        let idle_gaps = if gaps_ms.is_empty() {
            0.0
        } else {
            let idle_time: i64 = gaps_ms
                .iter()
                .filter(|&&g| g >= self.idle_threshold_ms)
                .sum();
            (idle_time as f64 / window.as_millis() as f64).min(1.0)
        };

        // Heuristic composite: low idle time and a steady (non-zero,
        // non-chaotic) typing cadence indicate focused engagement.
        let focus_hint = ((1.0 - idle_gaps) * (1.0 - typing_burstiness.abs())).clamp(0.0, 1.0);

        Some(BehaviorWindowFeatures {
            tap_rate_norm,
            keystroke_rate,
            typing_burstiness,
            scroll_velocity,
            app_switch_rate,
            idle_gaps,
            focus_hint,
        })
    }
}

fn burstiness(timestamps: &[i64]) -> f64 {
    if timestamps.len() < 3 {
        return 0.0;
    }
    let gaps: Vec<f64> = timestamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    let stddev = variance.sqrt();
    ((stddev - mean) / (stddev + mean)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBehaviorAdapter;
    use crate::storage::InMemoryStore;
    use std::sync::Arc as StdArc;

    async fn consented_store() -> ConsentStore {
        let store = ConsentStore::load(StdArc::new(InMemoryStore::new()), 0).await.unwrap();
        let mut snap = store.current();
        snap.behavior = true;
        store.update(snap).await.unwrap();
        store
    }

    fn event(session_id: &str, ts: i64, kind: BehaviorEventKind) -> BehaviorEvent {
        BehaviorEvent {
            session_id: session_id.into(),
            timestamp: ts,
            kind,
            metrics: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn app_switch_rate_is_monotonic_in_transition_count() {
        let consent = consented_store().await;
        let adapter = InMemoryBehaviorAdapter::new();
        let channel = BehaviorChannel::new(consent, adapter.clone());
        channel.start().await.unwrap();

        for ts in [0, 10_000] {
            adapter.push(event("s1", ts, BehaviorEventKind::AppSwitch)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let low = channel
            .features(10_000, WindowType::Minutes5)
            .await
            .unwrap()
            .app_switch_rate;

        for ts in [20_000, 30_000, 40_000, 50_000] {
            adapter.push(event("s1", ts, BehaviorEventKind::AppSwitch)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let high = channel
            .features(50_000, WindowType::Minutes5)
            .await
            .unwrap()
            .app_switch_rate;

        assert!(high > low);
        channel.stop().await;
    }

    #[tokio::test]
    async fn idle_timeout_closes_session() {
        let consent = consented_store().await;
        let adapter = InMemoryBehaviorAdapter::new();
        let channel = BehaviorChannel::new(consent, adapter.clone());
        let mut sessions = channel.subscribe_sessions();
        channel.start().await.unwrap();

        adapter.push(event("s1", crate::now_ms(), BehaviorEventKind::Typing)).await;
        let summary = tokio::time::timeout(Duration::from_secs(4), sessions.recv())
            .await
            .expect("session should close via idle timeout")
            .unwrap();
        assert_eq!(summary.session_id, "s1");
        assert!(summary.completed);
        channel.stop().await;
    }

    #[tokio::test]
    async fn explicit_end_returns_summary() {
        let consent = consented_store().await;
        let adapter = InMemoryBehaviorAdapter::new();
        let channel = BehaviorChannel::new(consent, adapter.clone());
        channel.start().await.unwrap();
        channel.start_session("explicit").await;
        adapter.push(event("explicit", crate::now_ms(), BehaviorEventKind::Tap)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let summary = channel.end("explicit").await;
        assert_eq!(summary.session_id, "explicit");
        assert!(summary.completed);
        channel.stop().await;
    }

    #[tokio::test]
    async fn end_is_idempotent_on_repeat_call() {
        let consent = consented_store().await;
        let adapter = InMemoryBehaviorAdapter::new();
        let channel = BehaviorChannel::new(consent, adapter.clone());
        channel.start().await.unwrap();
        channel.start_session("explicit").await;
        adapter.push(event("explicit", crate::now_ms(), BehaviorEventKind::Tap)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let first = channel.end("explicit").await;
        let second = channel.end("explicit").await;
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.start_ts, second.start_ts);
        assert_eq!(first.end_ts, second.end_ts);
        assert_eq!(first.event_count, second.event_count);
        channel.stop().await;
    }
}
