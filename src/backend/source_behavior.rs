//! Per-source AIMD request-rate model.
//!
//! Successes raise the allowed rate by a fixed step; failures cut it by a factor
//! that depends on how hostile the failure looks, and the harsher ones impose a
//! cooldown during which the source must not be contacted.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::storage::{now_ms, source_behavior_key, PersistQueue, Storage};

pub const DEFAULT_INITIAL_RATE: f64 = 2.0;
pub const DEFAULT_MAX_RATE: f64 = 10.0;
pub const MIN_RATE: f64 = 0.1;
const RATE_STEP: f64 = 0.1;
const RESPONSE_TIME_ALPHA: f64 = 0.3;
const MAX_BACKOFF_MULTIPLIER: u32 = 64;
const RATE_LIMIT_COOLDOWN_MS: u64 = 5_000;
const BLOCKED_COOLDOWN_MS: u64 = 30_000;
const CLIENT_ERROR_COOLDOWN_MS: u64 = 2_000;
const SERVER_ERROR_COOLDOWN_MS: u64 = 5_000;
const MIN_REQUEST_DELAY_MS: u64 = 50;
const DELAY_JITTER: f64 = 0.2;

/// Rate bounds a source declares in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateHints {
    pub initial_rate: f64,
    pub max_rate: f64,
}

impl Default for RateHints {
    fn default() -> Self {
        Self {
            initial_rate: DEFAULT_INITIAL_RATE,
            max_rate: DEFAULT_MAX_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 429
    RateLimited,
    /// 403
    Blocked,
    /// Any other 4xx
    ClientError,
    /// 502 / 503
    ServerUnavailable,
    /// No status, or a status outside the cases above
    Network,
}

impl FailureKind {
    pub fn from_status(status: i32) -> Self {
        match status {
            429 => FailureKind::RateLimited,
            403 => FailureKind::Blocked,
            400..=499 => FailureKind::ClientError,
            502 | 503 => FailureKind::ServerUnavailable,
            _ => FailureKind::Network,
        }
    }

    fn rate_multiplier(self) -> f64 {
        match self {
            FailureKind::RateLimited => 0.5,
            FailureKind::Blocked => 0.3,
            FailureKind::ClientError | FailureKind::ServerUnavailable => 0.7,
            FailureKind::Network => 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBehavior {
    pub source_id: String,
    pub current_rate: f64,
    pub max_observed_rate: f64,
    pub initial_rate: f64,
    pub max_rate: f64,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_rate_limit_at: Option<u64>,
    pub avg_response_time_ms: f64,
    pub backoff_until: Option<u64>,
    pub backoff_multiplier: u32,
}

impl SourceBehavior {
    pub fn new(source_id: &str, hints: RateHints) -> Self {
        let max_rate = hints.max_rate.max(MIN_RATE);
        let initial_rate = hints.initial_rate.clamp(MIN_RATE, max_rate);
        Self {
            source_id: source_id.to_string(),
            current_rate: initial_rate,
            max_observed_rate: initial_rate,
            initial_rate,
            max_rate,
            consecutive_failures: 0,
            total_requests: 0,
            failed_requests: 0,
            last_rate_limit_at: None,
            avg_response_time_ms: 0.0,
            backoff_until: None,
            backoff_multiplier: 1,
        }
    }

    pub fn apply_success(&mut self, response_time_ms: f64) {
        self.current_rate = (self.current_rate + RATE_STEP).min(self.max_rate);
        self.max_observed_rate = self.max_observed_rate.max(self.current_rate);
        self.consecutive_failures = 0;
        self.backoff_multiplier = 1;
        self.backoff_until = None;
        self.avg_response_time_ms = if self.total_requests == 0 {
            response_time_ms
        } else {
            RESPONSE_TIME_ALPHA * response_time_ms
                + (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time_ms
        };
        self.total_requests += 1;
    }

    pub fn apply_failure(&mut self, status: i32, now_ms: u64) {
        let kind = FailureKind::from_status(status);
        self.current_rate = (self.current_rate * kind.rate_multiplier()).max(MIN_RATE);

        let cooldown_ms = match kind {
            FailureKind::RateLimited => {
                self.backoff_multiplier =
                    (self.backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
                self.last_rate_limit_at = Some(now_ms);
                Some(RATE_LIMIT_COOLDOWN_MS * u64::from(self.backoff_multiplier))
            }
            FailureKind::Blocked => Some(BLOCKED_COOLDOWN_MS),
            FailureKind::ClientError => Some(CLIENT_ERROR_COOLDOWN_MS),
            FailureKind::ServerUnavailable => Some(SERVER_ERROR_COOLDOWN_MS),
            FailureKind::Network => None,
        };
        if let Some(cooldown_ms) = cooldown_ms {
            self.backoff_until = Some(now_ms + cooldown_ms);
        }

        self.consecutive_failures += 1;
        self.failed_requests += 1;
        self.total_requests += 1;
    }

    pub fn is_throttled_at(&self, now_ms: u64) -> bool {
        matches!(self.backoff_until, Some(until) if until > now_ms)
    }

    pub fn remaining_backoff_ms(&self, now_ms: u64) -> Option<u64> {
        self.backoff_until
            .filter(|until| *until > now_ms)
            .map(|until| until - now_ms)
    }

    /// Inter-request spacing at the current rate, before jitter.
    pub fn base_delay_ms(&self) -> f64 {
        1000.0 / self.current_rate
    }
}

/// Registry of [`SourceBehavior`] rows, one per source id.
///
/// Clones share state. Mutations go through the write lock, so concurrent
/// download tasks reporting for the same source are serialized.
#[derive(Clone)]
pub struct SourceBehaviorTracker {
    inner: Arc<RwLock<HashMap<String, SourceBehavior>>>,
    persist: Option<PersistQueue>,
}

impl SourceBehaviorTracker {
    pub fn new(persist: Option<PersistQueue>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            persist,
        }
    }

    /// Restore every persisted row. Failures leave the tracker empty.
    pub async fn load(storage: &dyn Storage, persist: Option<PersistQueue>) -> Self {
        let tracker = Self::new(persist);
        match storage.scan_prefix("source_behavior:").await {
            Ok(rows) => {
                let mut inner = tracker.inner.write().await;
                for (key, value) in rows {
                    match serde_json::from_value::<SourceBehavior>(value) {
                        Ok(behavior) => {
                            inner.insert(behavior.source_id.clone(), behavior);
                        }
                        Err(e) => log::warn!("Skipping malformed {}: {}", key, e),
                    }
                }
                log::debug!("Loaded {} source behavior rows", inner.len());
            }
            Err(e) => log::warn!("Failed to load source behavior, starting empty: {}", e),
        }
        tracker
    }

    pub async fn get_or_create(&self, source_id: &str, hints: Option<RateHints>) -> SourceBehavior {
        if let Some(existing) = self.inner.read().await.get(source_id) {
            return existing.clone();
        }

        let mut inner = self.inner.write().await;
        let behavior = inner
            .entry(source_id.to_string())
            .or_insert_with(|| SourceBehavior::new(source_id, hints.unwrap_or_default()))
            .clone();
        self.schedule_persist(&behavior);
        behavior
    }

    pub async fn record_success(&self, source_id: &str, response_time_ms: f64) {
        let mut inner = self.inner.write().await;
        let behavior = inner
            .entry(source_id.to_string())
            .or_insert_with(|| SourceBehavior::new(source_id, RateHints::default()));
        behavior.apply_success(response_time_ms);
        self.schedule_persist(behavior);
    }

    pub async fn record_failure(&self, source_id: &str, status: i32) {
        self.record_failure_at(source_id, status, now_ms()).await;
    }

    pub async fn record_failure_at(&self, source_id: &str, status: i32, now_ms: u64) {
        let mut inner = self.inner.write().await;
        let behavior = inner
            .entry(source_id.to_string())
            .or_insert_with(|| SourceBehavior::new(source_id, RateHints::default()));
        behavior.apply_failure(status, now_ms);
        log::debug!(
            "{}: failure status={} rate={:.2} backoff_until={:?}",
            source_id,
            status,
            behavior.current_rate,
            behavior.backoff_until
        );
        self.schedule_persist(behavior);
    }

    pub async fn should_throttle(&self, source_id: &str) -> bool {
        self.should_throttle_at(source_id, now_ms()).await
    }

    pub async fn should_throttle_at(&self, source_id: &str, now_ms: u64) -> bool {
        self.inner
            .read()
            .await
            .get(source_id)
            .is_some_and(|b| b.is_throttled_at(now_ms))
    }

    pub async fn get_request_delay(&self, source_id: &str) -> Duration {
        self.get_request_delay_at(source_id, now_ms()).await
    }

    /// Remaining cooldown while throttled, otherwise `1000 / rate` with ±20%
    /// jitter, never below 50ms.
    pub async fn get_request_delay_at(&self, source_id: &str, now_ms: u64) -> Duration {
        let behavior = self.get_or_create(source_id, None).await;
        if let Some(remaining) = behavior.remaining_backoff_ms(now_ms) {
            return Duration::from_millis(remaining);
        }

        let jitter = rand::rng().random_range(-DELAY_JITTER..=DELAY_JITTER);
        let delay = behavior.base_delay_ms() * (1.0 + jitter);
        Duration::from_millis((delay.round() as u64).max(MIN_REQUEST_DELAY_MS))
    }

    pub async fn snapshot(&self, source_id: &str) -> Option<SourceBehavior> {
        self.inner.read().await.get(source_id).cloned()
    }

    /// Forget everything learned about a source and start over from its bounds.
    pub async fn reset(&self, source_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(behavior) = inner.get_mut(source_id) {
            let hints = RateHints {
                initial_rate: behavior.initial_rate,
                max_rate: behavior.max_rate,
            };
            *behavior = SourceBehavior::new(source_id, hints);
            self.schedule_persist(behavior);
        }
    }

    fn schedule_persist(&self, behavior: &SourceBehavior) {
        if let Some(persist) = &self.persist {
            persist.put_serialized(source_behavior_key(&behavior.source_id), behavior);
        }
    }
}

impl Default for SourceBehaviorTracker {
    fn default() -> Self {
        Self::new(None)
    }
}
