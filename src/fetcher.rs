//! Upstream fetcher (spec.md §4.4, component D): single-tile fetch
//! combining `recent` and `recent/notable`, rate-limit-aware with
//! adaptive backoff.
//!
//! `fetch_upstream`'s shape (build URL, issue request, read body) is
//! grounded on `sx9-cdn-geospatial::GeospatialCdnNode::fetch_upstream`;
//! the rate-limit counters follow the workspace's `Arc<Mutex<..>>`
//! shared-counter convention rather than any single teacher file (no
//! sibling crate implements adaptive backoff).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::merge::merge_and_clip;
use crate::models::{Observation, RawObservation, TileId};
use crate::tile::{TileBounds, TileGrid};

const SLOW_THRESHOLD: StdDuration = StdDuration::from_secs(5);
const SLOW_STREAK_FOR_BACKOFF: u32 = 3;
const MAX_MIN_GAP_MS: u64 = 10_000;
const HEADER_LOW_WATERMARK_MIN_GAP_MS: u64 = 500;
const RATE_LIMITED_MIN_GAP_MS: u64 = 1_000;

/// Abstraction over the two upstream endpoints so the orchestrator and
/// fetcher can be exercised against a fake in tests (spec.md §4.L).
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_recent(
        &self,
        lat: f64,
        lng: f64,
        dist_km: f64,
        back_days: u32,
    ) -> Result<RawResponse, EngineError>;

    async fn fetch_notable(
        &self,
        lat: f64,
        lng: f64,
        dist_km: f64,
        back_days: u32,
    ) -> Result<RawResponse, EngineError>;
}

/// One upstream HTTP round trip's useful output: the body and whatever
/// rate-limit headers were advertised.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub observations: Vec<RawObservation>,
    pub rate_limit_remaining: Option<u64>,
    pub rate_limit_total: Option<u64>,
}

/// `reqwest`-backed client hitting the two real upstream endpoints.
/// Shape follows `GeospatialCdnNode::fetch_upstream`: build the URL,
/// send, read mime/headers, decode body.
pub struct ReqwestUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ReqwestUpstreamClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    async fn fetch(&self, path: &str, lat: f64, lng: f64, dist_km: f64, back_days: u32) -> Result<RawResponse, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lng", lng.to_string()),
                ("dist", dist_km.to_string()),
                ("back", back_days.to_string()),
            ])
            .header("X-eBirdApiToken", &self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable {
                tile_id: path.to_string(),
                reason: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::UpstreamRateLimited {
                tile_id: path.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(EngineError::UpstreamUnavailable {
                tile_id: path.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let rate_limit_remaining = header_u64(&response, "x-ratelimit-remaining");
        let rate_limit_total = header_u64(&response, "x-ratelimit-limit");

        let body = response.bytes().await.map_err(|e| EngineError::UpstreamUnavailable {
            tile_id: path.to_string(),
            reason: e.to_string(),
        })?;

        let observations: Vec<RawObservation> =
            serde_json::from_slice(&body).map_err(|e| EngineError::UpstreamMalformed {
                tile_id: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(RawResponse {
            observations,
            rate_limit_remaining,
            rate_limit_total,
        })
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn fetch_recent(&self, lat: f64, lng: f64, dist_km: f64, back_days: u32) -> Result<RawResponse, EngineError> {
        self.fetch("/recent", lat, lng, dist_km, back_days).await
    }

    async fn fetch_notable(&self, lat: f64, lng: f64, dist_km: f64, back_days: u32) -> Result<RawResponse, EngineError> {
        self.fetch("/recent/notable", lat, lng, dist_km, back_days).await
    }
}

/// Mutable rate-limit state guarded by a single mutex (contention is
/// acceptable: fetches are bounded by `max_parallel_requests`).
struct RateLimitState {
    last_start: Option<Instant>,
    consecutive_slow: u32,
}

pub struct RateLimiter {
    state: Mutex<RateLimitState>,
    min_gap_ms: AtomicU32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                last_start: None,
                consecutive_slow: 0,
            }),
            min_gap_ms: AtomicU32::new(0),
        }
    }

    pub fn min_gap_ms(&self) -> u64 {
        self.min_gap_ms.load(Ordering::Relaxed) as u64
    }

    /// Sleeps, if needed, to respect the current minimum gap, then
    /// records the new start time. Call immediately before issuing an
    /// upstream request.
    async fn wait_for_slot(&self) {
        let min_gap = StdDuration::from_millis(self.min_gap_ms());
        let mut guard = self.state.lock().await;
        if let Some(last) = guard.last_start {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
        guard.last_start = Some(Instant::now());
    }

    /// Feeds one request's observed latency and rate-limit headers into
    /// the adaptive backoff (spec.md §4.4 "Slow-response detector" and
    /// "Header-advertised limit").
    async fn record_outcome(&self, elapsed: StdDuration, remaining: Option<u64>, total: Option<u64>) {
        let mut guard = self.state.lock().await;
        if elapsed > SLOW_THRESHOLD {
            guard.consecutive_slow += 1;
        } else {
            guard.consecutive_slow = guard.consecutive_slow.saturating_sub(1);
        }

        if guard.consecutive_slow >= SLOW_STREAK_FOR_BACKOFF {
            let exp = guard.consecutive_slow - SLOW_STREAK_FOR_BACKOFF;
            let backoff = 500.0 * 1.5f64.powi(exp as i32);
            let new_gap = backoff.min(MAX_MIN_GAP_MS as f64) as u32;
            self.min_gap_ms.store(new_gap, Ordering::Relaxed);
            warn!(consecutive_slow = guard.consecutive_slow, min_gap_ms = new_gap, "raising upstream request gap");
        }

        if let (Some(remaining), Some(total)) = (remaining, total) {
            if total > 0 && (remaining as f64 / total as f64) < 0.2 {
                let current = self.min_gap_ms();
                if current < HEADER_LOW_WATERMARK_MIN_GAP_MS {
                    self.min_gap_ms.store(HEADER_LOW_WATERMARK_MIN_GAP_MS as u32, Ordering::Relaxed);
                    warn!("upstream rate-limit headroom below 20%, raising min gap");
                }
            }
        }
    }

    /// A 429 raises `minGapMs` unconditionally, independent of the
    /// slow-streak/header heuristics in `record_outcome` (spec.md §7
    /// `UpstreamRateLimited`: "the engine raises `minGapMs`").
    async fn record_rate_limited(&self) {
        let current = self.min_gap_ms();
        let floor = current.max(RATE_LIMITED_MIN_GAP_MS);
        let doubled = current.saturating_mul(2).max(floor);
        let new_gap = doubled.min(MAX_MIN_GAP_MS) as u32;
        self.min_gap_ms.store(new_gap, Ordering::Relaxed);
        warn!(min_gap_ms = new_gap, "upstream rate limited (429), raising min gap");
    }
}

/// Fetches, merges, and clips one tile's observations. On any upstream
/// error, returns `Ok(vec![])` so the caller can cache an empty tile and
/// suppress repeated failing calls until TTL expiry (spec.md §4.4
/// "Errors").
pub async fn fetch_tile(
    client: &dyn UpstreamClient,
    limiter: &RateLimiter,
    config: &EngineConfig,
    grid: &TileGrid,
    tile_id: TileId,
) -> Vec<Observation> {
    let bounds = grid.tile_bounds(tile_id);
    let radius_km = tile_diagonal_km(config.tile_side_km) * config.tile_radius_buffer;

    let (recent, notable) = tokio::join!(
        fetch_one(client, limiter, &bounds, radius_km, config.max_back_days, true),
        fetch_one(client, limiter, &bounds, radius_km, config.max_back_days, false),
    );

    let recent = match recent {
        Ok(r) => r,
        Err(e) => {
            warn!(tile = %tile_id, error = %e, "recent fetch failed, caching empty tile");
            return vec![];
        }
    };
    let notable = match notable {
        Ok(r) => r,
        Err(e) => {
            warn!(tile = %tile_id, error = %e, "notable fetch failed, caching empty tile");
            return vec![];
        }
    };

    merge_and_clip(&recent.observations, &notable.observations, &bounds)
}

fn tile_diagonal_km(side_km: f64) -> f64 {
    side_km * std::f64::consts::SQRT_2
}

async fn fetch_one(
    client: &dyn UpstreamClient,
    limiter: &RateLimiter,
    bounds: &TileBounds,
    radius_km: f64,
    back_days: u32,
    recent: bool,
) -> Result<RawResponse, EngineError> {
    limiter.wait_for_slot().await;
    let start = Instant::now();
    let result = if recent {
        client
            .fetch_recent(bounds.center_lat, bounds.center_lng, radius_km, back_days)
            .await
    } else {
        client
            .fetch_notable(bounds.center_lat, bounds.center_lng, radius_km, back_days)
            .await
    };
    let elapsed = start.elapsed();

    if matches!(result, Err(EngineError::UpstreamRateLimited { .. })) {
        limiter.record_rate_limited().await;
    } else {
        let (remaining, total) = match &result {
            Ok(r) => (r.rate_limit_remaining, r.rate_limit_total),
            Err(_) => (None, None),
        };
        limiter.record_outcome(elapsed, remaining, total).await;
    }
    debug!(elapsed_ms = elapsed.as_millis() as u64, recent, "upstream fetch completed");

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FakeClient {
        recent: Vec<RawObservation>,
        notable: Vec<RawObservation>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamClient for FakeClient {
        async fn fetch_recent(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(RawResponse {
                observations: self.recent.clone(),
                rate_limit_remaining: None,
                rate_limit_total: None,
            })
        }

        async fn fetch_notable(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(RawResponse {
                observations: self.notable.clone(),
                rate_limit_remaining: None,
                rate_limit_total: None,
            })
        }
    }

    struct FailingClient;

    #[async_trait]
    impl UpstreamClient for FailingClient {
        async fn fetch_recent(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            Err(EngineError::UpstreamUnavailable {
                tile_id: "x".into(),
                reason: "boom".into(),
            })
        }
        async fn fetch_notable(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            Err(EngineError::UpstreamUnavailable {
                tile_id: "x".into(),
                reason: "boom".into(),
            })
        }
    }

    #[tokio::test]
    async fn fetch_tile_merges_both_endpoints() {
        let client = FakeClient {
            recent: vec![],
            notable: vec![],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let limiter = RateLimiter::new();
        let config = EngineConfig::default();
        let grid = TileGrid::new(config.tile_side_km, config.max_latitude_deg, config.viewport_edge_buffer);
        let result = fetch_tile(&client, &limiter, &config, &grid, TileId::new(0, 0)).await;
        assert!(result.is_empty());
        assert_eq!(client.calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_upstream_yields_empty_tile_not_a_panic() {
        let limiter = RateLimiter::new();
        let config = EngineConfig::default();
        let grid = TileGrid::new(config.tile_side_km, config.max_latitude_deg, config.viewport_edge_buffer);
        let result = fetch_tile(&FailingClient, &limiter, &config, &grid, TileId::new(0, 0)).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn slow_streak_raises_min_gap_within_bounds() {
        let limiter = RateLimiter::new();
        for _ in 0..4 {
            limiter
                .record_outcome(StdDuration::from_secs(6), None, None)
                .await;
        }
        let gap = limiter.min_gap_ms();
        assert!(gap >= 500 && gap <= MAX_MIN_GAP_MS);
    }

    #[tokio::test]
    async fn fast_response_decrements_but_does_not_reset_min_gap() {
        let limiter = RateLimiter::new();
        for _ in 0..4 {
            limiter.record_outcome(StdDuration::from_secs(6), None, None).await;
        }
        let gap_before = limiter.min_gap_ms();
        limiter.record_outcome(StdDuration::from_millis(100), None, None).await;
        let gap_after = limiter.min_gap_ms();
        assert_eq!(gap_before, gap_after);
        assert!(gap_after > 0);
    }

    #[tokio::test]
    async fn low_header_headroom_raises_min_gap_to_at_least_500() {
        let limiter = RateLimiter::new();
        limiter.record_outcome(StdDuration::from_millis(50), Some(10), Some(100)).await;
        assert!(limiter.min_gap_ms() >= 500);
    }

    struct RateLimitedClient;

    #[async_trait]
    impl UpstreamClient for RateLimitedClient {
        async fn fetch_recent(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            Err(EngineError::UpstreamRateLimited { tile_id: "x".into() })
        }
        async fn fetch_notable(&self, _lat: f64, _lng: f64, _dist_km: f64, _back_days: u32) -> Result<RawResponse, EngineError> {
            Err(EngineError::UpstreamRateLimited { tile_id: "x".into() })
        }
    }

    #[tokio::test]
    async fn rate_limited_response_raises_min_gap_even_though_fast() {
        let limiter = RateLimiter::new();
        let config = EngineConfig::default();
        let grid = TileGrid::new(config.tile_side_km, config.max_latitude_deg, config.viewport_edge_buffer);
        let result = fetch_tile(&RateLimitedClient, &limiter, &config, &grid, TileId::new(0, 0)).await;
        assert!(result.is_empty());
        assert!(limiter.min_gap_ms() >= RATE_LIMITED_MIN_GAP_MS);
    }

    #[tokio::test]
    async fn rate_limited_bump_does_not_affect_slow_streak_counter() {
        let limiter = RateLimiter::new();
        limiter.record_rate_limited().await;
        let gap_after_one = limiter.min_gap_ms();
        limiter.record_rate_limited().await;
        assert!(limiter.min_gap_ms() >= gap_after_one);
    }
}
