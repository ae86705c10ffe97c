//! Aviary tile cache: a geospatial proxy cache in front of a
//! rate-limited upstream bird-observation API.
//!
//! `Engine` is the process-scoped value that owns all shared state
//! (spec.md §9 "restate as a process-scoped `Engine` value"), generalized
//! from `sx9-cdn-geospatial::GeospatialCdnNode`'s single-struct-of-Arcs
//! shape but split across the narrower component modules below so the
//! orchestrator depends on focused collaborators rather than one
//! monolith.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod tile;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use bus::{NotificationBus, TileUpdateEvent};
use cache::{CacheStats, TileCache};
use config::EngineConfig;
use error::{EngineError, Result};
use fetcher::{fetch_tile, RateLimiter, UpstreamClient};
use ledger::ClientLedger;
use models::{TileId, Viewport, WireObservation};
use tile::TileGrid;

/// Response of a viewport query (spec.md §6 "Query endpoint").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub birds: Vec<WireObservation>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    pub has_background_loading: bool,
    pub pending_tile_count: usize,
}

/// Response of the tile-debug administrative endpoint (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDebugResponse {
    pub tile_count: usize,
    pub cache_hits: usize,
    pub config: TileDebugConfig,
    pub corners: TileDebugCorners,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDebugConfig {
    pub tile_size_km: f64,
    pub tile_radius_buffer: f64,
    pub viewport_edge_buffer: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDebugCorner {
    pub tile_id: String,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDebugCorners {
    pub north_west: TileDebugCorner,
    pub north_east: TileDebugCorner,
    pub south_west: TileDebugCorner,
    pub south_east: TileDebugCorner,
}

/// The process-scoped engine. Constructed once at startup and shared
/// behind an `Arc` with every entry point (HTTP handlers, the sweeper
/// task, background fetch tasks).
pub struct Engine {
    config: EngineConfig,
    grid: TileGrid,
    cache: Arc<TileCache>,
    ledger: Arc<ClientLedger>,
    bus: Arc<NotificationBus>,
    limiter: Arc<RateLimiter>,
    upstream: Arc<dyn UpstreamClient>,
}

impl Engine {
    pub fn new(config: EngineConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
        let grid = TileGrid::new(
            config.tile_side_km,
            config.max_latitude_deg,
            config.viewport_edge_buffer,
        );
        let cache = Arc::new(TileCache::new(config.cache_ttl_minutes, config.tile_side_km));
        let ledger = Arc::new(ClientLedger::new(config.ledger_idle_ttl_minutes));
        let bus = Arc::new(NotificationBus::new());
        let limiter = Arc::new(RateLimiter::new());

        Self {
            config,
            grid,
            cache,
            ledger,
            bus,
            limiter,
            upstream,
        }
    }

    fn validate_viewport(viewport: &Viewport) -> Result<()> {
        if !(-90.0..=90.0).contains(&viewport.min_lat) || !(-90.0..=90.0).contains(&viewport.max_lat) {
            return Err(EngineError::invalid_viewport("latitude out of range"));
        }
        if !(-180.0..=180.0).contains(&viewport.min_lng) || !(-180.0..=180.0).contains(&viewport.max_lng) {
            return Err(EngineError::invalid_viewport("longitude out of range"));
        }
        if viewport.min_lat >= viewport.max_lat {
            return Err(EngineError::invalid_viewport("minLat must be less than maxLat"));
        }
        if viewport.min_lng >= viewport.max_lng {
            return Err(EngineError::invalid_viewport("minLng must be less than maxLng"));
        }
        Ok(())
    }

    /// Entry point: spec.md §4.5 `query(viewport, clientId?)`. Takes an
    /// owned `Arc<Self>` receiver (the axum state extractor already
    /// hands out a cloned `Arc`) so the background tail can capture its
    /// own handle without a separate `Weak`/`Arc` bookkeeping scheme.
    #[instrument(skip(self), fields(client_id = client_id.unwrap_or("-")))]
    pub async fn query(self: Arc<Self>, viewport: Viewport, client_id: Option<&str>) -> Result<QueryResponse> {
        Self::validate_viewport(&viewport)?;

        // Stage 2: enumerate the covering tile set.
        let tiles = self.grid.tiles_for_viewport(&viewport);

        // Stage 3: identify tiles missing from the shared cache.
        let missing = self.cache.missing(&tiles);

        // Stage 4: rank by distance to viewport center.
        let (center_lat, center_lng) = viewport.center();
        let ranked = orchestrator::rank_by_distance(&self.grid, &missing, center_lat, center_lng);

        // Stage 5: batch.
        let batches = orchestrator::batch_tiles(&ranked, self.config.max_parallel_requests);

        // Stage 6: foreground/background split.
        let foreground_count = batches.len().min(self.config.max_initial_batches);
        let (foreground, background) = batches.split_at(foreground_count);

        for batch in foreground {
            self.run_batch(batch).await;
        }

        if !background.is_empty() {
            Self::spawn_background(
                self.clone(),
                background.to_vec(),
                viewport,
                client_id.map(|s| s.to_string()),
            );
        }

        // Stage 7: assemble the client-delta response.
        let delta_candidates = match client_id {
            Some(id) => self.ledger.missing_for(id, &tiles),
            None => tiles.clone(),
        };

        let mut birds = Vec::new();
        let mut delivered_tiles = Vec::with_capacity(delta_candidates.len());
        for tile_id in &delta_candidates {
            if let Some(entry) = self.cache.get(*tile_id) {
                for obs in entry.observations {
                    birds.push(WireObservation::from_observation(obs, *tile_id));
                }
                delivered_tiles.push(*tile_id);
            }
        }

        // Stage 8: commit to the ledger only after observations are
        // materialized into the response (I3).
        if let Some(id) = client_id {
            if !delivered_tiles.is_empty() {
                self.ledger.seen(id, &delivered_tiles);
            }
        }

        let pending_tile_count: usize = background.iter().map(|b| b.len()).sum();

        info!(
            tile_count = tiles.len(),
            missing_count = missing.len(),
            delivered = birds.len(),
            pending_tile_count,
            "query resolved"
        );

        Ok(QueryResponse {
            birds,
            metadata: QueryMetadata {
                has_background_loading: pending_tile_count > 0,
                pending_tile_count,
            },
        })
    }

    /// Fetches every tile in one batch concurrently and writes each
    /// result into the shared cache. Each tile's fetch-and-cache-put runs
    /// inside its own `tokio::spawn`'ed task so that dropping the caller
    /// (e.g. a cancelled inbound request) does not drop the in-flight
    /// upstream call or lose its cache write (spec.md §5 cancellation
    /// guarantee); this method still awaits every task before returning,
    /// so foreground callers keep blocking on batch completion as before.
    async fn run_batch(&self, batch: &[TileId]) {
        let handles: Vec<_> = batch
            .iter()
            .map(|&tile_id| {
                let upstream = self.upstream.clone();
                let limiter = self.limiter.clone();
                let config = self.config.clone();
                let grid = self.grid;
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    let observations = fetch_tile(upstream.as_ref(), &limiter, &config, &grid, tile_id).await;
                    cache.put(tile_id, observations);
                })
            })
            .collect();

        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "tile fetch task panicked");
            }
        }
    }

    /// Spawns the background tail: batches run sequentially (each
    /// internally concurrent), publishing one notification per batch
    /// and a final `isComplete=true` event when the queue drains
    /// (spec.md §4.8 "Background work for a viewport").
    fn spawn_background(engine: Arc<Self>, batches: Vec<Vec<TileId>>, viewport: Viewport, client_id: Option<String>) {
        let total_batches = batches.len();

        tokio::spawn(async move {
            let mut remaining: Vec<TileId> = batches.iter().flatten().copied().collect();

            for (index, batch) in batches.into_iter().enumerate() {
                engine.run_batch(&batch).await;
                remaining.retain(|id| !batch.contains(id));

                if let Some(client_id) = &client_id {
                    let is_complete = index + 1 == total_batches;
                    let event = NotificationBus::make_event(
                        &batch,
                        index + 1,
                        total_batches,
                        &remaining,
                        viewport,
                        is_complete,
                    );
                    engine.bus.publish(client_id, event);
                }
            }
        });
    }

    pub fn subscribe(&self, client_id: &str) -> mpsc::Receiver<TileUpdateEvent> {
        self.bus.subscribe(client_id)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.bus.unsubscribe(client_id);
    }

    pub fn reset_client(&self, client_id: &str) {
        self.ledger.reset(client_id);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_expired_cache(&self) -> usize {
        self.cache.sweep()
    }

    pub fn sweep_ledger(&self) -> usize {
        self.ledger.sweep()
    }

    pub fn tile_debug(&self, viewport: Viewport) -> Result<TileDebugResponse> {
        Self::validate_viewport(&viewport)?;
        let tiles = self.grid.tiles_for_viewport(&viewport);
        let cache_hits = tiles.iter().filter(|&&id| self.cache.get(id).is_some()).count();

        let corner_at = |lat: f64, lng: f64| {
            let id = self.grid.tile_id_for_point(lat, lng);
            let bounds = self.grid.tile_bounds(id);
            TileDebugCorner {
                tile_id: id.to_string(),
                min_lat: bounds.min_lat,
                max_lat: bounds.max_lat,
                min_lng: bounds.min_lng,
                max_lng: bounds.max_lng,
            }
        };

        Ok(TileDebugResponse {
            tile_count: tiles.len(),
            cache_hits,
            config: TileDebugConfig {
                tile_size_km: self.config.tile_side_km,
                tile_radius_buffer: self.config.tile_radius_buffer,
                viewport_edge_buffer: self.config.viewport_edge_buffer,
            },
            corners: TileDebugCorners {
                north_west: corner_at(viewport.max_lat, viewport.min_lng),
                north_east: corner_at(viewport.max_lat, viewport.max_lng),
                south_west: corner_at(viewport.min_lat, viewport.min_lng),
                south_east: corner_at(viewport.min_lat, viewport.max_lng),
            },
        })
    }

    /// Spawns the periodic tile-cache and ledger sweep (spec.md §4.2
    /// "runs on a timer at a configured interval").
    pub fn spawn_sweeper(engine: Arc<Self>) {
        let interval = std::time::Duration::from_secs(engine.config.sweep_interval_minutes * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed_tiles = engine.cache.sweep();
                let removed_clients = engine.ledger.sweep();
                info!(removed_tiles, removed_clients, "sweep completed");
            }
        });
    }
}
