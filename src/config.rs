//! Engine configuration.
//!
//! Loaded from environment variables with documented defaults, following
//! the `from_env`/`validate` shape used across the workspace for
//! credential-bearing configs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing upstream credential: set AVIARY_API_KEY")]
    MissingCredential,

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment error: {0}")]
    EnvError(#[from] std::env::VarError),
}

/// Engine-wide configuration (spec.md §6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tile side length, kilometers.
    pub tile_side_km: f64,
    /// Multiplier applied to the tile diagonal when requesting upstream radius.
    pub tile_radius_buffer: f64,
    /// Fraction of each viewport dimension added as edge buffer before tiling.
    pub viewport_edge_buffer: f64,
    /// Cache entry time-to-live, minutes.
    pub cache_ttl_minutes: u64,
    /// Tile cache sweep interval, minutes.
    pub sweep_interval_minutes: u64,
    /// Client ledger idle time-to-live, minutes.
    pub ledger_idle_ttl_minutes: u64,
    /// Maximum concurrent upstream fetches per batch.
    pub max_parallel_requests: usize,
    /// Number of batches run synchronously before the rest moves to background.
    pub max_initial_batches: usize,
    /// Maximum look-back window requested from upstream, days.
    pub max_back_days: u32,
    /// Maximum absolute latitude used for tile indexing, degrees.
    pub max_latitude_deg: f64,
    /// Upstream API credential.
    pub upstream_api_key: String,
    /// Upstream API base URL (no trailing slash).
    pub upstream_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_side_km: 2.0,
            tile_radius_buffer: 1.1,
            viewport_edge_buffer: 0.1,
            cache_ttl_minutes: 240,
            sweep_interval_minutes: 15,
            ledger_idle_ttl_minutes: 240,
            max_parallel_requests: 1,
            max_initial_batches: usize::MAX,
            max_back_days: 14,
            max_latitude_deg: 85.0,
            upstream_api_key: String::new(),
            upstream_base_url: "https://api.ebird.org/v2/data/obs/geo".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for everything but the credential.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        cfg.upstream_api_key =
            std::env::var("AVIARY_API_KEY").map_err(|_| ConfigError::MissingCredential)?;

        if let Ok(v) = std::env::var("AVIARY_UPSTREAM_BASE_URL") {
            cfg.upstream_base_url = v;
        }
        if let Some(v) = parse_env("AVIARY_TILE_SIDE_KM") {
            cfg.tile_side_km = v;
        }
        if let Some(v) = parse_env("AVIARY_TILE_RADIUS_BUFFER") {
            cfg.tile_radius_buffer = v;
        }
        if let Some(v) = parse_env("AVIARY_VIEWPORT_EDGE_BUFFER") {
            cfg.viewport_edge_buffer = v;
        }
        if let Some(v) = parse_env("AVIARY_CACHE_TTL_MINUTES") {
            cfg.cache_ttl_minutes = v;
        }
        if let Some(v) = parse_env("AVIARY_SWEEP_INTERVAL_MINUTES") {
            cfg.sweep_interval_minutes = v;
        }
        if let Some(v) = parse_env("AVIARY_LEDGER_IDLE_TTL_MINUTES") {
            cfg.ledger_idle_ttl_minutes = v;
        }
        if let Some(v) = parse_env("AVIARY_MAX_PARALLEL_REQUESTS") {
            cfg.max_parallel_requests = v;
        }
        if let Some(v) = parse_env("AVIARY_MAX_INITIAL_BATCHES") {
            cfg.max_initial_batches = v;
        }
        if let Some(v) = parse_env("AVIARY_MAX_BACK_DAYS") {
            cfg.max_back_days = v;
        }
        if let Some(v) = parse_env("AVIARY_MAX_LATITUDE_DEG") {
            cfg.max_latitude_deg = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate invariants that would otherwise surface as confusing
    /// downstream failures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_api_key.is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        if self.tile_side_km <= 0.0 {
            return Err(ConfigError::Invalid("tile_side_km must be positive".into()));
        }
        if self.max_parallel_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_requests must be at least 1".into(),
            ));
        }
        if !(0.0..=90.0).contains(&self.max_latitude_deg) {
            return Err(ConfigError::Invalid(
                "max_latitude_deg must be within [0, 90]".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
