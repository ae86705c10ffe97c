//! Domain types shared across the engine: tile identity, observations, and
//! the viewport a caller queries against. Derive shape mirrors
//! `sx9-cdn-geospatial::{TileCoord, CachedTile}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer tile coordinate pair. Latitude-major to match
/// `tileY = floor(lat / latEdge)`. Ordered lexicographically on
/// `(tile_y, tile_x)` to support the rank tie-break in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub tile_y: i64,
    pub tile_x: i64,
}

impl TileId {
    pub fn new(tile_y: i64, tile_x: i64) -> Self {
        Self { tile_y, tile_x }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tile_y, self.tile_x)
    }
}

/// The axis-aligned lat/lng rectangle a caller asks about.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Viewport {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// A single upstream record, as returned (after JSON decode) by either the
/// `recent` or `recent/notable` endpoint. Ordered newest-first within each
/// endpoint's response, per spec.md §4.3.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObservation {
    pub species_code: String,
    pub com_name: String,
    pub sci_name: String,
    pub lat: f64,
    pub lng: f64,
    pub obs_dt: DateTime<Utc>,
    #[serde(default)]
    pub sub_id: Option<String>,
}

/// A merged, deduplicated observation as held inside a tile cache entry
/// (spec.md §3 "Observation"). `sub_ids` is the aggregated plural form;
/// the singular `sub_id` field is dropped after merge (I2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub species_code: String,
    pub com_name: String,
    pub sci_name: String,
    pub lat: f64,
    pub lng: f64,
    pub obs_dt: DateTime<Utc>,
    pub sub_ids: Vec<String>,
    pub is_notable: bool,
}

impl Observation {
    /// Dedup key used throughout the merge pipeline (I2).
    pub fn key(&self) -> (String, OrderedLatLng) {
        (self.species_code.clone(), OrderedLatLng::new(self.lat, self.lng))
    }
}

/// Bit-identical float wrapper usable as a hash/ordering key. Observation
/// coordinates come straight from JSON decode without further arithmetic,
/// so exact equality is the correct comparison here (I2's "same location").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedLatLng {
    lat_bits: u64,
    lng_bits: u64,
}

impl OrderedLatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat_bits: lat.to_bits(),
            lng_bits: lng.to_bits(),
        }
    }
}

impl Eq for OrderedLatLng {}

impl std::hash::Hash for OrderedLatLng {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.lat_bits.hash(state);
        self.lng_bits.hash(state);
    }
}

/// Observation shape returned to the client, tagged with its tile id
/// (spec.md §3 "On the wire to the client, it additionally carries the
/// identifier of the tile it belongs to").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireObservation {
    pub species_code: String,
    pub com_name: String,
    pub sci_name: String,
    pub lat: f64,
    pub lng: f64,
    pub obs_dt: DateTime<Utc>,
    pub sub_ids: Vec<String>,
    pub is_notable: bool,
    #[serde(rename = "_tileId")]
    pub tile_id: String,
}

impl WireObservation {
    pub fn from_observation(obs: Observation, tile_id: TileId) -> Self {
        Self {
            species_code: obs.species_code,
            com_name: obs.com_name,
            sci_name: obs.sci_name,
            lat: obs.lat,
            lng: obs.lng,
            obs_dt: obs.obs_dt,
            sub_ids: obs.sub_ids,
            is_notable: obs.is_notable,
            tile_id: tile_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_id_orders_lexicographically() {
        let a = TileId::new(1, 9);
        let b = TileId::new(2, 0);
        assert!(a < b);
    }

    #[test]
    fn tile_id_display_round_trips_as_key() {
        let id = TileId::new(-3, 7);
        assert_eq!(id.to_string(), "-3:7");
    }

    #[test]
    fn viewport_center_is_midpoint() {
        let vp = Viewport {
            min_lat: 36.0,
            max_lat: 38.0,
            min_lng: -123.0,
            max_lng: -121.0,
        };
        assert_eq!(vp.center(), (37.0, -122.0));
    }
}
