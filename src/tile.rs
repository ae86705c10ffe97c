//! Tile geometry (spec.md §4.1, component A): deterministic mapping
//! between (lat, lng) and fixed-size equirectangular tiles.
//!
//! Generalizes `sx9-cdn-geospatial::{TileCoord, lat_lon_to_tile,
//! tiles_in_bounds}` from a slippy-map z/x/y grid to a single fixed tile
//! size with a cosine-of-latitude correction on longitude edge length.

use crate::models::{TileId, Viewport};

const KM_PER_DEGREE_LAT: f64 = 111.0;

/// Exact bounding box (plus derived center) of one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
    pub center_lat: f64,
    pub center_lng: f64,
}

impl TileBounds {
    /// Half-open containment test used by the merge/clip pipeline (I1).
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat < self.max_lat && lng >= self.min_lng && lng < self.max_lng
    }
}

/// The tile grid, parameterized by the configured side length and
/// latitude clamp. Stateless beyond its configuration.
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    side_km: f64,
    max_lat_deg: f64,
    edge_buffer_fraction: f64,
}

impl TileGrid {
    pub fn new(side_km: f64, max_lat_deg: f64, edge_buffer_fraction: f64) -> Self {
        Self {
            side_km,
            max_lat_deg,
            edge_buffer_fraction,
        }
    }

    fn lat_edge_deg(&self) -> f64 {
        self.side_km / KM_PER_DEGREE_LAT
    }

    fn lng_edge_deg_at(&self, lat_deg: f64) -> f64 {
        let lat_rad = lat_deg.to_radians();
        self.side_km / (KM_PER_DEGREE_LAT * lat_rad.cos())
    }

    fn clamp_lat(&self, lat: f64) -> f64 {
        lat.clamp(-self.max_lat_deg, self.max_lat_deg)
    }

    /// `tileIdForPoint`: clamps lat, derives longitude edge from the
    /// cosine of the *clamped point's* latitude.
    pub fn tile_id_for_point(&self, lat: f64, lng: f64) -> TileId {
        let clamped_lat = self.clamp_lat(lat);
        let lat_edge = self.lat_edge_deg();
        let lng_edge = self.lng_edge_deg_at(clamped_lat);

        let tile_y = (clamped_lat / lat_edge).floor() as i64;
        let tile_x = (lng / lng_edge).floor() as i64;
        TileId::new(tile_y, tile_x)
    }

    /// `tileBounds`: longitude edge is derived from the cosine of the
    /// tile's own midline latitude, so this and `tile_id_for_point` are
    /// mutual inverses up to the half-open convention (not exact for
    /// points far from the tile's midline, per spec.md §4.1).
    pub fn tile_bounds(&self, tile_id: TileId) -> TileBounds {
        let lat_edge = self.lat_edge_deg();
        let min_lat = tile_id.tile_y as f64 * lat_edge;
        let max_lat = min_lat + lat_edge;
        let center_lat = (min_lat + max_lat) / 2.0;

        let lng_edge = self.lng_edge_deg_at(center_lat);
        let min_lng = tile_id.tile_x as f64 * lng_edge;
        let max_lng = min_lng + lng_edge;
        let center_lng = (min_lng + max_lng) / 2.0;

        TileBounds {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
            center_lat,
            center_lng,
        }
    }

    /// `tilesForViewport`: expands by the configured edge buffer, clamps
    /// to the latitude bound, then enumerates the inclusive rectangle of
    /// tile ids spanned by the four (possibly buffer-expanded) corners.
    pub fn tiles_for_viewport(&self, viewport: &Viewport) -> Vec<TileId> {
        let lat_span = viewport.max_lat - viewport.min_lat;
        let lng_span = viewport.max_lng - viewport.min_lng;
        let lat_buf = lat_span * self.edge_buffer_fraction;
        let lng_buf = lng_span * self.edge_buffer_fraction;

        let min_lat = self.clamp_lat(viewport.min_lat - lat_buf);
        let max_lat = self.clamp_lat(viewport.max_lat + lat_buf);
        let min_lng = viewport.min_lng - lng_buf;
        let max_lng = viewport.max_lng + lng_buf;

        let corners = [
            self.tile_id_for_point(min_lat, min_lng),
            self.tile_id_for_point(min_lat, max_lng),
            self.tile_id_for_point(max_lat, min_lng),
            self.tile_id_for_point(max_lat, max_lng),
        ];

        let min_tile_y = corners.iter().map(|c| c.tile_y).min().unwrap();
        let max_tile_y = corners.iter().map(|c| c.tile_y).max().unwrap();
        let min_tile_x = corners.iter().map(|c| c.tile_x).min().unwrap();
        let max_tile_x = corners.iter().map(|c| c.tile_x).max().unwrap();

        let mut tiles = Vec::with_capacity(
            ((max_tile_y - min_tile_y + 1) * (max_tile_x - min_tile_x + 1)) as usize,
        );
        for tile_y in min_tile_y..=max_tile_y {
            for tile_x in min_tile_x..=max_tile_x {
                tiles.push(TileId::new(tile_y, tile_x));
            }
        }
        tiles
    }
}
