//! Viewport orchestrator helpers (spec.md §4.5, component F): ranking
//! and batching of missing tiles. The `Engine::query` method in `lib.rs`
//! drives these helpers through the full 9-stage pipeline; they are
//! split out here so each has a single, testable responsibility (per
//! spec.md §9's note on restating lazy pipelines as explicit, stated
//! passes).

use crate::models::TileId;
use crate::tile::TileGrid;

/// Stage 4: rank missing tiles by ascending Euclidean distance from tile
/// center to viewport center, breaking ties by tile id (spec.md §4.5
/// "tie-breaks").
pub fn rank_by_distance(grid: &TileGrid, tiles: &[TileId], center_lat: f64, center_lng: f64) -> Vec<TileId> {
    let mut ranked: Vec<(f64, TileId)> = tiles
        .iter()
        .map(|&id| {
            let bounds = grid.tile_bounds(id);
            let d_lat = bounds.center_lat - center_lat;
            let d_lng = bounds.center_lng - center_lng;
            ((d_lat * d_lat + d_lng * d_lng).sqrt(), id)
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });

    ranked.into_iter().map(|(_, id)| id).collect()
}

/// Stage 5: partition a ranked list into consecutive groups of at most
/// `batch_size` tiles each.
pub fn batch_tiles(ranked: &[TileId], batch_size: usize) -> Vec<Vec<TileId>> {
    if batch_size == 0 {
        return vec![ranked.to_vec()];
    }
    ranked.chunks(batch_size).map(|c| c.to_vec()).collect()
}
