//! Merge/clip pipeline (spec.md §4.3, component E): fuses the `recent`
//! and `recent/notable` upstream lists for one tile into a single
//! deduplicated list with a unified `isNotable` flag, clipped to the
//! tile's exact bounds.
//!
//! Expressed as explicit passes over vectors rather than chained
//! iterator combinators, per spec.md §9's redesign note ("iterators and
//! lazy grouping ... restate as explicit passes, each with a single
//! stated invariant").

use std::collections::{HashMap, HashSet};

use crate::models::{Observation, OrderedLatLng, RawObservation};
use crate::tile::TileBounds;

/// Step 1: compress one upstream list, first-occurrence-wins (the list
/// is newest-first, so the first occurrence of a key is the most
/// recent), aggregating submission ids of later duplicates.
fn compress(records: &[RawObservation]) -> Vec<Observation> {
    let mut order: Vec<(String, OrderedLatLng)> = Vec::new();
    let mut by_key: HashMap<(String, OrderedLatLng), Observation> = HashMap::new();

    for raw in records {
        let key = (raw.species_code.clone(), OrderedLatLng::new(raw.lat, raw.lng));
        match by_key.get_mut(&key) {
            Some(existing) => {
                if let Some(sub_id) = &raw.sub_id {
                    if !existing.sub_ids.contains(sub_id) {
                        existing.sub_ids.push(sub_id.clone());
                    }
                }
            }
            None => {
                order.push(key.clone());
                by_key.insert(
                    key,
                    Observation {
                        species_code: raw.species_code.clone(),
                        com_name: raw.com_name.clone(),
                        sci_name: raw.sci_name.clone(),
                        lat: raw.lat,
                        lng: raw.lng,
                        obs_dt: raw.obs_dt,
                        sub_ids: raw.sub_id.clone().into_iter().collect(),
                        is_notable: false,
                    },
                );
            }
        }
    }

    order.into_iter().map(|k| by_key.remove(&k).unwrap()).collect()
}

/// Step 2: mark every compressed `recent` record notable iff its key is
/// present in the compressed `notable` list; every `notable` record is
/// notable by construction.
fn mark_notability(recent: &mut [Observation], notable_keys: &HashSet<(String, OrderedLatLng)>) {
    for obs in recent.iter_mut() {
        if notable_keys.contains(&obs.key()) {
            obs.is_notable = true;
        }
    }
}

/// Step 3: concatenate both compressed lists and fold by key, ORing
/// `is_notable` and unioning submission ids on collision.
fn union_dedup(recent: Vec<Observation>, notable: Vec<Observation>) -> Vec<Observation> {
    let mut order: Vec<(String, OrderedLatLng)> = Vec::new();
    let mut by_key: HashMap<(String, OrderedLatLng), Observation> = HashMap::new();

    for obs in recent.into_iter().chain(notable.into_iter()) {
        let key = obs.key();
        match by_key.get_mut(&key) {
            Some(existing) => {
                existing.is_notable = existing.is_notable || obs.is_notable;
                for sub_id in obs.sub_ids {
                    if !existing.sub_ids.contains(&sub_id) {
                        existing.sub_ids.push(sub_id);
                    }
                }
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, obs);
            }
        }
    }

    order.into_iter().map(|k| by_key.remove(&k).unwrap()).collect()
}

/// Step 4: drop every record outside the tile's half-open bounds (I1).
fn clip_to_bounds(records: Vec<Observation>, bounds: &TileBounds) -> Vec<Observation> {
    records
        .into_iter()
        .filter(|o| bounds.contains(o.lat, o.lng))
        .collect()
}

/// Runs all four passes for one tile's pair of upstream responses.
pub fn merge_and_clip(
    recent: &[RawObservation],
    notable: &[RawObservation],
    bounds: &TileBounds,
) -> Vec<Observation> {
    let compressed_notable = compress(notable);
    let notable_keys: HashSet<(String, OrderedLatLng)> =
        compressed_notable.iter().map(|o| o.key()).collect();

    let mut compressed_recent = compress(recent);
    mark_notability(&mut compressed_recent, &notable_keys);

    let compressed_notable = compressed_notable
        .into_iter()
        .map(|mut o| {
            o.is_notable = true;
            o
        })
        .collect();

    let unioned = union_dedup(compressed_recent, compressed_notable);
    clip_to_bounds(unioned, bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn raw(species: &str, lat: f64, lng: f64, sub_id: &str, minutes_ago: i64) -> RawObservation {
        RawObservation {
            species_code: species.into(),
            com_name: format!("{species} common"),
            sci_name: format!("{species} scientific"),
            lat,
            lng,
            obs_dt: Utc.timestamp_opt(1_700_000_000 - minutes_ago * 60, 0).unwrap(),
            sub_id: Some(sub_id.into()),
        }
    }

    fn wide_bounds() -> TileBounds {
        TileBounds {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lng: -180.0,
            max_lng: 180.0,
            center_lat: 0.0,
            center_lng: 0.0,
        }
    }

    #[test]
    fn compress_retains_most_recent_and_aggregates_sub_ids() {
        let records = vec![
            raw("amecro", 37.0, -122.0, "S2", 0),
            raw("amecro", 37.0, -122.0, "S1", 5),
        ];
        let compressed = compress(&records);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].sub_ids, vec!["S2".to_string(), "S1".to_string()]);
    }

    #[test]
    fn notability_fusion_s4() {
        let recent = vec![raw("amecro", 36.97, -122.03, "S1", 0)];
        let notable = vec![raw("rufhum", 36.97, -122.03, "S2", 0)];
        let merged = merge_and_clip(&recent, &notable, &wide_bounds());

        let amecro = merged.iter().find(|o| o.species_code == "amecro").unwrap();
        let rufhum = merged.iter().find(|o| o.species_code == "rufhum").unwrap();
        assert!(!amecro.is_notable);
        assert!(rufhum.is_notable);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn same_species_location_in_both_lists_unions_notability_and_sub_ids() {
        let recent = vec![raw("amecro", 37.0, -122.0, "S1", 0)];
        let notable = vec![raw("amecro", 37.0, -122.0, "S2", 0)];
        let merged = merge_and_clip(&recent, &notable, &wide_bounds());

        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_notable);
        let mut ids = merged[0].sub_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["S1".to_string(), "S2".to_string()]);
    }

    #[test]
    fn clip_drops_records_outside_tile_bounds() {
        let bounds = TileBounds {
            min_lat: 37.0,
            max_lat: 37.02,
            min_lng: -122.0,
            max_lng: -121.98,
            center_lat: 37.01,
            center_lng: -121.99,
        };
        let recent = vec![
            raw("amecro", 37.01, -121.99, "S1", 0), // inside
            raw("rufhum", 38.0, -121.99, "S2", 0),  // outside
        ];
        let merged = merge_and_clip(&recent, &[], &bounds);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].species_code, "amecro");
    }

    #[test]
    fn half_open_boundary_is_exclusive_at_max_edge() {
        let bounds = TileBounds {
            min_lat: 37.0,
            max_lat: 37.02,
            min_lng: -122.0,
            max_lng: -121.98,
            center_lat: 37.01,
            center_lng: -121.99,
        };
        // exactly on the max edge: excluded by I1's half-open convention.
        let recent = vec![raw("amecro", 37.02, -121.99, "S1", 0)];
        let merged = merge_and_clip(&recent, &[], &bounds);
        assert!(merged.is_empty());
    }

    #[test]
    fn no_two_retained_observations_share_species_and_location() {
        let recent = vec![
            raw("amecro", 37.0, -122.0, "S1", 0),
            raw("amecro", 37.0, -122.0, "S2", 1),
            raw("rufhum", 37.0, -122.0, "S3", 0),
        ];
        let merged = merge_and_clip(&recent, &[], &wide_bounds());
        let mut seen = HashSet::new();
        for o in &merged {
            assert!(seen.insert(o.key()), "duplicate key retained");
        }
        assert_eq!(merged.len(), 2);
    }
}
