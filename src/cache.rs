//! Tile cache (spec.md §4.2, component B): a shared, concurrently
//! accessed mapping from tile id to cache entry with TTL expiry.
//!
//! Structure generalizes `sx9-cdn-geospatial::GeospatialCdnNode::tile_cache`
//! (a `DashMap` keyed by a string cache key, checked for `expires_at` on
//! read) into a typed `TileId -> CacheEntry` map with explicit
//! `created_at`/`expires_at` metadata (I4: `expires_at` is immutable once
//! set; refresh means inserting a new entry).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::models::{Observation, TileId};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub observations: Vec<Observation>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub tile_side_km: f64,
    pub ttl_minutes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub approximate_bytes: usize,
    pub oldest_age_seconds: Option<i64>,
    pub config: CacheConfig,
}

pub struct TileCache {
    entries: DashMap<TileId, CacheEntry>,
    ttl: Duration,
    config: CacheConfig,
}

impl TileCache {
    pub fn new(ttl_minutes: u64, tile_side_km: f64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::minutes(ttl_minutes as i64),
            config: CacheConfig {
                tile_side_km,
                ttl_minutes,
            },
        }
    }

    /// Returns the entry if present and unexpired; removes it (and
    /// returns `None`) if found-but-expired.
    pub fn get(&self, tile_id: TileId) -> Option<CacheEntry> {
        let now = Utc::now();
        let hit = self
            .entries
            .get(&tile_id)
            .filter(|e| now < e.expires_at)
            .map(|e| e.clone());

        if hit.is_none() && self.entries.contains_key(&tile_id) {
            // Present but expired: lazily remove (B's passive->removed
            // transition can also be driven by a read).
            self.entries.remove_if(&tile_id, |_, e| now >= e.expires_at);
        }
        hit
    }

    /// Replaces any existing entry with a freshly TTL-stamped one.
    pub fn put(&self, tile_id: TileId, observations: Vec<Observation>) {
        let now = Utc::now();
        self.entries.insert(
            tile_id,
            CacheEntry {
                observations,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Subset of `tile_ids` for which `get` would return `None`. Has the
    /// same lazy-expiry side effect as `get`, no others.
    pub fn missing(&self, tile_ids: &[TileId]) -> Vec<TileId> {
        tile_ids
            .iter()
            .copied()
            .filter(|id| self.get(*id).is_none())
            .collect()
    }

    /// Removes every entry with `expires_at <= now`. Returns the count
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut expired = 0usize;
        let mut approximate_bytes = 0usize;
        let mut oldest: Option<DateTime<Utc>> = None;

        for entry in self.entries.iter() {
            if now >= entry.expires_at {
                expired += 1;
            }
            approximate_bytes += entry.observations.len() * std::mem::size_of::<Observation>();
            oldest = Some(match oldest {
                Some(existing) if existing <= entry.created_at => existing,
                _ => entry.created_at,
            });
        }

        CacheStats {
            total_entries: self.entries.len(),
            expired_entries: expired,
            approximate_bytes,
            oldest_age_seconds: oldest.map(|t| (now - t).num_seconds()),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TileId;
    use chrono::Utc;

    fn sample_observation() -> Observation {
        Observation {
            species_code: "amecro".into(),
            com_name: "American Crow".into(),
            sci_name: "Corvus brachyrhynchos".into(),
            lat: 37.0,
            lng: -122.0,
            obs_dt: Utc::now(),
            sub_ids: vec!["S1".into()],
            is_notable: false,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = TileCache::new(240, 2.0);
        let id = TileId::new(0, 0);
        cache.put(id, vec![sample_observation()]);
        let entry = cache.get(id).expect("entry present");
        assert_eq!(entry.observations.len(), 1);
    }

    #[test]
    fn missing_entry_is_indistinguishable_from_expired() {
        let cache = TileCache::new(0, 2.0);
        let id = TileId::new(1, 1);
        cache.put(id, vec![]);
        // ttl of 0 minutes: immediately expired.
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn empty_list_is_a_valid_cached_entry() {
        let cache = TileCache::new(240, 2.0);
        let id = TileId::new(2, 2);
        cache.put(id, vec![]);
        let entry = cache.get(id).expect("entry present even though empty");
        assert!(entry.observations.is_empty());
    }

    #[test]
    fn missing_returns_only_uncached_ids() {
        let cache = TileCache::new(240, 2.0);
        let cached = TileId::new(0, 0);
        let uncached = TileId::new(9, 9);
        cache.put(cached, vec![]);
        let result = cache.missing(&[cached, uncached]);
        assert_eq!(result, vec![uncached]);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = TileCache::new(240, 2.0);
        let fresh = TileId::new(0, 0);
        cache.put(fresh, vec![]);
        // Force an already-expired entry directly via put + ttl hack:
        // simulate by constructing a cache with 0 ttl for one id.
        let expired_cache = TileCache::new(0, 2.0);
        let stale = TileId::new(1, 1);
        expired_cache.put(stale, vec![]);
        assert_eq!(expired_cache.sweep(), 1);
        assert_eq!(cache.sweep(), 0);
    }
}
