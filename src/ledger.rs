//! Client ledger (spec.md §4.6, component C): per-client record of tile
//! ids already delivered, used to compute response deltas.
//!
//! Concurrency idiom (`DashMap` keyed by client id, last-touched
//! timestamp per entry) generalizes
//! `sx9-cdn-geospatial::GeospatialCdnNode::access_patterns`.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

use crate::models::TileId;

struct LedgerEntry {
    tiles: HashSet<TileId>,
    last_touched: DateTime<Utc>,
}

pub struct ClientLedger {
    entries: DashMap<String, LedgerEntry>,
    idle_ttl: Duration,
}

impl ClientLedger {
    pub fn new(idle_ttl_minutes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl: Duration::minutes(idle_ttl_minutes as i64),
        }
    }

    fn is_fresh(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> bool {
        now - entry.last_touched < self.idle_ttl
    }

    /// Ids not yet in the client's set (or all ids if the entry is
    /// absent or has gone idle-stale). Does not mutate.
    pub fn missing_for(&self, client_id: &str, tile_ids: &[TileId]) -> Vec<TileId> {
        let now = Utc::now();
        match self.entries.get(client_id) {
            Some(entry) if self.is_fresh(&entry, now) => tile_ids
                .iter()
                .copied()
                .filter(|id| !entry.tiles.contains(id))
                .collect(),
            _ => tile_ids.to_vec(),
        }
    }

    /// Inserts `tile_ids` into the client's delivered set, creating the
    /// entry if absent (or if it had gone idle-stale), and refreshes
    /// `last_touched`.
    pub fn seen(&self, client_id: &str, tile_ids: &[TileId]) {
        let now = Utc::now();
        let stale = self
            .entries
            .get(client_id)
            .map(|e| !self.is_fresh(&e, now))
            .unwrap_or(false);

        if stale {
            self.entries.remove(client_id);
        }

        self.entries
            .entry(client_id.to_string())
            .and_modify(|e| {
                e.tiles.extend(tile_ids.iter().copied());
                e.last_touched = now;
            })
            .or_insert_with(|| LedgerEntry {
                tiles: tile_ids.iter().copied().collect(),
                last_touched: now,
            });
    }

    /// Removes entries whose `last_touched` is older than the idle TTL.
    /// Returns the count removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| self.is_fresh(e, now));
        before - self.entries.len()
    }

    /// Removes a client's entry entirely (client-initiated "send me
    /// everything again").
    pub fn reset(&self, client_id: &str) {
        self.entries.remove(client_id);
    }
}
