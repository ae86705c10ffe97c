//! Notification bus (spec.md §4.7, component G): per-client channel
//! receiving background-completion events.
//!
//! Generalizes `sx9-foundation-data::database_pubsub::DatabasePubSubEngine`
//! (a registry of `broadcast::Sender`s keyed by category) to one
//! `mpsc::Sender` per *client* rather than per category, since delivery
//! here must be scoped to the single client that issued the viewport
//! query rather than broadcast to every listener.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{TileId, Viewport};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileUpdateEvent {
    pub completed_tile_ids: Vec<String>,
    pub batch_number: usize,
    pub total_batches: usize,
    pub remaining_tile_ids: Vec<String>,
    pub viewport: Viewport,
    pub is_complete: bool,
}

pub struct NotificationBus {
    subscribers: DashMap<String, mpsc::Sender<TileUpdateEvent>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Returns a receiver scoped to one client. A second subscribe call
    /// for the same client replaces the first (the old receiver simply
    /// stops receiving new events).
    pub fn subscribe(&self, client_id: &str) -> mpsc::Receiver<TileUpdateEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.insert(client_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.subscribers.remove(client_id);
    }

    /// Non-blocking publish: if there is no subscriber, or the
    /// subscriber's channel is full, the event is dropped (spec.md §4.7:
    /// "the client can always re-query to converge").
    pub fn publish(&self, client_id: &str, event: TileUpdateEvent) {
        if let Some(tx) = self.subscribers.get(client_id) {
            if tx.try_send(event).is_err() {
                debug!(client_id, "dropped notification: subscriber slow or channel full");
            }
        }
    }

    pub fn make_event(
        tile_ids_completed: &[TileId],
        batch_number: usize,
        total_batches: usize,
        remaining: &[TileId],
        viewport: Viewport,
        is_complete: bool,
    ) -> TileUpdateEvent {
        TileUpdateEvent {
            completed_tile_ids: tile_ids_completed.iter().map(|t| t.to_string()).collect(),
            batch_number,
            total_batches,
            remaining_tile_ids: remaining.iter().map(|t| t.to_string()).collect(),
            viewport,
            is_complete,
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
