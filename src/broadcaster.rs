use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::models::Ranking;

/// Default bounded outbound buffer per subscriber (spec default: 64).
pub const SUBSCRIBER_BUFFER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEnvelope {
    ScoreboardUpdate {
        scoreboard: Ranking,
        total_users: i64,
        last_updated: i64,
    },
    ConnectionStatus {
        status: &'static str,
        subscriber_id: Uuid,
        timestamp: String,
    },
    Error {
        error: String,
        timestamp: String,
    },
}

struct SubscriberHandle {
    tx: mpsc::Sender<Arc<BroadcastEnvelope>>,
}

/// Fan-out to live subscribers. Each subscriber owns a bounded mpsc
/// channel; a full or closed channel marks that subscriber slow and
/// evicts it rather than blocking `emit` or the other subscribers. The
/// `DashMap` is only ever touched for O(1) insert/remove/iterate — never
/// held across a network write.
pub struct Broadcaster {
    subscribers: DashMap<Uuid, SubscriberHandle>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Registers a subscriber and immediately enqueues a
    /// `connection_status{connected}` message as proof-of-life.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Arc<BroadcastEnvelope>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_CAPACITY);
        self.subscribers.insert(id, SubscriberHandle { tx: tx.clone() });

        let connected = Arc::new(BroadcastEnvelope::ConnectionStatus {
            status: "connected",
            subscriber_id: id,
            timestamp: Utc::now().to_rfc3339(),
        });
        let _ = tx.try_send(connected);

        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    /// Writes an `error` envelope back to a single subscriber (malformed
    /// inbound frame). Unlike `emit`, this never evicts on a full buffer —
    /// a client spamming garbage frames just has its error reports dropped
    /// rather than losing its scoreboard subscription over it.
    pub fn send_error(&self, id: Uuid, error: &str, timestamp: String) {
        if let Some(entry) = self.subscribers.get(&id) {
            let envelope = Arc::new(BroadcastEnvelope::Error {
                error: error.to_string(),
                timestamp,
            });
            let _ = entry.tx.try_send(envelope);
        }
    }

    /// Builds the ranking message once and enqueues the same `Arc` into
    /// every subscriber's buffer. Subscribers whose buffer is full (or
    /// whose receiver has dropped) are evicted after the fan-out pass.
    pub fn emit(&self, scoreboard: Ranking, total_users: i64, last_updated: i64) {
        let envelope = Arc::new(BroadcastEnvelope::ScoreboardUpdate {
            scoreboard,
            total_users,
            last_updated,
        });

        let mut evicted = Vec::new();
        for entry in &self.subscribers {
            if entry.value().tx.try_send(envelope.clone()).is_err() {
                evicted.push(*entry.key());
            }
        }

        for id in evicted {
            warn!("evicting slow subscriber {id}");
            self.subscribers.remove(&id);
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking() -> Ranking {
        Vec::new()
    }

    #[test]
    fn subscribe_enqueues_connected_message() {
        let broadcaster = Broadcaster::new();
        let (_id, mut rx) = broadcaster.subscribe();
        let msg = rx.try_recv().unwrap();
        assert!(matches!(*msg, BroadcastEnvelope::ConnectionStatus { .. }));
    }

    #[test]
    fn slow_subscriber_is_evicted_without_dropping_others() {
        let broadcaster = Broadcaster::new();
        let (slow_id, mut slow_rx) = broadcaster.subscribe();
        let (_fast_id, mut fast_rx) = broadcaster.subscribe();

        // drain the initial connection_status messages
        slow_rx.try_recv().ok();
        fast_rx.try_recv().ok();

        for _ in 0..SUBSCRIBER_BUFFER_CAPACITY + 1 {
            broadcaster.emit(ranking(), 0, 0);
        }

        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(broadcaster.subscribers.get(&slow_id).is_none());

        let mut delivered = 0;
        while fast_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, SUBSCRIBER_BUFFER_CAPACITY);
    }

    #[test]
    fn send_error_targets_only_the_given_subscriber() {
        let broadcaster = Broadcaster::new();
        let (target_id, mut target_rx) = broadcaster.subscribe();
        let (_other_id, mut other_rx) = broadcaster.subscribe();
        target_rx.try_recv().ok();
        other_rx.try_recv().ok();

        broadcaster.send_error(target_id, "malformed frame", "2026-01-01T00:00:00Z".to_string());

        let msg = target_rx.try_recv().unwrap();
        assert!(matches!(*msg, BroadcastEnvelope::Error { .. }));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_handle() {
        let broadcaster = Broadcaster::new();
        let (id, _rx) = broadcaster.subscribe();
        broadcaster.unsubscribe(id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
