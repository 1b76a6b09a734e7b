//! Relay fan-out: one broadcast channel shared by every registered connection.
//!
//! Each connection gets its own receiver buffering up to `capacity` frames.
//! Frames carry the id of the connection that produced them so the
//! per-connection loop can skip its own traffic. Nothing is retained once
//! every receiver has seen a frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{now_millis, ParticipantId};

/// Origin id for frames the relay produces itself (departures).
pub const SYSTEM_ORIGIN: u64 = 0;

/// One frame on its way to the other connections.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedFrame {
    /// Connection that produced the frame, [`SYSTEM_ORIGIN`] for the relay
    pub origin: u64,
    /// The exact text to put on the wire
    pub text: String,
}

/// A registered connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEntry {
    pub conn_id: u64,
    pub addr: SocketAddr,
    /// Milliseconds since the Unix epoch
    pub connected_at: u64,
}

impl ConnectionEntry {
    pub fn new(conn_id: u64, addr: SocketAddr) -> Self {
        Self {
            conn_id,
            addr,
            connected_at: now_millis(),
        }
    }
}

/// Fan-out statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutStats {
    pub frames_relayed: u64,
    /// Frames skipped by receivers that fell more than `capacity` behind
    pub frames_lagged: u64,
}

/// Hot-path counters, updated without taking the registry lock.
#[derive(Default)]
struct AtomicFanoutStats {
    frames_relayed: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Registry of live connections plus the shared broadcast channel.
pub struct FanoutGroup {
    sender: broadcast::Sender<Arc<RelayedFrame>>,
    registry: RwLock<HashMap<ParticipantId, ConnectionEntry>>,
    next_conn_id: AtomicU64,
    atomic_stats: AtomicFanoutStats,
}

impl FanoutGroup {
    /// `capacity` bounds how far a slow connection may fall behind before it
    /// starts skipping frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            registry: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(SYSTEM_ORIGIN + 1),
            atomic_stats: AtomicFanoutStats::default(),
        }
    }

    /// Allocate an id for a freshly accepted connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `participant_id` on `entry` and return its receiver.
    ///
    /// A participant id maps to one connection. Registering an id that is
    /// already live replaces the old entry, which is returned; the old
    /// connection keeps running until it closes on its own.
    pub async fn register(
        &self,
        participant_id: ParticipantId,
        entry: ConnectionEntry,
    ) -> (broadcast::Receiver<Arc<RelayedFrame>>, Option<ConnectionEntry>) {
        let mut registry = self.registry.write().await;
        let replaced = registry.insert(participant_id, entry);
        (self.sender.subscribe(), replaced)
    }

    /// Remove `participant_id` only if it is still owned by `conn_id`.
    pub async fn unregister_if(&self, participant_id: &ParticipantId, conn_id: u64) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get(participant_id) {
            Some(entry) if entry.conn_id == conn_id => {
                registry.remove(participant_id);
                true
            }
            _ => false,
        }
    }

    /// Hand a frame to every receiver. Returns how many receivers saw it,
    /// the origin included; skipping the origin is the receiver's job.
    pub fn relay(&self, origin: u64, text: String) -> usize {
        let count = self
            .sender
            .send(Arc::new(RelayedFrame { origin, text }))
            .unwrap_or(0);
        self.atomic_stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Registered participant ids, sorted.
    pub async fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.registry.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_relayed: self.atomic_stats.frames_relayed.load(Ordering::Relaxed),
            frames_lagged: self.atomic_stats.frames_lagged.load(Ordering::Relaxed),
        }
    }
}
