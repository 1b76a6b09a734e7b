//! Presence tracking: a best-effort shared view of "who is here".
//!
//! ## Data flow
//!
//! ```text
//! local change / heartbeat tick
//!       │
//!       ▼
//! PresenceTracker::update_presence()  ── Some(record) ──► broadcast PRESENCE_UPDATE
//!
//! inbound PRESENCE_UPDATE (remote peer or relay departure)
//!       │
//!       ▼
//! PresenceTracker::observe()          ── cache only, never re-broadcast
//! ```
//!
//! Records are last-arrival-wins: an update always replaces the previous
//! record for that participant, regardless of the timestamps involved.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::protocol::{now_millis, EventType, NetworkEvent, ParticipantId, SYSTEM_SENDER};

/// A peer not refreshed within this window is dropped by the next prune pass.
pub const STALE_AFTER_MS: u64 = 30_000;

/// Interval between automatic presence announcements while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Kind of participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
}

/// Latest known liveness/location state for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: ParticipantId,
    pub role: Role,
    /// Sender clock, milliseconds since the Unix epoch.
    pub last_seen_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_color: Option<String>,
}

impl PresenceRecord {
    pub fn new(participant_id: ParticipantId, role: Role, last_seen_timestamp: u64) -> Self {
        Self {
            participant_id,
            role,
            last_seen_timestamp,
            active_context_id: None,
            display_color: None,
        }
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.active_context_id = Some(context_id.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.display_color = Some(color.into());
        self
    }

    /// Whether this record is older than `stale_after_ms` relative to `now`.
    pub fn is_stale(&self, now: u64, stale_after_ms: u64) -> bool {
        now.saturating_sub(self.last_seen_timestamp) > stale_after_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Offline,
}

/// Departure notice synthesized by the relay when a connection closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    pub participant_id: ParticipantId,
    pub status: PresenceStatus,
    pub timestamp: u64,
}

impl Departure {
    pub fn new(participant_id: ParticipantId, timestamp: u64) -> Self {
        Self {
            participant_id,
            status: PresenceStatus::Offline,
            timestamp,
        }
    }

    /// Wrap as a `PRESENCE_UPDATE` event sent by the relay itself.
    pub fn into_event(self) -> Result<NetworkEvent, HubError> {
        let timestamp = self.timestamp;
        let payload = serde_json::to_value(self)?;
        Ok(NetworkEvent::new(
            EventType::PresenceUpdate,
            payload,
            ParticipantId::from(SYSTEM_SENDER),
            timestamp,
        ))
    }
}

/// Shapes a `PRESENCE_UPDATE` payload may take on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PresenceUpdate {
    Departed(Departure),
    Record(PresenceRecord),
    Batch(Vec<PresenceRecord>),
}

impl PresenceUpdate {
    pub fn from_payload(payload: &Value) -> Result<Self, HubError> {
        Ok(PresenceUpdate::deserialize(payload)?)
    }
}

/// Owns the presence map for one hub.
///
/// The local participant's record is kept apart from the peer map so it can
/// never be pruned or overwritten by remote traffic.
#[derive(Debug)]
pub struct PresenceTracker {
    local: PresenceRecord,
    peers: HashMap<ParticipantId, PresenceRecord>,
    stale_after_ms: u64,
}

impl PresenceTracker {
    pub fn new(local: PresenceRecord) -> Self {
        Self::with_threshold(local, STALE_AFTER_MS)
    }

    pub fn with_threshold(local: PresenceRecord, stale_after_ms: u64) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            stale_after_ms,
        }
    }

    /// Upsert a record.
    ///
    /// Returns the record to broadcast when it belongs to the local
    /// participant; remote records only update the cache.
    pub fn update_presence(&mut self, record: PresenceRecord) -> Option<PresenceRecord> {
        if record.participant_id == self.local.participant_id {
            self.local = record;
            return Some(self.local.clone());
        }
        self.peers.insert(record.participant_id.clone(), record);
        None
    }

    /// Apply an inbound `PRESENCE_UPDATE` payload, then prune against `now`.
    ///
    /// Records naming the local participant are skipped: they are either our
    /// own loopback or a peer reusing our id, and neither may replace the
    /// self-view.
    pub fn observe(&mut self, payload: &Value, now: u64) -> Result<(), HubError> {
        match PresenceUpdate::from_payload(payload)? {
            PresenceUpdate::Departed(departure) => {
                if self.remove(&departure.participant_id).is_some() {
                    log::debug!("Presence: {} departed", departure.participant_id);
                }
            }
            PresenceUpdate::Record(record) => self.observe_record(record),
            PresenceUpdate::Batch(records) => {
                for record in records {
                    self.observe_record(record);
                }
            }
        }
        self.prune_stale(now);
        Ok(())
    }

    fn observe_record(&mut self, record: PresenceRecord) {
        if record.participant_id == self.local.participant_id {
            return;
        }
        self.peers.insert(record.participant_id.clone(), record);
    }

    /// Remove a peer immediately. The local record cannot be removed.
    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        self.peers.remove(participant_id)
    }

    /// Drop every peer not refreshed within the staleness window.
    pub fn prune_stale(&mut self, now: u64) -> Vec<ParticipantId> {
        let threshold = self.stale_after_ms;
        let stale: Vec<ParticipantId> = self
            .peers
            .values()
            .filter(|r| r.is_stale(now, threshold))
            .map(|r| r.participant_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
            log::debug!("Presence: pruned stale participant {id}");
        }
        stale
    }

    /// Bump the local record's liveness and return a copy for broadcasting.
    pub fn refresh_local(&mut self, now: u64) -> PresenceRecord {
        self.local.last_seen_timestamp = now;
        self.local.clone()
    }

    /// Snapshot of all records, local included, ordered by participant id.
    pub fn list(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = Vec::with_capacity(self.peers.len() + 1);
        records.push(self.local.clone());
        records.extend(self.peers.values().cloned());
        records.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        records
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<&PresenceRecord> {
        if *participant_id == self.local.participant_id {
            Some(&self.local)
        } else {
            self.peers.get(participant_id)
        }
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.get(participant_id).is_some()
    }

    /// Number of records, local included.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local.participant_id
    }

    pub fn local_record(&self) -> &PresenceRecord {
        &self.local
    }

    /// Prune against the wall clock.
    pub fn prune_now(&mut self) -> Vec<ParticipantId> {
        self.prune_stale(now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(PresenceRecord::new("me".into(), Role::Human, T0))
    }

    fn record(id: &str, ts: u64) -> PresenceRecord {
        PresenceRecord::new(id.into(), Role::Human, ts)
    }

    #[test]
    fn test_record_wire_shape() {
        let r = record("A", T0).with_context("layer-3").with_color("bg-blue-600");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["participantId"], "A");
        assert_eq!(v["role"], "human");
        assert_eq!(v["lastSeenTimestamp"], T0);
        assert_eq!(v["activeContextId"], "layer-3");
        assert_eq!(v["displayColor"], "bg-blue-600");

        let bare = serde_json::to_value(record("B", T0)).unwrap();
        assert!(bare.get("activeContextId").is_none());
    }

    #[test]
    fn test_new_tracker_holds_self() {
        let t = tracker();
        assert_eq!(t.len(), 1);
        assert_eq!(t.local_id().as_str(), "me");
        assert!(t.contains(&"me".into()));
    }

    #[test]
    fn test_update_local_returns_broadcast() {
        let mut t = tracker();
        let out = t.update_presence(record("me", T0 + 5).with_context("ctx"));
        let out = out.expect("local update must be broadcast");
        assert_eq!(out.active_context_id.as_deref(), Some("ctx"));
        assert_eq!(t.local_record().last_seen_timestamp, T0 + 5);
    }

    #[test]
    fn test_update_remote_never_broadcasts() {
        let mut t = tracker();
        assert!(t.update_presence(record("A", T0)).is_none());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_last_arrival_wins() {
        let mut t = tracker();
        // Arrival order, not timestamp order, decides.
        t.update_presence(record("A", T0 + 100).with_context("first"));
        t.update_presence(record("A", T0 + 50).with_context("second"));
        t.update_presence(record("A", T0 + 10).with_context("third"));

        let list = t.list();
        let a: Vec<_> = list.iter().filter(|r| r.participant_id.as_str() == "A").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].active_context_id.as_deref(), Some("third"));
        assert_eq!(a[0].last_seen_timestamp, T0 + 10);
    }

    #[test]
    fn test_prune_boundary() {
        let mut t = tracker();
        t.update_presence(record("A", T0));

        // Exactly 30s old: still present.
        assert!(t.prune_stale(T0 + 30_000).is_empty());
        assert!(t.contains(&"A".into()));

        // 30.001s old: gone.
        let pruned = t.prune_stale(T0 + 30_001);
        assert_eq!(pruned, vec![ParticipantId::from("A")]);
        assert!(!t.contains(&"A".into()));
    }

    #[test]
    fn test_prune_never_drops_self() {
        let mut t = tracker();
        let pruned = t.prune_stale(T0 + 10 * STALE_AFTER_MS);
        assert!(pruned.is_empty());
        assert!(t.contains(&"me".into()));
    }

    #[test]
    fn test_prune_keeps_future_timestamps() {
        let mut t = tracker();
        t.update_presence(record("A", T0 + 60_000));
        assert!(t.prune_stale(T0).is_empty());
    }

    #[test]
    fn test_observe_record() {
        let mut t = tracker();
        let payload = serde_json::to_value(record("A", T0)).unwrap();
        t.observe(&payload, T0).unwrap();
        assert!(t.contains(&"A".into()));
    }

    #[test]
    fn test_observe_batch() {
        let mut t = tracker();
        let payload = json!([
            {"participantId": "A", "role": "human", "lastSeenTimestamp": T0},
            {"participantId": "B", "role": "agent", "lastSeenTimestamp": T0},
        ]);
        t.observe(&payload, T0).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(&"B".into()).unwrap().role, Role::Agent);
    }

    #[test]
    fn test_observe_departure_removes_immediately() {
        let mut t = tracker();
        t.update_presence(record("A", T0));
        let payload = json!({"participantId": "A", "status": "offline", "timestamp": T0 + 1});
        t.observe(&payload, T0 + 1).unwrap();
        assert!(!t.contains(&"A".into()));
    }

    #[test]
    fn test_observe_departure_of_self_ignored() {
        let mut t = tracker();
        let payload = serde_json::to_value(Departure::new("me".into(), T0)).unwrap();
        t.observe(&payload, T0).unwrap();
        assert!(t.contains(&"me".into()));
    }

    #[test]
    fn test_observe_self_record_does_not_replace_local() {
        let mut t = tracker();
        let imposter = record("me", T0 + 9).with_context("elsewhere");
        t.observe(&serde_json::to_value(imposter).unwrap(), T0).unwrap();
        assert!(t.local_record().active_context_id.is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_observe_prunes_stale_peers() {
        let mut t = tracker();
        t.update_presence(record("old", T0));
        let fresh = serde_json::to_value(record("new", T0 + 40_000)).unwrap();
        t.observe(&fresh, T0 + 40_000).unwrap();
        assert!(!t.contains(&"old".into()));
        assert!(t.contains(&"new".into()));
    }

    #[test]
    fn test_observe_malformed_payload() {
        let mut t = tracker();
        let err = t.observe(&json!({"layer": 2}), T0).unwrap_err();
        assert!(matches!(err, HubError::Serialization(_)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_departure_event() {
        let ev = Departure::new("A".into(), T0).into_event().unwrap();
        assert_eq!(ev.event_type, EventType::PresenceUpdate);
        assert_eq!(ev.sender.as_str(), SYSTEM_SENDER);
        assert_eq!(ev.payload["status"], "offline");
        assert_eq!(ev.payload["participantId"], "A");
    }

    #[test]
    fn test_refresh_local() {
        let mut t = tracker();
        let r = t.refresh_local(T0 + 10_000);
        assert_eq!(r.last_seen_timestamp, T0 + 10_000);
        assert_eq!(t.local_record().last_seen_timestamp, T0 + 10_000);
    }

    #[test]
    fn test_list_is_snapshot() {
        let mut t = tracker();
        t.update_presence(record("A", T0));
        let snapshot = t.list();
        t.remove(&"A".into());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(t.list().len(), 1);
    }
}
