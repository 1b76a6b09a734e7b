//! JSON wire protocol shared by hubs and the relay.
//!
//! Every WebSocket text message is one [`Frame`], tagged by `op`:
//!
//! ```text
//! {"op":"hello","participantId":"A"}                      client → relay, first frame
//! {"op":"welcome","participantId":"A"}                    relay → client, after registration
//! {"op":"event","type":"STATE_SYNC","payload":{..},
//!  "sender":"A","timestamp":1700000000000}                both directions
//! ```
//!
//! The event envelope is exactly `{type, payload, sender, timestamp}`. The relay
//! forwards the received text untouched, so it never adds or strips fields.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HubError;

/// Sender id used for events the relay originates itself.
pub const SYSTEM_SENDER: &str = "system";

/// Opaque participant identifier, unique per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a new client session.
    pub fn generate() -> Self {
        Self(format!("participant-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The closed set of event kinds the hub routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Participant liveness / location. Feeds the presence tracker.
    PresenceUpdate,
    /// Free-form collaboration traffic between participants and agents
    CollaborationMessage,
    Suggestion,
    /// Shared simulation state (layer progress and similar)
    StateSync,
    SystemMessage,
    /// Raised by credential validation; the relay journals these.
    SecurityEvent,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::PresenceUpdate,
        EventType::CollaborationMessage,
        EventType::Suggestion,
        EventType::StateSync,
        EventType::SystemMessage,
        EventType::SecurityEvent,
    ];

    /// Wire tag for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PresenceUpdate => "PRESENCE_UPDATE",
            EventType::CollaborationMessage => "COLLABORATION_MESSAGE",
            EventType::Suggestion => "SUGGESTION",
            EventType::StateSync => "STATE_SYNC",
            EventType::SystemMessage => "SYSTEM_MESSAGE",
            EventType::SecurityEvent => "SECURITY_EVENT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = HubError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| HubError::UnsupportedEventType(tag.to_string()))
    }
}

/// A typed event with an opaque payload.
///
/// The payload shape belongs to whoever consumes the event type; the hub and
/// the relay never validate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    pub sender: ParticipantId,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    pub timestamp: u64,
}

impl NetworkEvent {
    pub fn new(event_type: EventType, payload: Value, sender: ParticipantId, timestamp: u64) -> Self {
        Self {
            event_type,
            payload,
            sender,
            timestamp,
        }
    }

    /// Stamp an event with the current time.
    pub fn now(event_type: EventType, payload: Value, sender: ParticipantId) -> Self {
        Self::new(event_type, payload, sender, now_millis())
    }

    pub fn is_presence(&self) -> bool {
        self.event_type == EventType::PresenceUpdate
    }
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake: carries only the participant id, no secret.
    Hello {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },
    /// Relay acknowledgement, sent once the connection is registered.
    Welcome {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },
    Event(NetworkEvent),
}

impl Frame {
    pub fn hello(participant_id: ParticipantId) -> Self {
        Frame::Hello { participant_id }
    }

    pub fn welcome(participant_id: ParticipantId) -> Self {
        Frame::Welcome { participant_id }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame. Unknown event types are rejected here.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
