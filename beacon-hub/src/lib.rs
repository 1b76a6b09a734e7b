//! # beacon-hub: presence-aware event relay
//!
//! Keeps a set of collaborating clients in sync: who is here, and what they
//! just did. Clients run a [`PresenceHub`]; a [`RelayServer`] fans their
//! events out to everybody else.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ PresenceHub  │ ◄────────────────► │ RelayServer  │
//! │ (per client) │     JSON frames    │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ EventRouter  │                    │ FanoutGroup  │
//! │ + Presence   │                    │ (registry +  │
//! │   Tracker    │                    │  broadcast)  │
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! When the relay cannot be reached the hub keeps working locally: every
//! broadcast is looped back to the local subscribers instead.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and the closed set of event types
//! - [`connection`]: WebSocket link with bounded reconnection
//! - [`presence`]: presence records, staleness and departures
//! - [`router`]: typed pub/sub with offline loopback
//! - [`hub`]: the client-side composition root
//! - [`broadcast`]: relay fan-out with backpressure
//! - [`server`]: the relay itself
//! - [`error`]: error types

pub mod broadcast;
pub mod connection;
pub mod error;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;

// Re-exports for convenience
pub use broadcast::{FanoutGroup, FanoutStats};
pub use connection::{ConnectionManager, ConnectionState, LinkEvent, ReconnectPolicy};
pub use error::{HubError, RelayError};
pub use hub::{HubConfig, PresenceHub};
pub use presence::{Departure, PresenceRecord, PresenceTracker, Role};
pub use protocol::{EventType, Frame, NetworkEvent, ParticipantId};
pub use router::{Delivery, EventRouter, Subscription};
pub use server::{RelayConfig, RelayServer, RelayStats};
