//! Typed pub/sub with transport bridging.
//!
//! ```text
//! broadcast(type, payload)
//!       │
//!       ▼
//! Outbound::send ── Transmitted ──► relay (peers receive it, we do not)
//!       │
//!       └── NotConnected ──► dispatch() locally   (offline loopback)
//!
//! inbound event ──► dispatch()
//!                     ├── PRESENCE_UPDATE → PresenceTracker::observe
//!                     └── every subscriber, registration order
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;

use crate::error::HubError;
use crate::presence::PresenceTracker;
use crate::protocol::{now_millis, EventType, NetworkEvent, ParticipantId};

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Result of handing an event to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on a live connection.
    Transmitted,
    /// No live connection. Nothing was queued.
    NotConnected,
    /// Live connection, but its outgoing queue was full.
    Dropped,
}

/// The transport side of the router.
pub trait Outbound: Send + Sync {
    fn send(&self, event: &NetworkEvent) -> Result<SendOutcome, HubError>;
}

/// How a broadcast was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the relay for fan-out to the other participants.
    Relayed,
    /// Offline: delivered to our own subscribers only.
    LoopedBack,
    /// Lost to backpressure on the outgoing queue.
    Dropped,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Handle returned by [`EventRouter::subscribe`].
///
/// Dropping the handle keeps the subscription; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    id: u64,
    list: Weak<RwLock<SubscriberList>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(list) = self.list.upgrade() else {
            return false;
        };
        let mut list = list.write().unwrap_or_else(|e| e.into_inner());
        let before = list.entries.len();
        list.entries.retain(|(id, _)| *id != self.id);
        list.entries.len() != before
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Routes events between the application, the presence tracker and the
/// transport.
pub struct EventRouter {
    local_id: ParticipantId,
    outbound: Arc<dyn Outbound>,
    presence: Arc<Mutex<PresenceTracker>>,
    subscribers: Arc<RwLock<SubscriberList>>,
}

impl EventRouter {
    pub fn new(
        local_id: ParticipantId,
        outbound: Arc<dyn Outbound>,
        presence: Arc<Mutex<PresenceTracker>>,
    ) -> Self {
        Self {
            local_id,
            outbound,
            presence,
            subscribers: Arc::new(RwLock::new(SubscriberList::default())),
        }
    }

    /// Register a callback for every dispatched event.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let mut list = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        list.next_id += 1;
        let id = list.next_id;
        list.entries.push((id, Arc::new(callback)));
        Subscription {
            id,
            list: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Broadcast an event stamped with our id and the current time.
    ///
    /// Transport failures are never returned here; when there is no live
    /// connection the event is delivered to our own subscribers instead.
    pub fn broadcast(&self, event_type: EventType, payload: Value) -> Result<Delivery, HubError> {
        let event = NetworkEvent::new(event_type, payload, self.local_id.clone(), now_millis());

        match self.outbound.send(&event)? {
            SendOutcome::Transmitted => Ok(Delivery::Relayed),
            SendOutcome::NotConnected => {
                log::debug!("Offline: looping {} back to local subscribers", event.event_type);
                self.dispatch(&event);
                Ok(Delivery::LoopedBack)
            }
            SendOutcome::Dropped => {
                log::warn!("Outgoing queue full, dropped {}", event.event_type);
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Broadcast by wire tag. Unknown tags fail before anything is delivered.
    pub fn broadcast_tagged(&self, tag: &str, payload: Value) -> Result<Delivery, HubError> {
        let event_type: EventType = tag.parse()?;
        self.broadcast(event_type, payload)
    }

    /// Deliver an event locally. Returns how many subscribers completed.
    ///
    /// Presence updates reach the tracker before any subscriber, whether or
    /// not anyone is subscribed.
    pub fn dispatch(&self, event: &NetworkEvent) -> usize {
        if event.is_presence() {
            let mut presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = presence.observe(&event.payload, now_millis()) {
                log::warn!("Ignoring presence payload from {}: {e}", event.sender);
            }
        }

        // Snapshot so callbacks run without the list locked.
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let fault = HubError::SubscriberFault(panic_message(panic.as_ref()));
                    log::error!("{fault} (event {} from {})", event.event_type, event.sender);
                }
            }
        }
        delivered
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "subscriber panicked".to_string()
    }
}
