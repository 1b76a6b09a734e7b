//! `PresenceHub`: the application-facing composition root.
//!
//! Wires the connection manager, presence tracker and event router together
//! and owns the background tasks that keep presence fresh:
//!
//! ```text
//!                     ┌──────────────────────── PresenceHub ───────────────────────┐
//! broadcast() ───────►│ EventRouter ──Outbound──► ConnectionManager ──ws──► relay  │
//! subscribe()         │     ▲                           │                          │
//!                     │     └──── inbound pump ◄── mpsc ┘                          │
//!                     │                                                           │
//!                     │ heartbeat task: watch(Connected) ─► announce local record │
//!                     │ prune task:     interval ─► PresenceTracker::prune_now     │
//!                     └───────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::{
    ConnectionManager, ConnectionState, LinkEvent, ReconnectPolicy, DEFAULT_SERVER_ADDR,
};
use crate::error::HubError;
use crate::presence::{
    PresenceRecord, PresenceTracker, Role, HEARTBEAT_INTERVAL, STALE_AFTER_MS,
};
use crate::protocol::{now_millis, EventType, NetworkEvent, ParticipantId};
use crate::router::{Delivery, EventRouter, Outbound, Subscription};

/// Environment variable overriding [`HubConfig::server_addr`].
pub const ENV_SERVER_ADDR: &str = "BEACON_SERVER_ADDR";
/// Environment variable overriding [`HubConfig::participant_id`].
pub const ENV_PARTICIPANT_ID: &str = "BEACON_PARTICIPANT_ID";

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Relay address, `host:port` or a `ws://` URL
    pub server_addr: String,
    /// Our identity for this session
    pub participant_id: ParticipantId,
    pub role: Role,
    pub display_color: Option<String>,
    pub active_context_id: Option<String>,
    pub policy: ReconnectPolicy,
    /// Period of presence announcements while connected
    pub heartbeat_interval: Duration,
    /// Period of the stale-record sweep
    pub prune_interval: Duration,
    /// Peers older than this are pruned
    pub stale_after_ms: u64,
    /// Inbound events buffered between the socket and the router
    pub inbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            participant_id: ParticipantId::generate(),
            role: Role::Human,
            display_color: None,
            active_context_id: None,
            policy: ReconnectPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            prune_interval: Duration::from_secs(5),
            stale_after_ms: STALE_AFTER_MS,
            inbound_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Defaults with `BEACON_SERVER_ADDR` / `BEACON_PARTICIPANT_ID` applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_SERVER_ADDR).filter(|s| !s.trim().is_empty()) {
            config.server_addr = addr.trim().to_string();
        }
        if let Some(id) = lookup(ENV_PARTICIPANT_ID).filter(|s| !s.trim().is_empty()) {
            config.participant_id = ParticipantId::new(id.trim());
        }
        config
    }

    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = addr.into();
        self
    }

    pub fn with_participant_id(mut self, id: impl Into<ParticipantId>) -> Self {
        self.participant_id = id.into();
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_display_color(mut self, color: impl Into<String>) -> Self {
        self.display_color = Some(color.into());
        self
    }

    fn local_record(&self) -> PresenceRecord {
        let mut record = PresenceRecord::new(self.participant_id.clone(), self.role, now_millis());
        record.display_color = self.display_color.clone();
        record.active_context_id = self.active_context_id.clone();
        record
    }
}

/// Background tasks owned by the hub.
#[derive(Default)]
struct HubTasks {
    /// Taken by the pump on first `connect()`.
    inbound: Option<mpsc::Receiver<NetworkEvent>>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    prune: Option<JoinHandle<()>>,
}

fn is_running(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

/// Presence-aware event hub for one participant.
///
/// Construct one per session and keep it for as long as the session lives.
/// Dropping the hub disconnects and cancels every background task.
pub struct PresenceHub {
    config: HubConfig,
    presence: Arc<Mutex<PresenceTracker>>,
    connection: Arc<ConnectionManager>,
    router: Arc<EventRouter>,
    tasks: Mutex<HubTasks>,
}

impl PresenceHub {
    pub fn new(config: HubConfig) -> Self {
        let presence = Arc::new(Mutex::new(PresenceTracker::with_threshold(
            config.local_record(),
            config.stale_after_ms,
        )));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let connection = Arc::new(ConnectionManager::new(config.policy.clone(), inbound_tx));
        let outbound: Arc<dyn Outbound> = connection.clone();
        let router = Arc::new(EventRouter::new(
            config.participant_id.clone(),
            outbound,
            presence.clone(),
        ));

        Self {
            config,
            presence,
            connection,
            router,
            tasks: Mutex::new(HubTasks {
                inbound: Some(inbound_rx),
                ..HubTasks::default()
            }),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HubTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect to the configured relay and start the heartbeat and prune
    /// tasks. Idempotent. Must be called from within a Tokio runtime.
    ///
    /// Never fails: an unreachable relay shows up as connection state and
    /// [`LinkEvent`]s while broadcasts keep working locally.
    pub fn connect(&self) {
        let mut tasks = self.tasks();

        if let Some(inbound) = tasks.inbound.take() {
            tasks.pump = Some(tokio::spawn(pump(self.router.clone(), inbound)));
        }

        self.connection
            .connect(&self.config.server_addr, self.config.participant_id.clone());

        if !is_running(&tasks.heartbeat) {
            tasks.heartbeat = Some(tokio::spawn(heartbeat(
                self.router.clone(),
                self.presence.clone(),
                self.connection.watch_state(),
                self.config.heartbeat_interval,
            )));
        }
        if !is_running(&tasks.prune) {
            tasks.prune = Some(tokio::spawn(prune(
                self.presence.clone(),
                self.config.prune_interval,
            )));
        }
    }

    /// Drop the link and stop the heartbeat and prune tasks together.
    ///
    /// The presence cache and subscribers are kept; a later `connect()`
    /// resumes with them.
    pub fn disconnect(&self) {
        let mut tasks = self.tasks();
        if let Some(h) = tasks.heartbeat.take() {
            h.abort();
        }
        if let Some(h) = tasks.prune.take() {
            h.abort();
        }
        self.connection.disconnect();
    }

    /// Broadcast to every other participant, or to ourselves when offline.
    pub fn broadcast(&self, event_type: EventType, payload: Value) -> Result<Delivery, HubError> {
        self.router.broadcast(event_type, payload)
    }

    /// Broadcast by wire tag. Unknown tags fail with
    /// [`HubError::UnsupportedEventType`] and deliver nothing.
    pub fn broadcast_tagged(&self, tag: &str, payload: Value) -> Result<Delivery, HubError> {
        self.router.broadcast_tagged(tag, payload)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.router.subscribe(callback)
    }

    /// Upsert a presence record. Our own record is announced right away;
    /// records for other participants only touch the local cache.
    pub fn update_presence(&self, record: PresenceRecord) -> Result<Option<Delivery>, HubError> {
        let announce = self
            .presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_presence(record);

        match announce {
            Some(record) => announce_record(&self.router, &record).map(Some),
            None => Ok(None),
        }
    }

    /// Move our presence to another context (layer, panel, document).
    pub fn set_active_context(&self, context_id: Option<String>) -> Result<Option<Delivery>, HubError> {
        let mut record = self.local_record();
        record.active_context_id = context_id;
        record.last_seen_timestamp = now_millis();
        self.update_presence(record)
    }

    /// Snapshot of every known participant, ourselves included.
    pub fn presence_list(&self) -> Vec<PresenceRecord> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner()).list()
    }

    pub fn presence_of(&self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(participant_id)
            .cloned()
    }

    pub fn local_record(&self) -> PresenceRecord {
        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local_record()
            .clone()
    }

    /// Run a prune pass now. Returns the ids that were dropped.
    pub fn prune_stale(&self) -> Vec<ParticipantId> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner()).prune_now()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Online/offline notifications, including retry exhaustion.
    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.connection.link_events()
    }

    /// Attempts made in the current reconnection cycle.
    pub fn connection_attempts(&self) -> u32 {
        self.connection.attempts()
    }

    pub fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.config.participant_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

impl Drop for PresenceHub {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in [tasks.heartbeat.take(), tasks.prune.take(), tasks.pump.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        self.connection.disconnect();
    }
}

fn announce_record(router: &EventRouter, record: &PresenceRecord) -> Result<Delivery, HubError> {
    let payload = serde_json::to_value(record)?;
    router.broadcast(EventType::PresenceUpdate, payload)
}

/// Feed inbound relay traffic to the router, one event at a time.
async fn pump(router: Arc<EventRouter>, mut inbound: mpsc::Receiver<NetworkEvent>) {
    while let Some(event) = inbound.recv().await {
        router.dispatch(&event);
    }
    log::debug!("Inbound pump stopped");
}

/// Announce the local record on every (re)connect and then once per period
/// for as long as the link stays up.
async fn heartbeat(
    router: Arc<EventRouter>,
    presence: Arc<Mutex<PresenceTracker>>,
    mut state: watch::Receiver<ConnectionState>,
    period: Duration,
) {
    loop {
        let linked = state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .is_ok();
        if !linked {
            return;
        }

        // First tick fires immediately: announce on connect.
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *state.borrow() != ConnectionState::Connected {
                        break;
                    }
                    let record = presence
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .refresh_local(now_millis());
                    if let Err(e) = announce_record(&router, &record) {
                        log::warn!("Heartbeat announcement failed: {e}");
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *state.borrow_and_update() != ConnectionState::Connected {
                        break;
                    }
                }
            }
        }
    }
}

async fn prune(presence: Arc<Mutex<PresenceTracker>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let pruned = presence.lock().unwrap_or_else(|e| e.into_inner()).prune_now();
        if !pruned.is_empty() {
            log::info!("Pruned {} stale participant(s)", pruned.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn offline_hub(id: &str) -> PresenceHub {
        PresenceHub::new(HubConfig::default().with_participant_id(id))
    }

    #[test]
    fn test_config_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.server_addr, "localhost:5000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.stale_after_ms, 30_000);
        assert_eq!(config.role, Role::Human);
        assert!(config.participant_id.as_str().starts_with("participant-"));
    }

    #[test]
    fn test_config_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SERVER_ADDR, "relay.internal:7000"),
            (ENV_PARTICIPANT_ID, " operator-1 "),
        ]);
        let config = HubConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.server_addr, "relay.internal:7000");
        assert_eq!(config.participant_id.as_str(), "operator-1");

        let blank = HubConfig::from_lookup(|_| Some(String::new()));
        assert_eq!(blank.server_addr, "localhost:5000");
    }

    #[test]
    fn test_offline_broadcast_loops_back() {
        let hub = offline_hub("A");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = hub.subscribe(move |ev| sink.lock().unwrap().push(ev.clone()));

        let delivery = hub
            .broadcast(EventType::StateSync, json!({"layer": 2, "status": "DONE"}))
            .unwrap();

        assert_eq!(delivery, Delivery::LoopedBack);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sender.as_str(), "A");
    }

    #[test]
    fn test_unknown_tag_delivers_nothing() {
        let hub = offline_hub("A");
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let _sub = hub.subscribe(move |_| *sink.lock().unwrap() += 1);

        let err = hub.broadcast_tagged("UNKNOWN_TYPE", json!({})).unwrap_err();
        assert_eq!(err, HubError::UnsupportedEventType("UNKNOWN_TYPE".into()));
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_update_presence_local_and_remote() {
        let hub = offline_hub("A");

        let remote = PresenceRecord::new("B".into(), Role::Agent, now_millis());
        assert_eq!(hub.update_presence(remote).unwrap(), None);
        assert!(hub.presence_of(&"B".into()).is_some());

        let local = PresenceRecord::new("A".into(), Role::Human, now_millis()).with_context("layer-1");
        assert_eq!(hub.update_presence(local).unwrap(), Some(Delivery::LoopedBack));
        assert_eq!(
            hub.local_record().active_context_id.as_deref(),
            Some("layer-1")
        );
        assert_eq!(hub.presence_list().len(), 2);
    }

    #[test]
    fn test_set_active_context() {
        let hub = offline_hub("A");
        hub.set_active_context(Some("layer-4".into())).unwrap();
        assert_eq!(hub.local_record().active_context_id.as_deref(), Some("layer-4"));
        hub.set_active_context(None).unwrap();
        assert!(hub.local_record().active_context_id.is_none());
    }

    #[test]
    fn test_prune_keeps_self() {
        let hub = offline_hub("A");
        hub.update_presence(PresenceRecord::new("B".into(), Role::Human, 1))
            .unwrap();
        assert_eq!(hub.prune_stale(), vec![ParticipantId::from("B")]);
        assert_eq!(hub.presence_list().len(), 1);
        assert_eq!(hub.presence_list()[0].participant_id.as_str(), "A");
    }

    #[tokio::test]
    async fn test_prune_timer_evicts_stale_peers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = HubConfig::default()
            .with_participant_id("A")
            .with_server_addr(addr);
        config.prune_interval = Duration::from_millis(20);
        let hub = PresenceHub::new(config);
        hub.update_presence(PresenceRecord::new("B".into(), Role::Human, 1))
            .unwrap();
        hub.update_presence(PresenceRecord::new("C".into(), Role::Agent, now_millis()))
            .unwrap();
        assert!(hub.presence_of(&"B".into()).is_some());

        hub.connect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(hub.presence_of(&"B".into()).is_none());
        assert!(hub.presence_of(&"C".into()).is_some());
        assert!(hub.presence_of(&"A".into()).is_some());
        hub.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_stops_background_tasks() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = HubConfig::default()
            .with_participant_id("A")
            .with_server_addr(addr);
        let hub = PresenceHub::new(config);

        hub.connect();
        assert_ne!(hub.connection_state(), ConnectionState::Connected);
        {
            let tasks = hub.tasks();
            assert!(is_running(&tasks.heartbeat));
            assert!(is_running(&tasks.prune));
        }

        hub.disconnect();
        assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
        let tasks = hub.tasks();
        assert!(tasks.heartbeat.is_none());
        assert!(tasks.prune.is_none());
        assert!(is_running(&tasks.pump));
    }
}
