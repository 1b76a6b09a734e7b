//! Connection manager: one WebSocket link to the relay per hub.
//!
//! Provides:
//! - Bounded reconnection (fixed delay, per-attempt timeout, attempt cap)
//! - Hello/welcome handshake carrying only the participant id
//! - Fire-and-forget sends; nothing is queued while disconnected
//! - State published on a `watch` channel, lifecycle events on a `broadcast`
//!
//! ```text
//! connect() ──► supervisor task
//!                 │  attempt n: dial ─► hello ─► welcome   (≤ connect_timeout)
//!                 │     ok  ─► session loop (outgoing queue ⇄ socket ⇄ inbound)
//!                 │     err ─► sleep(retry_delay), n += 1
//!                 └── n == max_attempts ─► Exhausted, task ends
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::HubError;
use crate::protocol::{Frame, NetworkEvent, ParticipantId};
use crate::router::{Outbound, SendOutcome};

/// Relay address used when nothing else is configured.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:5000";

/// Frames buffered between `send()` and the socket writer.
const OUTGOING_CAPACITY: usize = 256;

/// Lifecycle events buffered per subscriber.
const LINK_EVENT_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Link state as seen by the rest of the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications for the application (online/offline indicator).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// Retry budget spent. No further attempts until `connect()` is called.
    Exhausted { attempts: u32 },
}

impl LinkEvent {
    /// The error condition this event reports, if any.
    pub fn as_error(&self) -> Option<HubError> {
        match self {
            LinkEvent::Exhausted { attempts } => Some(HubError::ConnectionExhausted {
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

/// Bounded reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Budget for one attempt: TCP connect, upgrade and handshake
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Outgoing queue of the live session, tagged with the epoch that owns it.
///
/// `disconnect()` bumps the epoch, so a supervisor that is still finishing
/// its last poll cannot resurrect the link afterwards.
struct Slot {
    epoch: u64,
    outgoing: Option<mpsc::Sender<String>>,
    /// Set by `connect()`, cleared by `disconnect()` or when retries run out.
    active: bool,
    /// `connect()` arrived while a retry cycle was still running.
    rearmed: bool,
}

/// What the supervisor should do once its retry budget is spent.
#[derive(Debug, PartialEq)]
enum Retirement {
    /// The link was torn down or restarted under a newer epoch.
    Stale,
    /// A `connect()` came in during the cycle; start over with a fresh budget.
    Rearmed,
    Retired,
}

struct LinkShared {
    policy: ReconnectPolicy,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
    inbound: mpsc::Sender<NetworkEvent>,
    attempts: AtomicU32,
}

impl LinkShared {
    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LinkEvent) {
        // No receivers is fine; the application may not be listening.
        let _ = self.events.send(event);
    }

    /// Change state only while `epoch` still owns the link.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let slot = self.slot();
        if slot.epoch != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn install(&self, epoch: u64, outgoing: mpsc::Sender<String>) -> bool {
        let mut slot = self.slot();
        if slot.epoch != epoch {
            return false;
        }
        slot.outgoing = Some(outgoing);
        slot.rearmed = false;
        self.state.send_replace(ConnectionState::Connected);
        true
    }

    /// Give up on the link (retry budget spent), unless `connect()` asked
    /// for another cycle in the meantime.
    fn retire(&self, epoch: u64) -> Retirement {
        let mut slot = self.slot();
        if slot.epoch != epoch {
            return Retirement::Stale;
        }
        if std::mem::take(&mut slot.rearmed) {
            self.attempts.store(0, Ordering::SeqCst);
            return Retirement::Rearmed;
        }
        slot.active = false;
        self.state.send_replace(ConnectionState::Disconnected);
        Retirement::Retired
    }

    fn uninstall(&self, epoch: u64) -> bool {
        let mut slot = self.slot();
        if slot.epoch != epoch {
            return false;
        }
        slot.outgoing = None;
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }
}

/// Owns the transport handle and the reconnection task.
pub struct ConnectionManager {
    shared: Arc<LinkShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Inbound events from the relay are pushed onto `inbound` in arrival order.
    pub fn new(policy: ReconnectPolicy, inbound: mpsc::Sender<NetworkEvent>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        Self {
            shared: Arc::new(LinkShared {
                policy,
                slot: Mutex::new(Slot {
                    epoch: 0,
                    outgoing: None,
                    active: false,
                    rearmed: false,
                }),
                state,
                events,
                inbound,
                attempts: AtomicU32::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start connecting. Never spawns a second dialer: while connected this
    /// is a no-op, and while a retry cycle is running it only guarantees a
    /// fresh budget should the current one run out.
    ///
    /// Must be called from within a Tokio runtime. Network failures are never
    /// returned; they show up as state changes and, once the retry budget is
    /// spent, as [`LinkEvent::Exhausted`].
    pub fn connect(&self, server_addr: &str, participant_id: ParticipantId) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = {
            let mut slot = self.shared.slot();
            if slot.active {
                if *self.shared.state.borrow() == ConnectionState::Connected {
                    log::debug!("connect() ignored: already linked to relay");
                } else {
                    slot.rearmed = true;
                    log::debug!("connect() during retries: budget renews if this cycle runs out");
                }
                return;
            }
            slot.active = true;
            slot.rearmed = false;
            self.shared.attempts.store(0, Ordering::SeqCst);
            self.shared.state.send_replace(ConnectionState::Connecting);
            slot.epoch
        };
        if let Some(stale) = supervisor.take() {
            stale.abort();
        }

        let url = ws_url(server_addr);
        log::info!("Connecting to relay {url} as {participant_id}");
        let shared = self.shared.clone();
        *supervisor = Some(tokio::spawn(supervise(shared, epoch, url, participant_id)));
    }

    /// Tear the link down: abort the supervisor, drop the socket and the
    /// outgoing queue. Safe to call in any state.
    pub fn disconnect(&self) {
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let previous = {
            let mut slot = self.shared.slot();
            slot.epoch += 1;
            slot.outgoing = None;
            slot.active = false;
            slot.rearmed = false;
            self.shared.state.send_replace(ConnectionState::Disconnected)
        };

        if previous == ConnectionState::Connected {
            log::info!("Disconnected from relay");
            self.shared.emit(LinkEvent::Disconnected);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Attempts made in the current retry cycle.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Whether the link is connecting, connected or waiting to retry.
    pub fn is_active(&self) -> bool {
        self.shared.slot().active
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }
}

impl Outbound for ConnectionManager {
    /// Queue an event on the live session. Never queues while offline.
    fn send(&self, event: &NetworkEvent) -> Result<SendOutcome, HubError> {
        let text = Frame::Event(event.clone()).encode()?;

        let slot = self.shared.slot();
        let Some(outgoing) = slot.outgoing.as_ref() else {
            return Ok(SendOutcome::NotConnected);
        };
        if *self.shared.state.borrow() != ConnectionState::Connected {
            return Ok(SendOutcome::NotConnected);
        }

        match outgoing.try_send(text) {
            Ok(()) => Ok(SendOutcome::Transmitted),
            Err(TrySendError::Full(_)) => Ok(SendOutcome::Dropped),
            Err(TrySendError::Closed(_)) => Ok(SendOutcome::NotConnected),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Normalize a configured address into a WebSocket URL.
pub fn ws_url(server_addr: &str) -> String {
    if server_addr.starts_with("ws://") || server_addr.starts_with("wss://") {
        server_addr.to_string()
    } else if let Some(rest) = server_addr.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = server_addr.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        format!("ws://{server_addr}")
    }
}

async fn supervise(shared: Arc<LinkShared>, epoch: u64, url: String, participant_id: ParticipantId) {
    let policy = shared.policy.clone();
    let max_attempts = policy.max_attempts.max(1);

    loop {
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !shared.transition(epoch, ConnectionState::Connecting) {
            return;
        }

        let dialed = tokio::time::timeout(policy.connect_timeout, dial(&url, &participant_id))
            .await
            .unwrap_or(Err(HubError::Timeout));

        match dialed {
            Ok(ws) => {
                shared.attempts.store(0, Ordering::SeqCst);
                log::info!("Linked to relay {url} as {participant_id}");
                match run_session(&shared, epoch, ws).await {
                    Ok(()) => log::warn!("Relay {url} closed the link"),
                    Err(e) => log::warn!("Link to {url} lost: {e}"),
                }
            }
            Err(e) => {
                log::warn!("Connection attempt {attempt}/{max_attempts} to {url} failed: {e}");
                if attempt >= max_attempts {
                    match shared.retire(epoch) {
                        Retirement::Stale => return,
                        Retirement::Rearmed => {
                            log::info!("Retry budget spent, connect() requested meanwhile; retrying {url}");
                        }
                        Retirement::Retired => {
                            let err = HubError::ConnectionExhausted { attempts: attempt };
                            log::error!("{err}; staying offline until connect() is called again");
                            shared.emit(LinkEvent::Exhausted { attempts: attempt });
                            return;
                        }
                    }
                }
                if !shared.transition(epoch, ConnectionState::Disconnected) {
                    return;
                }
            }
        }

        tokio::time::sleep(policy.retry_delay).await;
    }
}

/// Open the socket and complete the hello/welcome handshake.
async fn dial(url: &str, participant_id: &ParticipantId) -> Result<WsStream, HubError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    let hello = Frame::hello(participant_id.clone()).encode()?;
    ws.send(Message::text(hello)).await?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return match Frame::decode(text.as_str())? {
                    Frame::Welcome { .. } => Ok(ws),
                    other => Err(HubError::Handshake(format!("expected welcome, got {other:?}"))),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(HubError::Handshake("relay closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Pump one established session until it ends.
async fn run_session(shared: &LinkShared, epoch: u64, ws: WsStream) -> Result<(), HubError> {
    let (mut writer, mut reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);

    if !shared.install(epoch, out_tx) {
        return Ok(());
    }
    shared.emit(LinkEvent::Connected);

    let result = loop {
        tokio::select! {
            Some(text) = out_rx.recv() => {
                if let Err(e) = writer.send(Message::text(text)).await {
                    break Err(HubError::from(e));
                }
            }
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                    Ok(Frame::Event(event)) => {
                        if shared.inbound.send(event).await.is_err() {
                            // Hub is gone.
                            break Ok(());
                        }
                    }
                    Ok(other) => log::debug!("Ignoring mid-session frame {other:?}"),
                    Err(e) => log::warn!("Dropping undecodable frame from relay: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(HubError::from(e)),
            }
        }
    };

    if shared.uninstall(epoch) {
        shared.emit(LinkEvent::Disconnected);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use serde_json::json;
    use tokio::time::timeout;

    fn manager(policy: ReconnectPolicy) -> (ConnectionManager, mpsc::Receiver<NetworkEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionManager::new(policy, tx), rx)
    }

    fn fast_policy(delay_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 10,
            retry_delay: Duration::from_millis(delay_ms),
            connect_timeout: Duration::from_millis(500),
        }
    }

    /// Address with nothing listening on it.
    async fn dead_addr() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn wait_exhausted(events: &mut broadcast::Receiver<LinkEvent>) -> u32 {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(LinkEvent::Exhausted { attempts })) => return attempts,
                Ok(Ok(_)) => continue,
                other => panic!("expected Exhausted, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_policy_defaults() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.max_attempts, 10);
        assert_eq!(p.retry_delay, Duration::from_secs(2));
        assert_eq!(p.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("localhost:5000"), "ws://localhost:5000");
        assert_eq!(ws_url("ws://relay:1"), "ws://relay:1");
        assert_eq!(ws_url("wss://relay:1"), "wss://relay:1");
        assert_eq!(ws_url("http://relay:1"), "ws://relay:1");
        assert_eq!(ws_url("https://relay:1"), "wss://relay:1");
    }

    #[test]
    fn test_exhausted_event_maps_to_error() {
        let ev = LinkEvent::Exhausted { attempts: 10 };
        assert_eq!(ev.as_error(), Some(HubError::ConnectionExhausted { attempts: 10 }));
        assert_eq!(LinkEvent::Connected.as_error(), None);
    }

    #[tokio::test]
    async fn test_initial_state_and_offline_send() {
        let (mgr, _rx) = manager(ReconnectPolicy::default());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.is_active());

        let event = NetworkEvent::now(EventType::StateSync, json!({}), "A".into());
        assert_eq!(mgr.send(&event).unwrap(), SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let addr = dead_addr().await;
        let (mgr, _rx) = manager(fast_policy(10));
        let mut events = mgr.link_events();

        mgr.connect(&addr, "A".into());
        let attempts = wait_exhausted(&mut events).await;

        assert_eq!(attempts, 10);
        assert_eq!(mgr.attempts(), 10);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        // No 11th attempt.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(mgr.attempts(), 10);
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn test_explicit_connect_resets_counter() {
        let addr = dead_addr().await;
        let (mgr, _rx) = manager(fast_policy(5));
        let mut events = mgr.link_events();

        mgr.connect(&addr, "A".into());
        assert_eq!(wait_exhausted(&mut events).await, 10);

        mgr.connect(&addr, "A".into());
        assert_eq!(wait_exhausted(&mut events).await, 10);
        assert_eq!(mgr.attempts(), 10);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let addr = dead_addr().await;
        let (mgr, _rx) = manager(fast_policy(1_000));

        mgr.connect(&addr, "A".into());
        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.connect(&addr, "A".into());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Second call did not restart the cycle or spawn a second dialer.
        assert_eq!(mgr.attempts(), 1);
        assert!(mgr.is_active());
        mgr.disconnect();
    }

    #[tokio::test]
    async fn test_connect_during_last_attempt_is_not_lost() {
        // Accepts TCP but never answers the upgrade, so every attempt times out.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dials = Arc::new(AtomicU32::new(0));
        let counted = dials.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counted.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let (mgr, _rx) = manager(ReconnectPolicy {
            max_attempts: 1,
            retry_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(300),
        });
        let mut events = mgr.link_events();

        mgr.connect(&addr, "A".into());
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The only attempt is still in flight and about to give up.
        mgr.connect(&addr, "A".into());

        assert_eq!(wait_exhausted(&mut events).await, 1);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(!mgr.is_active());
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_retries() {
        let addr = dead_addr().await;
        let (mgr, _rx) = manager(fast_policy(50));

        mgr.connect(&addr, "A".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.disconnect();
        let frozen = mgr.attempts();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.attempts(), frozen);
        assert!(!mgr.is_active());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }
}
