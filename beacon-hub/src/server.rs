//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌──► Client B
//!             ├── hello ─► FanoutGroup ─┤
//! Client B ──┘   (registry + broadcast) └──► Client C
//! ```
//!
//! Per connection:
//! 1. first text frame must be `hello` within `handshake_timeout`
//! 2. the participant is registered, then `welcome` is sent back
//! 3. every decodable event is forwarded verbatim to all other connections
//! 4. on close, a departure `PRESENCE_UPDATE` from `system` goes to the rest,
//!    unless a newer connection has taken over the participant id
//!
//! The relay stores nothing: a late joiner sees only what is sent after it
//! registers. Shutting down aborts every connection task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionEntry, FanoutGroup, RelayedFrame, SYSTEM_ORIGIN};
use crate::error::RelayError;
use crate::presence::Departure;
use crate::protocol::{now_millis, EventType, Frame, ParticipantId};

/// Environment variable overriding the full bind address.
pub const ENV_RELAY_ADDR: &str = "BEACON_RELAY_ADDR";
/// Environment variable selecting a port on all interfaces.
pub const ENV_PORT: &str = "PORT";

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it starts skipping
    pub broadcast_capacity: usize,
    /// How long a new connection has to send its hello
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            broadcast_capacity: 256,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Defaults with `BEACON_RELAY_ADDR`, or failing that `PORT`, applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_RELAY_ADDR).filter(|s| !s.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        } else if let Some(port) = lookup(ENV_PORT).and_then(|p| p.trim().parse::<u16>().ok()) {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub relayed_events: u64,
    pub departures: u64,
    pub rejected_frames: u64,
    /// Frames skipped by connections that fell behind the fan-out buffer
    pub lagged_frames: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    relayed_events: AtomicU64,
    departures: AtomicU64,
    rejected_frames: AtomicU64,
}

/// State shared by the accept loop and every connection task.
struct RelayShared {
    config: RelayConfig,
    fanout: FanoutGroup,
    stats: AtomicRelayStats,
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let fanout = FanoutGroup::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(RelayShared {
                config,
                fanout,
                stats: AtomicRelayStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` completes.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Relay listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Relay shutting down, closing {} connection(s)", connections.len());
                    connections.shutdown().await;
                    return Ok(());
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let shared = self.shared.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Snapshot of the relay counters.
    pub fn stats(&self) -> RelayStats {
        let s = &self.shared.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            relayed_events: s.relayed_events.load(Ordering::Relaxed),
            departures: s.departures.load(Ordering::Relaxed),
            rejected_frames: s.rejected_frames.load(Ordering::Relaxed),
            lagged_frames: self.shared.fanout.stats().frames_lagged,
        }
    }

    /// Participants currently registered, sorted.
    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.shared.fanout.participants().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<RelayShared>,
) -> Result<(), RelayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveConnection::enter(&shared.stats.active_connections);
    serve_peer(ws, addr, &shared).await
}

/// Holds one slot of `active_connections`; released even if the task is
/// aborted on shutdown.
struct ActiveConnection<'a>(&'a AtomicU64);

impl<'a> ActiveConnection<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn serve_peer(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    shared: &RelayShared,
) -> Result<(), RelayError> {
    let (mut writer, mut reader) = ws.split();

    let participant_id = match tokio::time::timeout(
        shared.config.handshake_timeout,
        read_hello(&mut reader),
    )
    .await
    {
        Ok(Ok(id)) => id,
        Ok(Err(reason)) => {
            return Err(RelayError::Handshake {
                addr: addr.to_string(),
                reason,
            })
        }
        Err(_) => {
            return Err(RelayError::Handshake {
                addr: addr.to_string(),
                reason: "no hello within handshake timeout".into(),
            })
        }
    };

    let conn_id = shared.fanout.next_conn_id();
    let (mut relayed, replaced) = shared
        .fanout
        .register(participant_id.clone(), ConnectionEntry::new(conn_id, addr))
        .await;
    if let Some(previous) = replaced {
        log::warn!(
            "Participant {participant_id} re-registered from {addr}, superseding connection from {}",
            previous.addr
        );
    }
    log::info!("Participant {participant_id} joined from {addr}");

    let result = relay_loop(
        &mut writer,
        &mut reader,
        &mut relayed,
        conn_id,
        &participant_id,
        shared,
    )
    .await;

    depart(shared, &participant_id, conn_id).await;
    result
}

/// Wait for the opening hello. Errors are plain reasons for the log.
async fn read_hello(reader: &mut WsReader) -> Result<ParticipantId, String> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                return match Frame::decode(text.as_str()) {
                    Ok(Frame::Hello { participant_id }) => Ok(participant_id),
                    Ok(other) => Err(format!("expected hello, got {other:?}")),
                    Err(e) => Err(e.to_string()),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err("closed before hello".into()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.to_string()),
        }
    }
}

async fn relay_loop(
    writer: &mut WsWriter,
    reader: &mut WsReader,
    relayed: &mut Receiver<Arc<RelayedFrame>>,
    conn_id: u64,
    participant_id: &ParticipantId,
    shared: &RelayShared,
) -> Result<(), RelayError> {
    let welcome = Frame::welcome(participant_id.clone()).encode()?;
    writer.send(Message::text(welcome)).await?;

    loop {
        tokio::select! {
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => forward(shared, conn_id, participant_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed by {participant_id}");
                    return Ok(());
                }
                Some(Ok(Message::Binary(_))) => {
                    shared.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropping binary frame from {participant_id}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {participant_id}: {e}");
                    return Ok(());
                }
            },
            frame = relayed.recv() => match frame {
                Ok(frame) => {
                    if frame.origin == conn_id {
                        continue;
                    }
                    writer.send(Message::text(frame.text.clone())).await?;
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Participant {participant_id} lagged by {n} frames");
                    shared.fanout.record_lag(n);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Forward one inbound text frame to everyone else, untouched.
fn forward(shared: &RelayShared, conn_id: u64, participant_id: &ParticipantId, text: &str) {
    match Frame::decode(text) {
        Ok(Frame::Event(event)) => {
            if event.event_type == EventType::SecurityEvent {
                log::warn!(
                    "SECURITY_EVENT from {}: {}",
                    event.sender,
                    event.payload
                );
            }
            if event.sender != *participant_id {
                log::debug!(
                    "Connection of {participant_id} relayed an event stamped {}",
                    event.sender
                );
            }
            shared.fanout.relay(conn_id, text.to_string());
            shared.stats.relayed_events.fetch_add(1, Ordering::Relaxed);
        }
        Ok(other) => {
            shared.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Unexpected frame from {participant_id}: {other:?}");
        }
        Err(e) => {
            shared.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dropping undecodable frame from {participant_id}: {e}");
        }
    }
}

/// Unregister and announce the departure, unless the id has moved on to a
/// newer connection.
async fn depart(shared: &RelayShared, participant_id: &ParticipantId, conn_id: u64) {
    if !shared.fanout.unregister_if(participant_id, conn_id).await {
        log::info!("Superseded connection of {participant_id} closed");
        return;
    }

    let encoded = Departure::new(participant_id.clone(), now_millis())
        .into_event()
        .and_then(|event| Frame::Event(event).encode());
    match encoded {
        Ok(text) => {
            shared.fanout.relay(SYSTEM_ORIGIN, text);
            shared.stats.departures.fetch_add(1, Ordering::Relaxed);
            log::info!("Participant {participant_id} left");
        }
        Err(e) => log::error!("Failed to encode departure of {participant_id}: {e}"),
    }
}
