//! Error types for the hub (client side) and the relay (server side).

use thiserror::Error;

/// Errors surfaced by the client-side hub.
///
/// Transport failures never reach the caller of `broadcast`: they are handled
/// by the reconnect policy and surface as connection state changes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HubError {
    #[error("Connection attempts exhausted after {attempts} tries")]
    ConnectionExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("Subscriber fault: {0}")]
    SubscriberFault(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors raised by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Handshake failed with {addr}: {reason}")]
    Handshake { addr: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] HubError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_error_display() {
        let e = HubError::UnsupportedEventType("UNKNOWN_TYPE".into());
        assert_eq!(e.to_string(), "Unsupported event type: UNKNOWN_TYPE");

        let e = HubError::ConnectionExhausted { attempts: 10 };
        assert_eq!(e.to_string(), "Connection attempts exhausted after 10 tries");
    }

    #[test]
    fn test_serde_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let message = err.to_string();
        let hub: HubError = err.into();
        assert_eq!(hub, HubError::Serialization(message));

        // Stays comparable after cloning, which LinkEvent relies on.
        assert_eq!(hub.clone(), hub);
    }

    #[test]
    fn test_relay_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let e: RelayError = io.into();
        assert!(e.to_string().contains("busy"));
    }

    #[test]
    fn test_relay_error_from_hub_error() {
        let e: RelayError = HubError::Serialization("bad frame".into()).into();
        assert_eq!(e.to_string(), "Protocol error: Serialization error: bad frame");
    }
}
