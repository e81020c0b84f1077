use http::StatusCode;
use thiserror::Error;

use crate::protocol::TargetAddress;

/// Why an `X-Proxy-Target` value was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("missing X-Proxy-Target header")]
    Missing,

    #[error("X-Proxy-Target is not valid UTF-8")]
    NotUtf8,

    #[error("expected host:port, got {0:?}")]
    Format(String),

    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("port {0} out of range 1-65535")]
    PortOutOfRange(u32),
}

/// Failure after the tunnel went live. Never turned into an HTTP response.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("front stream error: {0}")]
    Front(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("back stream error: {0}")]
    Back(#[from] std::io::Error),

    #[error("pump task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// The peer hung up without a clean close. Expected, not a relay fault.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        use tokio_tungstenite::tungstenite::error::ProtocolError;
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            RelayError::Front(WsError::ConnectionClosed | WsError::AlreadyClosed) => true,
            RelayError::Front(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                true
            }
            RelayError::Front(WsError::Io(e)) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Unauthorized")]
    Auth,

    #[error("Expected Upgrade: websocket")]
    Protocol,

    #[error("Invalid target: {0}")]
    Address(#[from] AddressParseError),

    #[error("Bad handshake: {0}")]
    Handshake(String),

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: TargetAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

impl TunnelError {
    /// Status code to answer with, for errors raised before the upgrade.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TunnelError::Auth => Some(StatusCode::UNAUTHORIZED),
            TunnelError::Protocol => Some(StatusCode::UPGRADE_REQUIRED),
            TunnelError::Address(_) | TunnelError::Handshake(_) => Some(StatusCode::BAD_REQUEST),
            TunnelError::Connect { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
            TunnelError::Relay(_) => None,
        }
    }
}
