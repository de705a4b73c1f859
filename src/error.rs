use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::DecodeError;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("cannot attribute device {unique_id} to a gateway ({candidates} candidate entries)")]
    RoutingAmbiguous { unique_id: String, candidates: usize },

    #[error("gateway {mac} websocket is not connected")]
    NotConnected { mac: String },

    #[error("no gateway answered the discovery probe")]
    NoGatewayFound,

    #[error("every discovered gateway is already configured")]
    NoNewGateway,

    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("unknown setup entry {0}")]
    UnknownEntry(String),

    #[error("entry {0} is already registered")]
    DuplicateEntry(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
