//! Error taxonomy for the tunnel client.
//!
//! Recoverable conditions (transport drops, heartbeat timeouts, failed proxied
//! fetches) are handled internally and observable only via events or
//! synthesized responses; the variants here are the failures that surface to
//! callers of the public API.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HublinkError>;

#[derive(Debug, Error)]
pub enum HublinkError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out establishing tunnel")]
    ConnectTimeout,

    #[error("hub rejected registration: {0}")]
    RegistrationRejected(String),

    #[error("reconnect attempts exhausted")]
    RetriesExhausted,

    #[error("tunnel is not connected")]
    NotConnected,

    #[error("virtual socket is closed")]
    SocketClosed,
}
