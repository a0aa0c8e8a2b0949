//! The tunnel to the orchestrator hub.
//!
//! - [`client`] — the outbound WS connection: registration, heartbeat,
//!   reconnect with backoff, hub commands, envelope routing.
//! - [`proxy`] — HTTP-proxy-over-tunnel against the local callback server.

pub mod client;
pub mod proxy;
