//! Adapter between the request-ID-multiplexed tunnel and handlers written
//! for a direct per-connection socket.
//!
//! - [`socket`] — the tunnel-backed [`VirtualSocket`](socket::VirtualSocket)
//!   and its [`SessionWriter`](socket::SessionWriter) wrapper.
//! - [`dispatcher`] — routes inbound `user_request` envelopes by action,
//!   gating them through the GitHub authorizer first.

pub mod dispatcher;
pub mod socket;
