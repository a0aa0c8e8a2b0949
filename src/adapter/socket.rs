//! Tunnel-backed virtual socket.
//!
//! Handlers for user sessions are written against a direct-connection socket:
//! they send frames, receive messages and errors, and observe a close event.
//! [`VirtualSocket`] presents that contract backed by the tunnel instead —
//! outbound frames become `response_chunk` envelopes keyed by `request_id`,
//! and hub-relayed input is injected into the same message/error path a real
//! socket would deliver on. [`SessionSocket`] is the seam: the
//! direct-transport variant lives with the local server, this module provides
//! the tunnel variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{HublinkError, Result};
use crate::protocol::Outbound;

/// Close code a virtual socket reports for an abnormal termination.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for a normal, handler-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// What a session handler can do with its connection, independent of whether
/// the connection is a real transport or the tunnel.
pub trait SessionSocket: Send + Sync {
    /// True while frames can still be sent.
    fn ready(&self) -> bool;
    /// Send one frame to the remote peer.
    fn send(&self, data: &str) -> Result<()>;
    /// Close the connection. Idempotent.
    fn close(&self, code: u16, reason: &str);
    /// Abnormal-close alias.
    fn terminate(&self) {
        self.close(CLOSE_ABNORMAL, "terminated");
    }
}

/// Events delivered to the handler driving a [`VirtualSocket`].
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Hub-relayed input for this session.
    Message(Value),
    /// Hub-relayed error for this session.
    Error(String),
    /// The socket closed; emitted exactly once.
    Closed { code: u16, reason: String },
}

/// A session socket backed by the tunnel, correlated by `request_id`.
pub struct VirtualSocket {
    request_id: String,
    outbound: mpsc::Sender<Outbound>,
    tunnel_up: Arc<AtomicBool>,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SocketEvent>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl VirtualSocket {
    pub fn new(
        request_id: String,
        outbound: mpsc::Sender<Outbound>,
        tunnel_up: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            request_id,
            outbound,
            tunnel_up,
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            on_close: Mutex::new(None),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Register the cleanup run exactly once when this socket closes,
    /// whatever the trigger path.
    pub fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().expect("on_close lock") = Some(Box::new(hook));
    }

    /// Next event for the handler driving this session.
    pub async fn next_event(&self) -> Option<SocketEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Send a JSON frame without the string-parse step of [`send`](Self::send).
    pub fn send_value(&self, data: Value) -> Result<()> {
        if !self.ready() {
            return Err(HublinkError::SocketClosed);
        }
        self.outbound
            .try_send(Outbound::ResponseChunk {
                request_id: self.request_id.clone(),
                data,
            })
            .map_err(|_| HublinkError::NotConnected)
    }

    /// Feed hub-relayed input into the handler's normal message path.
    pub fn inject_message(&self, data: Value) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(request_id = %self.request_id, "Dropping message for closed session");
            return;
        }
        let _ = self.events_tx.send(SocketEvent::Message(data));
    }

    /// Feed a hub-relayed error into the handler's normal error path.
    pub fn inject_error(&self, message: impl Into<String>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(SocketEvent::Error(message.into()));
    }
}

impl SessionSocket for VirtualSocket {
    fn ready(&self) -> bool {
        self.tunnel_up.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// String payloads are forwarded as parsed JSON where possible, else
    /// wrapped as `{"raw": data}` so the hub always sees an object.
    fn send(&self, data: &str) -> Result<()> {
        let data = serde_json::from_str::<Value>(data).unwrap_or_else(|_| json!({ "raw": data }));
        self.send_value(data)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let data = if code == CLOSE_NORMAL {
            None
        } else {
            Some(json!({ "code": code, "reason": reason }))
        };
        if self
            .outbound
            .try_send(Outbound::ResponseComplete {
                request_id: self.request_id.clone(),
                data,
            })
            .is_err()
        {
            warn!(request_id = %self.request_id, "Could not notify hub of session close");
        }
        let _ = self.events_tx.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        let hook = self.on_close.lock().expect("on_close lock").take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Wraps a [`VirtualSocket`] with the session-id bookkeeping handlers expect
/// from their writer half.
pub struct SessionWriter {
    socket: Arc<VirtualSocket>,
    session_id: Mutex<Option<String>>,
}

impl SessionWriter {
    pub fn new(socket: Arc<VirtualSocket>) -> Self {
        Self {
            socket,
            session_id: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Arc<VirtualSocket> {
        &self.socket
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock().expect("session_id lock") = Some(id.into());
    }

    pub fn get_session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session_id lock").clone()
    }

    /// Stream one frame to the hub.
    pub fn send(&self, data: &str) -> Result<()> {
        self.socket.send(data)
    }

    pub fn send_value(&self, data: Value) -> Result<()> {
        self.socket.send_value(data)
    }

    /// One-shot reply outside the chunk stream.
    pub fn respond(&self, data: Value) -> Result<()> {
        if !self.socket.ready() {
            return Err(HublinkError::SocketClosed);
        }
        self.socket
            .outbound
            .try_send(Outbound::Response {
                request_id: self.socket.request_id.clone(),
                data,
            })
            .map_err(|_| HublinkError::NotConnected)
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.socket.close(code, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_with_channel() -> (Arc<VirtualSocket>, mpsc::Receiver<Outbound>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(16);
        let up = Arc::new(AtomicBool::new(true));
        let socket = VirtualSocket::new("r1".into(), tx, up.clone());
        (socket, rx, up)
    }

    #[tokio::test]
    async fn send_forwards_chunks_keyed_by_request_id() {
        let (socket, mut rx, _up) = socket_with_channel();

        socket.send(r#"{"text":"hi"}"#).unwrap();
        socket.send("plain words").unwrap();

        match rx.recv().await.unwrap() {
            Outbound::ResponseChunk { request_id, data } => {
                assert_eq!(request_id, "r1");
                assert_eq!(data["text"], "hi");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Outbound::ResponseChunk { data, .. } => assert_eq!(data["raw"], "plain words"),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_once() {
        let (socket, mut rx, _up) = socket_with_channel();

        socket.close(CLOSE_NORMAL, "done");
        socket.close(CLOSE_NORMAL, "done again");
        socket.terminate();

        match rx.recv().await.unwrap() {
            Outbound::ResponseComplete { request_id, data } => {
                assert_eq!(request_id, "r1");
                assert_eq!(data, None);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        assert_eq!(
            socket.next_event().await,
            Some(SocketEvent::Closed {
                code: CLOSE_NORMAL,
                reason: "done".into()
            })
        );
    }

    #[tokio::test]
    async fn abnormal_close_carries_code() {
        let (socket, mut rx, _up) = socket_with_channel();
        socket.close(4000, "unknown action");
        match rx.recv().await.unwrap() {
            Outbound::ResponseComplete { data, .. } => {
                let data = data.unwrap();
                assert_eq!(data["code"], 4000);
                assert_eq!(data["reason"], "unknown action");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_hook_runs_exactly_once() {
        let (socket, _rx, _up) = socket_with_channel();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = count.clone();
        socket.set_on_close(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        socket.terminate();
        socket.close(CLOSE_NORMAL, "late");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_tracks_tunnel_and_local_state() {
        let (socket, _rx, up) = socket_with_channel();
        assert!(socket.ready());

        up.store(false, Ordering::SeqCst);
        assert!(!socket.ready());
        assert!(matches!(
            socket.send("x"),
            Err(HublinkError::SocketClosed)
        ));

        up.store(true, Ordering::SeqCst);
        socket.close(CLOSE_NORMAL, "done");
        assert!(!socket.ready());
    }

    #[tokio::test]
    async fn injected_input_reaches_the_event_stream() {
        let (socket, _rx, _up) = socket_with_channel();
        socket.inject_message(json!({"text": "hello"}));
        socket.inject_error("relay hiccup");

        assert_eq!(
            socket.next_event().await,
            Some(SocketEvent::Message(json!({"text": "hello"})))
        );
        assert_eq!(
            socket.next_event().await,
            Some(SocketEvent::Error("relay hiccup".into()))
        );
    }

    #[tokio::test]
    async fn writer_tracks_session_id_and_responds() {
        let (socket, mut rx, _up) = socket_with_channel();
        let writer = SessionWriter::new(socket);

        assert_eq!(writer.get_session_id(), None);
        writer.set_session_id("s42");
        assert_eq!(writer.get_session_id().as_deref(), Some("s42"));

        writer.respond(json!({"ok": true})).unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Response { request_id, data } => {
                assert_eq!(request_id, "r1");
                assert_eq!(data["ok"], true);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
}
