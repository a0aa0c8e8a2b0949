//! Routing of inbound `user_request` envelopes to session handlers.
//!
//! Each first request for a `request_id` is authenticated (when an authorizer
//! is configured), wrapped in a [`VirtualSocket`]/[`SessionWriter`] pair, and
//! dispatched by action; later requests for the same `request_id` are
//! injected into the live session's message path. Handlers only ever see an
//! already-authorized identity.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::socket::{SessionSocket, SessionWriter, VirtualSocket};
use crate::github::GithubAuthorizer;
use crate::protocol::Outbound;
use crate::status::StatusTracker;

/// Close code sent when a request names an action nobody handles.
const CLOSE_UNSUPPORTED: u16 = 4000;
/// Close code for sessions torn down because the client is shutting down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// The actions this client routes. A closed set: unknown kinds cannot be
/// registered, and unrecognized inbound actions are refused at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// An agent chat session.
    Chat,
    /// An interactive terminal session.
    Terminal,
}

impl ActionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Terminal => "terminal",
        }
    }
}

/// A session handler: receives the socket, its writer, and the request
/// payload reshaped as a locally-received message.
pub type ActionHandler = Arc<
    dyn Fn(Arc<VirtualSocket>, SessionWriter, Value) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

pub struct RequestDispatcher {
    handlers: HashMap<ActionKind, ActionHandler>,
    authorizer: Option<Arc<GithubAuthorizer>>,
    tracker: Arc<StatusTracker>,
    sessions: Arc<Mutex<HashMap<String, Arc<VirtualSocket>>>>,
}

impl RequestDispatcher {
    pub fn new(tracker: Arc<StatusTracker>, authorizer: Option<Arc<GithubAuthorizer>>) -> Self {
        Self {
            handlers: HashMap::new(),
            authorizer,
            tracker,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the handler for an action kind. Last registration wins.
    pub fn register(&mut self, kind: ActionKind, handler: ActionHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }

    /// Route one inbound `user_request`.
    pub async fn dispatch(
        &self,
        outbound: mpsc::Sender<Outbound>,
        tunnel_up: Arc<AtomicBool>,
        request_id: String,
        action: String,
        payload: Value,
    ) {
        // A live request_id is a continuation of that session, not a new one.
        let existing = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.get(&request_id).cloned()
        };
        if let Some(socket) = existing {
            socket.inject_message(payload);
            return;
        }

        let identity = if let Some(authorizer) = &self.authorizer {
            let token = payload.get("token").and_then(Value::as_str);
            let decision = authorizer.authorize(token).await;
            if !decision.authenticated {
                let reason = decision
                    .error
                    .unwrap_or_else(|| "authorization failed".to_string());
                warn!(request_id, "Rejected user request: {reason}");
                let _ = outbound.try_send(Outbound::Error {
                    request_id: Some(request_id),
                    message: format!("authorization failed: {reason}"),
                });
                return;
            }
            decision.user
        } else {
            None
        };

        let handler = ActionKind::parse(&action)
            .and_then(|kind| self.handlers.get(&kind))
            .cloned();
        let Some(handler) = handler else {
            warn!(request_id, action, "No handler for requested action");
            let _ = outbound.try_send(Outbound::Error {
                request_id: Some(request_id.clone()),
                message: format!("unsupported action: {action}"),
            });
            let _ = outbound.try_send(Outbound::ResponseComplete {
                request_id,
                data: Some(json!({ "code": CLOSE_UNSUPPORTED, "reason": "unsupported action" })),
            });
            return;
        };

        let socket = VirtualSocket::new(request_id.clone(), outbound, tunnel_up);
        {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            sessions.insert(request_id.clone(), socket.clone());
        }
        self.tracker.connection_opened(&request_id);

        // Bookkeeping is removed exactly once, on the socket's close,
        // regardless of which path triggered it.
        let sessions = self.sessions.clone();
        let tracker = self.tracker.clone();
        let id = request_id.clone();
        socket.set_on_close(move || {
            sessions.lock().expect("sessions lock").remove(&id);
            tracker.connection_closed(&id);
            debug!(request_id = %id, "Session closed");
        });

        info!(request_id, action, "Dispatching user request");
        let writer = SessionWriter::new(socket.clone());
        let message = reshape_message(&action, payload, identity.as_ref());
        tokio::spawn(handler(socket, writer, message));
    }

    /// Terminate every live session, e.g. when shutting down.
    pub fn close_all(&self, reason: &str) {
        let sockets: Vec<Arc<VirtualSocket>> = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.values().cloned().collect()
        };
        for socket in sockets {
            socket.close(CLOSE_GOING_AWAY, reason);
        }
    }
}

/// Reshape a `user_request` payload as the message a handler would have read
/// off a direct connection: tagged with the action, carrying the authorized
/// identity.
fn reshape_message(
    action: &str,
    payload: Value,
    identity: Option<&crate::github::AuthorizedUser>,
) -> Value {
    let mut message = match payload {
        Value::Object(map) => Value::Object(map),
        Value::Null => json!({}),
        other => json!({ "payload": other }),
    };
    message["type"] = json!(action);
    if let Some(identity) = identity {
        message["user"] = serde_json::to_value(identity).unwrap_or(Value::Null);
    }
    message
}
