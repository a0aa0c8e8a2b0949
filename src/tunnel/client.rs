//! Tunnel client — outbound WS connection from this instance to the hub.
//!
//! Maintains a persistent WebSocket to the hub with exponential-backoff
//! reconnect and heartbeat, registers under a stable client id, reports
//! liveness, and routes inbound envelopes: proxied HTTP exchanges to the
//! [`ProxyForwarder`], user requests to the [`RequestDispatcher`], hub
//! commands to subscribers.
//!
//! One supervisor task owns the whole lifecycle. Each connection runs a
//! single `select!` loop over the WS stream, the outbound queue, the
//! heartbeat interval and the pong deadline, so envelopes are processed in
//! arrival order while spawned exchanges complete independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::adapter::dispatcher::RequestDispatcher;
use crate::config::HubConfig;
use crate::error::{HublinkError, Result};
use crate::protocol::{parse_inbound, Inbound, Liveness, Outbound};
use crate::tunnel::proxy::{self, ProxyForwarder};

/// Cap on the reconnect backoff interval.
const MAX_BACKOFF_MS: u64 = 60_000;
/// Outbound envelope queue depth per client.
const OUTBOUND_QUEUE: usize = 256;

/// Lifecycle notifications emitted over [`TunnelClient::subscribe`].
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connected,
    Registered,
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    RetriesExhausted,
    HubError { message: String },
    /// A hub command this client has no built-in handling for.
    Command { command: String },
}

/// Where the connection currently stands, for `connect()` waiters.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Pending,
    Connecting,
    Connected,
    Registered,
    Rejected(String),
    Exhausted,
    Stopped,
}

/// Why a live connection ended.
enum ConnectionEnd {
    /// Deliberate local close — do not reconnect.
    Clean,
    /// Hub refused registration — terminal, do not retry.
    Rejected(String),
    /// Anything else — transport error, enters the reconnect path.
    Transport(String),
}

/// Reconnect backoff: start at the configured interval, grow x1.5 per
/// failure, cap at [`MAX_BACKOFF_MS`]. Reset only on a successful open.
struct Backoff {
    initial_ms: u64,
    current_ms: u64,
}

impl Backoff {
    fn new(initial_ms: u64) -> Self {
        Self {
            initial_ms,
            current_ms: initial_ms,
        }
    }

    fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    /// The delay to schedule for this failure; advances the interval.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms + self.current_ms / 2).min(MAX_BACKOFF_MS);
        Duration::from_millis(delay)
    }

    /// The delay the next failure would be scheduled with.
    fn peek(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }
}

/// Heartbeat bookkeeping: one armed pong deadline at a time, tagged with a
/// generation so a stale deadline can never terminate a successor connection.
struct Heartbeat {
    timeout: Duration,
    generation: u64,
    armed: Option<(u64, Instant)>,
}

impl Heartbeat {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            generation: 0,
            armed: None,
        }
    }

    /// Arm the pong deadline, clearing any previous one. Returns the new
    /// generation.
    fn arm(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.armed = Some((self.generation, now + self.timeout));
        self.generation
    }

    fn clear(&mut self) {
        self.armed = None;
    }

    fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    fn deadline(&self) -> Instant {
        self.armed
            .map_or_else(Instant::now, |(_, deadline)| deadline)
    }

    /// Whether an expiry for `generation` is still live.
    fn is_current(&self, generation: u64) -> bool {
        matches!(self.armed, Some((armed, _)) if armed == generation)
    }
}

struct ClientShared {
    config: HubConfig,
    client_id: String,
    dispatcher: Option<Arc<RequestDispatcher>>,
    proxy: Option<Arc<ProxyForwarder>>,
    events: broadcast::Sender<TunnelEvent>,
    tunnel_up: Arc<AtomicBool>,
    registered: AtomicBool,
    want_reconnect: AtomicBool,
    last_status: StdMutex<Option<Liveness>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<mpsc::Receiver<Outbound>>,
    phase: watch::Sender<Phase>,
    /// True while `disconnect()` wants the connection down.
    shutdown: watch::Sender<bool>,
    /// Bumped to force-terminate the in-flight attempt without clearing the
    /// desire to reconnect.
    kick: watch::Sender<u64>,
    wake: Notify,
    supervisor_started: AtomicBool,
}

/// The tunnel client. Cheap to clone via [`Arc`]; all state is instance-owned
/// — two clients never share session or exchange maps.
#[derive(Clone)]
pub struct TunnelClient {
    shared: Arc<ClientShared>,
}

impl TunnelClient {
    pub fn new(
        config: HubConfig,
        dispatcher: Option<Arc<RequestDispatcher>>,
        proxy: Option<Arc<ProxyForwarder>>,
    ) -> Self {
        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };
        let (events, _) = broadcast::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (phase, _) = watch::channel(Phase::Pending);
        let (shutdown, _) = watch::channel(false);
        let (kick, _) = watch::channel(0);
        Self {
            shared: Arc::new(ClientShared {
                config,
                client_id,
                dispatcher,
                proxy,
                events,
                tunnel_up: Arc::new(AtomicBool::new(false)),
                registered: AtomicBool::new(false),
                want_reconnect: AtomicBool::new(false),
                last_status: StdMutex::new(None),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                phase,
                shutdown,
                kick,
                wake: Notify::new(),
                supervisor_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Open the tunnel and register with the hub.
    ///
    /// Idempotent while registered. Resolves only once the hub answers
    /// `registered{success:true}`; a refused registration is terminal. On
    /// deadline the in-flight attempt is force-terminated and
    /// [`HublinkError::ConnectTimeout`] returned — background reconnection
    /// keeps going.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.config.url.is_none() {
            return Err(HublinkError::Config("hub.url is not set".to_string()));
        }
        if self.is_registered() && shared.tunnel_up.load(Ordering::SeqCst) {
            return Ok(());
        }

        shared.want_reconnect.store(true, Ordering::SeqCst);
        let _ = shared.shutdown.send(false);
        shared.phase.send_replace(Phase::Pending);

        if !shared.supervisor_started.swap(true, Ordering::SeqCst) {
            let shared = shared.clone();
            tokio::spawn(async move { supervisor_loop(shared).await });
        }
        shared.wake.notify_one();

        let mut phase_rx = shared.phase.subscribe();
        let deadline = Duration::from_secs(shared.config.connect_timeout_secs);
        let wait = async {
            loop {
                let phase = phase_rx.borrow_and_update().clone();
                match phase {
                    Phase::Registered => return Ok(()),
                    Phase::Rejected(message) => {
                        return Err(HublinkError::RegistrationRejected(message));
                    }
                    Phase::Exhausted => return Err(HublinkError::RetriesExhausted),
                    Phase::Stopped => return Err(HublinkError::NotConnected),
                    Phase::Pending | Phase::Connecting | Phase::Connected => {}
                }
                if phase_rx.changed().await.is_err() {
                    return Err(HublinkError::NotConnected);
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.force_terminate();
                Err(HublinkError::ConnectTimeout)
            }
        }
    }

    /// Close the tunnel and stop reconnecting. Safe to call repeatedly, and
    /// reentrantly from a handler the close itself triggers; cancels a
    /// scheduled-but-unfired reconnect attempt.
    pub fn disconnect(&self) {
        self.shared.want_reconnect.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown.send(true);
    }

    /// Drop the in-flight connection attempt without giving up on
    /// reconnection.
    fn force_terminate(&self) {
        self.shared.kick.send_modify(|n| *n += 1);
    }

    /// Report liveness to the hub. While unregistered the value is stored and
    /// re-sent right after the next successful registration.
    pub async fn send_status_update(&self, status: Liveness) -> Result<()> {
        *self.shared.last_status.lock().expect("status lock") = Some(status);
        if !self.is_registered() {
            debug!(%status, "Not registered; status will be sent after registration");
            return Ok(());
        }
        self.shared
            .outbound_tx
            .send(Outbound::StatusUpdate {
                client_id: self.shared.client_id.clone(),
                status,
            })
            .await
            .map_err(|_| HublinkError::NotConnected)
    }

    /// Queue an arbitrary envelope, e.g. from an embedding application.
    pub fn outbound(&self) -> mpsc::Sender<Outbound> {
        self.shared.outbound_tx.clone()
    }
}

/// Hub URL with the stable client id as a query parameter, so the hub
/// correlates reconnects with an existing slot.
fn connection_url(base: &str, client_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}client_id={client_id}")
}

/// Supervisor: waits until a connection is wanted, then cycles
/// connect/run/backoff until told to stop or the attempts are exhausted.
async fn supervisor_loop(shared: Arc<ClientShared>) {
    let mut backoff = Backoff::new(shared.config.reconnect_interval_secs * 1000);
    let mut attempts: u32 = 0;

    loop {
        if !shared.want_reconnect.load(Ordering::SeqCst) {
            backoff.reset();
            attempts = 0;
            shared.wake.notified().await;
            continue;
        }

        let url = match shared.config.url.as_deref() {
            Some(base) => connection_url(base, &shared.client_id),
            None => {
                error!("Tunnel: hub.url is not set");
                shared.want_reconnect.store(false, Ordering::SeqCst);
                shared.phase.send_replace(Phase::Stopped);
                continue;
            }
        };

        shared.phase.send_replace(Phase::Connecting);
        info!(client_id = %shared.client_id, "Tunnel: connecting to hub");
        let connect_deadline = Duration::from_secs(shared.config.connect_timeout_secs);
        let attempt = tokio::time::timeout(
            connect_deadline,
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        match attempt {
            Ok(Ok((ws_stream, _response))) => {
                attempts = 0;
                backoff.reset();
                shared.phase.send_replace(Phase::Connected);
                shared.tunnel_up.store(true, Ordering::SeqCst);
                let _ = shared.events.send(TunnelEvent::Connected);
                info!("Tunnel: connected, registering...");

                let end = run_connection(&shared, ws_stream).await;

                shared.tunnel_up.store(false, Ordering::SeqCst);
                shared.registered.store(false, Ordering::SeqCst);
                match end {
                    ConnectionEnd::Clean => {
                        info!("Tunnel: closed");
                        let _ = shared.events.send(TunnelEvent::Disconnected {
                            reason: "closed".to_string(),
                        });
                        shared.want_reconnect.store(false, Ordering::SeqCst);
                        shared.phase.send_replace(Phase::Stopped);
                        continue;
                    }
                    ConnectionEnd::Rejected(message) => {
                        error!("Tunnel: hub rejected registration: {message}");
                        let _ = shared.events.send(TunnelEvent::Disconnected {
                            reason: format!("registration rejected: {message}"),
                        });
                        shared.want_reconnect.store(false, Ordering::SeqCst);
                        shared.phase.send_replace(Phase::Rejected(message));
                        continue;
                    }
                    ConnectionEnd::Transport(reason) => {
                        warn!("Tunnel: connection lost: {reason}");
                        let _ = shared.events.send(TunnelEvent::Disconnected { reason });
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("Tunnel: connect failed: {e}");
            }
            Err(_) => {
                warn!(
                    "Tunnel: connect timed out after {}s",
                    connect_deadline.as_secs()
                );
            }
        }

        if !shared.want_reconnect.load(Ordering::SeqCst) {
            shared.phase.send_replace(Phase::Stopped);
            continue;
        }
        attempts += 1;
        if attempts > shared.config.max_reconnect_attempts {
            error!(
                "Tunnel: giving up after {} reconnect attempts",
                shared.config.max_reconnect_attempts
            );
            shared.want_reconnect.store(false, Ordering::SeqCst);
            shared.phase.send_replace(Phase::Exhausted);
            let _ = shared.events.send(TunnelEvent::RetriesExhausted);
            continue;
        }

        let delay = backoff.next_delay();
        info!(attempt = attempts, "Tunnel: reconnecting in {:?}", delay);
        let _ = shared.events.send(TunnelEvent::ReconnectScheduled {
            attempt: attempts,
            delay,
        });
        let mut shutdown_rx = shared.shutdown.subscribe();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = watch_until_true(&mut shutdown_rx) => {
                shared.phase.send_replace(Phase::Stopped);
            }
        }
    }
}

async fn watch_until_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A single live connection: register, then pump envelopes until it ends.
async fn run_connection(shared: &Arc<ClientShared>, ws_stream: WsStream) -> ConnectionEnd {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let register = Outbound::Register {
        client_id: shared.client_id.clone(),
        user_token: shared.config.auth_token.clone(),
        metadata: json!({
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
        }),
    };
    if ws_sink
        .send(Message::Text(register.to_message().into()))
        .await
        .is_err()
    {
        return ConnectionEnd::Transport("failed to send registration".to_string());
    }

    let mut outbound_rx = shared.outbound_rx.lock().await;
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut kick_rx = shared.kick.subscribe();

    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(
        shared.config.heartbeat_interval_secs,
    ));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut heartbeat = Heartbeat::new(Duration::from_secs(shared.config.heartbeat_timeout_secs));

    loop {
        tokio::select! {
            message = ws_stream.next() => {
                match message {
                    None => return ConnectionEnd::Transport("connection closed by hub".to_string()),
                    Some(Err(e)) => return ConnectionEnd::Transport(format!("websocket error: {e}")),
                    Some(Ok(Message::Text(text))) => {
                        let Some(inbound) = parse_inbound(&text) else {
                            warn!("Tunnel: dropping invalid envelope");
                            continue;
                        };
                        if let Some(end) = handle_inbound(shared, &mut heartbeat, inbound) {
                            if matches!(end, ConnectionEnd::Clean) {
                                let _ = ws_sink.send(Message::Close(None)).await;
                            }
                            return end;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return ConnectionEnd::Transport("hub sent close".to_string());
                    }
                    Some(Ok(_)) => {}
                }
            }
            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else {
                    return ConnectionEnd::Transport("outbound queue closed".to_string());
                };
                if ws_sink
                    .send(Message::Text(envelope.to_message().into()))
                    .await
                    .is_err()
                {
                    return ConnectionEnd::Transport("failed to send envelope".to_string());
                }
            }
            _ = heartbeat_interval.tick() => {
                let ping = Outbound::Ping { client_id: shared.client_id.clone() };
                if ws_sink
                    .send(Message::Text(ping.to_message().into()))
                    .await
                    .is_err()
                {
                    return ConnectionEnd::Transport("failed to send ping".to_string());
                }
                let generation = heartbeat.arm(Instant::now());
                debug!(generation, "Tunnel: heartbeat armed");
            }
            () = tokio::time::sleep_until(heartbeat.deadline()), if heartbeat.is_armed() => {
                warn!("Tunnel: heartbeat timed out, terminating connection");
                return ConnectionEnd::Transport("heartbeat timeout".to_string());
            }
            _ = watch_until_true(&mut shutdown_rx) => {
                let _ = ws_sink.send(Message::Close(None)).await;
                return ConnectionEnd::Clean;
            }
            _ = kick_rx.changed() => {
                return ConnectionEnd::Transport("connection attempt aborted".to_string());
            }
        }
    }
}

/// React to one validated inbound envelope. Returns `Some` when the
/// connection must end.
fn handle_inbound(
    shared: &Arc<ClientShared>,
    heartbeat: &mut Heartbeat,
    inbound: Inbound,
) -> Option<ConnectionEnd> {
    match inbound {
        Inbound::Registered { success: true, .. } => {
            info!(client_id = %shared.client_id, "Tunnel: registered with hub");
            shared.registered.store(true, Ordering::SeqCst);
            shared.phase.send_replace(Phase::Registered);
            let _ = shared.events.send(TunnelEvent::Registered);
            resend_status(shared);
            None
        }
        Inbound::Registered { success: false, message } => Some(ConnectionEnd::Rejected(
            message.unwrap_or_else(|| "registration refused".to_string()),
        )),
        Inbound::Pong => {
            heartbeat.clear();
            None
        }
        Inbound::Command { command } => match command.as_str() {
            "disconnect" => {
                info!("Tunnel: hub requested disconnect");
                shared.want_reconnect.store(false, Ordering::SeqCst);
                Some(ConnectionEnd::Clean)
            }
            "refresh_status" => {
                resend_status(shared);
                None
            }
            _ => {
                debug!(command, "Tunnel: forwarding unhandled hub command");
                let _ = shared.events.send(TunnelEvent::Command { command });
                None
            }
        },
        Inbound::Error { message } => {
            warn!("Tunnel: hub reported error: {message}");
            let _ = shared.events.send(TunnelEvent::HubError { message });
            None
        }
        Inbound::UserRequest { request_id, action, payload } => {
            if let Some(dispatcher) = shared.dispatcher.clone() {
                let outbound = shared.outbound_tx.clone();
                let tunnel_up = shared.tunnel_up.clone();
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(outbound, tunnel_up, request_id, action, payload)
                        .await;
                });
            } else {
                warn!(request_id, "Tunnel: no dispatcher for user request");
                let _ = shared.outbound_tx.try_send(Outbound::Error {
                    request_id: Some(request_id),
                    message: "no request handlers registered".to_string(),
                });
            }
            None
        }
        Inbound::HttpProxyRequest(request) => {
            if let Some(forwarder) = shared.proxy.clone() {
                let outbound = shared.outbound_tx.clone();
                tokio::spawn(async move {
                    let response = forwarder.handle(request).await;
                    if outbound.send(response).await.is_err() {
                        debug!("Tunnel: dropping proxy response, connection gone");
                    }
                });
            } else {
                let _ = shared.outbound_tx.try_send(proxy::bad_gateway(
                    &request.request_id,
                    "proxying is not configured",
                ));
            }
            None
        }
        Inbound::Unknown { kind, .. } => {
            debug!(kind, "Tunnel: ignoring unknown envelope type");
            None
        }
    }
}

fn resend_status(shared: &Arc<ClientShared>) {
    let status = *shared.last_status.lock().expect("status lock");
    if let Some(status) = status {
        let _ = shared.outbound_tx.try_send(Outbound::StatusUpdate {
            client_id: shared.client_id.clone(),
            status,
        });
    }
}
