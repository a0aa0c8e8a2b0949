//! # hublink
//!
//! Tunnel client keeping a local agent instance reachable and controllable
//! from its orchestrator hub. The instance has no public inbound path; this
//! process holds a persistent outbound WebSocket to the hub, registers under
//! a stable client id, reports idle/active/busy liveness, and serves the hub's
//! proxied HTTP traffic from the local callback server.
//!
//! ## Subcommands
//!
//! - `hublink run` (default) — connect to the hub and serve proxied traffic
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, wiring, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — error taxonomy
//! protocol.rs      — wire envelopes: construction, serialization, validation
//! status.rs        — idle/active/busy liveness tracking
//! github.rs        — GitHub org/team/user authorization
//! rewrite.rs       — proxy-base HTML/JS content rewriting
//! tunnel/
//!   client.rs      — outbound WS to the hub, registration, heartbeat, reconnect
//!   proxy.rs       — HTTP-proxy-over-tunnel against the local callback server
//! adapter/
//!   socket.rs      — tunnel-backed virtual sockets for session handlers
//!   dispatcher.rs  — user_request routing: auth gate, action registry
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use hublink::config::Config;
use hublink::github::GithubAuthorizer;
use hublink::status::StatusTracker;
use hublink::tunnel::client::TunnelClient;
use hublink::tunnel::proxy::ProxyForwarder;
use hublink::{HublinkError, RequestDispatcher};

/// Tunnel client for orchestrator-managed agent instances.
#[derive(Parser)]
#[command(name = "hublink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the hub and serve proxied traffic (default when no
    /// subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Run { config }) => config,
        None => None,
    };
    run(config_path.as_deref()).await;
}

async fn run(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("hublink v{} starting", env!("CARGO_PKG_VERSION"));

    if config.hub.url.is_none() {
        error!("hub.url is required — set it in hublink.toml or HUBLINK_HUB_URL");
        std::process::exit(2);
    }
    if config.hub.auth_token == "change-me" {
        warn!("Using default auth token — set HUBLINK_AUTH_TOKEN or update config");
    }

    let tracker = Arc::new(StatusTracker::new());
    let authorizer = config
        .github
        .clone()
        .map(|github| Arc::new(GithubAuthorizer::new(github)));
    if authorizer.is_some() {
        info!("GitHub authorization enabled");
    } else {
        warn!("No [github] config — user requests will not be authorized");
    }

    // The binary registers no session handlers of its own; embedding
    // applications add them via the library. Proxied HTTP still flows.
    let dispatcher = Arc::new(RequestDispatcher::new(tracker.clone(), authorizer));
    let forwarder = Arc::new(ProxyForwarder::new(config.local.callback_port, None));
    info!(
        "Proxying hub traffic to http://localhost:{}",
        config.local.callback_port
    );

    let client = Arc::new(TunnelClient::new(
        config.hub.clone(),
        Some(dispatcher.clone()),
        Some(forwarder),
    ));
    info!("Client id: {}", client.client_id());

    // The tracker is the sole producer of status updates: every change it
    // emits is forwarded to the hub.
    let status_client = client.clone();
    let mut status_rx = tracker.subscribe();
    let status_task = tokio::spawn(async move {
        while let Ok(change) = status_rx.recv().await {
            info!(
                previous = %change.previous,
                current = %change.current,
                connections = change.connections,
                busy_jobs = change.busy_jobs,
                "Status changed"
            );
            if let Err(e) = status_client.send_status_update(change.current).await {
                warn!("Could not report status to hub: {e}");
            }
        }
    });

    match client.connect().await {
        Ok(()) => info!("Registered with hub"),
        Err(e @ (HublinkError::RegistrationRejected(_) | HublinkError::Config(_))) => {
            error!("Cannot reach a working hub session: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            // Transient: the client keeps reconnecting in the background.
            warn!("Initial connect failed ({e}), retrying in background");
        }
    }

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };
    shutdown.await;

    info!("Shutting down...");
    dispatcher.close_all("client shutting down");
    client.disconnect();
    status_task.abort();
    info!("Goodbye");
}
