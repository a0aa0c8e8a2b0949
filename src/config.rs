//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `HUBLINK_HUB_URL`, `HUBLINK_AUTH_TOKEN`,
//!    `HUBLINK_CLIENT_ID`
//! 2. **Config file** — path via `--config <path>`, or `hublink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [hub]
//! url = "wss://hub.example.com/tunnel"
//! auth_token = "your-secret-token"
//! client_id = ""                    # generated when empty
//! reconnect_interval_secs = 5      # initial backoff, x1.5 per failure
//! max_reconnect_attempts = 10
//! heartbeat_interval_secs = 30
//! heartbeat_timeout_secs = 10
//! connect_timeout_secs = 30
//!
//! [local]
//! callback_port = 3000             # local HTTP server being proxied
//!
//! # Optional — omit entirely to disable user-request authorization
//! [github]
//! allowed_org = "my-org"
//! allowed_team = "my-org/ops"      # or a bare slug with allowed_org set
//! allowed_users = ["alice"]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub local: LocalConfig,
    /// Optional GitHub allow-list for proxied user requests. When absent the
    /// dispatcher invokes handlers without an authorization gate.
    pub github: Option<GithubAuthConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hub connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub WebSocket URL (e.g. `wss://hub.example.com/tunnel`). Required.
    /// Override with `HUBLINK_HUB_URL`.
    pub url: Option<String>,
    /// Bearer token presented at registration. Override with
    /// `HUBLINK_AUTH_TOKEN`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
    /// Stable client id, carried in the connection URL so the hub correlates
    /// reconnects with an existing slot. Generated (uuid v4) when empty.
    #[serde(default)]
    pub client_id: String,
    /// Initial seconds between reconnect attempts (default 5). Grows x1.5 per
    /// failure, capped at 60.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Reconnect attempts before giving up (default 10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Seconds between heartbeat pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for a pong before terminating (default 10).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Deadline in seconds for open + register (default 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// The local HTTP server that proxied hub traffic is forwarded to.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Port of the local callback server (default 3000).
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
}

/// GitHub allow-list for user-request authorization. With no rule configured
/// every request is rejected (secure by default).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubAuthConfig {
    /// Authorize members of this organization.
    pub allowed_org: Option<String>,
    /// Authorize members of this team, as `org/team-slug` or a bare slug
    /// combined with `allowed_org`.
    pub allowed_team: Option<String>,
    /// Authorize these usernames (case-insensitive). Checked first — no
    /// org/team API calls for allow-listed users.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_auth_token() -> String {
    "change-me".to_string()
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_callback_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: default_auth_token(),
            client_id: String::new(),
            reconnect_interval_secs: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            callback_port: default_callback_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `hublink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hublink.toml").exists() {
            let content =
                std::fs::read_to_string("hublink.toml").expect("Failed to read hublink.toml");
            toml::from_str(&content).expect("Failed to parse hublink.toml")
        } else {
            Config {
                hub: HubConfig::default(),
                local: LocalConfig::default(),
                github: None,
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(url) = std::env::var("HUBLINK_HUB_URL") {
            config.hub.url = Some(url);
        }
        if let Ok(token) = std::env::var("HUBLINK_AUTH_TOKEN") {
            config.hub.auth_token = token;
        }
        if let Ok(id) = std::env::var("HUBLINK_CLIENT_ID") {
            config.hub.client_id = id;
        }

        config
    }
}
