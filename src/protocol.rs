//! Wire envelopes for the hub tunnel.
//!
//! The tunnel carries JSON-text frames, one object per frame, tagged by
//! `type`. Outbound and inbound vocabularies are disjoint closed sets; every
//! inbound frame passes a per-type structural check before it is dispatched,
//! and unknown inbound types are preserved as [`Inbound::Unknown`] so newer
//! hubs can ship envelope types this client does not understand yet.
//!
//! This module is pure — no I/O, no timers. Construction never fails;
//! [`parse_inbound`] returns `None` on anything malformed so callers drop and
//! log instead of crashing.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness summary reported to the hub. Always derived from connection and
/// busy-job counts, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Idle,
    Active,
    Busy,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Idle => "idle",
            Liveness::Active => "active",
            Liveness::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Envelopes this client sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Register {
        client_id: String,
        user_token: String,
        metadata: Value,
    },
    StatusUpdate {
        client_id: String,
        status: Liveness,
    },
    Ping {
        client_id: String,
    },
    Response {
        request_id: String,
        data: Value,
    },
    ResponseChunk {
        request_id: String,
        data: Value,
    },
    ResponseComplete {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    HttpProxyResponse {
        request_id: String,
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
}

impl Outbound {
    /// Render the envelope as one JSON text frame.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("envelope serializes")
    }
}

/// A proxied HTTP request relayed by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_base: Option<String>,
}

/// Envelopes the hub sends to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Registered {
        success: bool,
        message: Option<String>,
    },
    Pong,
    Command {
        command: String,
    },
    Error {
        message: String,
    },
    UserRequest {
        request_id: String,
        action: String,
        payload: Value,
    },
    HttpProxyRequest(HttpProxyRequest),
    /// A type this client does not know. Kept intact for forward
    /// compatibility; callers ignore it.
    Unknown {
        kind: String,
        raw: Value,
    },
}

/// Structural check applied to every inbound frame before dispatch.
///
/// A frame that fails here is dropped whole — never partially forwarded.
/// Unknown types pass so a newer hub can speak to an older client.
pub fn validate_inbound(value: &Value) -> std::result::Result<(), String> {
    let Some(obj) = value.as_object() else {
        return Err("envelope is not an object".to_string());
    };
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return Err("missing string field `type`".to_string());
    };

    let need_str = |field: &str| -> std::result::Result<(), String> {
        if obj.get(field).and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err(format!("`{kind}` requires string field `{field}`"))
        }
    };

    match kind {
        "registered" => {
            if obj.get("success").and_then(Value::as_bool).is_some() {
                Ok(())
            } else {
                Err("`registered` requires boolean field `success`".to_string())
            }
        }
        "command" => need_str("command"),
        "error" => need_str("message"),
        "user_request" => {
            need_str("request_id")?;
            need_str("action")
        }
        "http_proxy_request" => {
            need_str("request_id")?;
            need_str("method")?;
            need_str("path")
        }
        _ => Ok(()),
    }
}

/// Parse one inbound text frame. Returns `None` on malformed JSON or on a
/// parseable-but-invalid envelope; callers drop and log, never crash.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    validate_inbound(&value).ok()?;

    // Validation guarantees the per-type fields below are present and typed.
    let kind = value.get("type").and_then(Value::as_str)?.to_string();
    let inbound = match kind.as_str() {
        "registered" => Inbound::Registered {
            success: value.get("success").and_then(Value::as_bool).unwrap_or(false),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        },
        "pong" => Inbound::Pong,
        "command" => Inbound::Command {
            command: value
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "error" => Inbound::Error {
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "user_request" => Inbound::UserRequest {
            request_id: value
                .get("request_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            action: value
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            payload: value.get("payload").cloned().unwrap_or(Value::Null),
        },
        "http_proxy_request" => {
            Inbound::HttpProxyRequest(serde_json::from_value(value).ok()?)
        }
        _ => Inbound::Unknown { kind, raw: value },
    };
    Some(inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(envelope: &Outbound) {
        let text = envelope.to_message();
        let back: Outbound = serde_json::from_str(&text).expect("parses back");
        assert_eq!(&back, envelope);
    }

    #[test]
    fn outbound_envelopes_roundtrip() {
        roundtrip(&Outbound::Register {
            client_id: "c1".into(),
            user_token: "tok".into(),
            metadata: json!({"version": "0.3.0"}),
        });
        roundtrip(&Outbound::StatusUpdate {
            client_id: "c1".into(),
            status: Liveness::Busy,
        });
        roundtrip(&Outbound::Ping { client_id: "c1".into() });
        roundtrip(&Outbound::Response {
            request_id: "r1".into(),
            data: json!({"ok": true}),
        });
        roundtrip(&Outbound::ResponseChunk {
            request_id: "r1".into(),
            data: json!({"text": "hello"}),
        });
        roundtrip(&Outbound::ResponseComplete {
            request_id: "r1".into(),
            data: None,
        });
        roundtrip(&Outbound::Error {
            request_id: Some("r1".into()),
            message: "boom".into(),
        });
        roundtrip(&Outbound::HttpProxyResponse {
            request_id: "r1".into(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: "hi".into(),
        });
    }

    #[test]
    fn status_serializes_lowercase() {
        let text = Outbound::StatusUpdate {
            client_id: "c1".into(),
            status: Liveness::Idle,
        }
        .to_message();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "status_update");
        assert_eq!(v["status"], "idle");
    }

    #[test]
    fn validation_rejects_incomplete_envelopes() {
        assert!(validate_inbound(&json!({})).is_err());
        assert!(validate_inbound(&json!({"type": "registered"})).is_err());
        assert!(validate_inbound(&json!({"type": "command"})).is_err());
        assert!(validate_inbound(&json!({"type": "user_request", "request_id": "a"})).is_err());
        assert!(validate_inbound(&json!({"type": "http_proxy_request", "request_id": "a", "method": "GET"})).is_err());
        assert!(validate_inbound(&json!([1, 2])).is_err());
    }

    #[test]
    fn validation_accepts_minimal_envelopes() {
        assert!(validate_inbound(&json!({"type": "registered", "success": true})).is_ok());
        assert!(validate_inbound(&json!({"type": "pong"})).is_ok());
        assert!(validate_inbound(&json!({"type": "command", "command": "x"})).is_ok());
        assert!(validate_inbound(&json!({"type": "error", "message": "m"})).is_ok());
        assert!(validate_inbound(
            &json!({"type": "user_request", "request_id": "a", "action": "chat"})
        )
        .is_ok());
        assert!(validate_inbound(
            &json!({"type": "http_proxy_request", "request_id": "a", "method": "GET", "path": "/"})
        )
        .is_ok());
        // Forward compatibility: unknown types pass with no other fields.
        assert!(validate_inbound(&json!({"type": "hub_telemetry"})).is_ok());
    }

    #[test]
    fn parse_drops_malformed_input() {
        assert_eq!(parse_inbound("not json"), None);
        assert_eq!(parse_inbound("{\"type\": \"command\"}"), None);
    }

    #[test]
    fn parse_builds_typed_envelopes() {
        let parsed = parse_inbound(&json!({"type": "registered", "success": false, "message": "nope"}).to_string());
        assert_eq!(
            parsed,
            Some(Inbound::Registered {
                success: false,
                message: Some("nope".into())
            })
        );

        let parsed = parse_inbound(
            &json!({
                "type": "http_proxy_request",
                "request_id": "r9",
                "method": "POST",
                "path": "/api/thing",
                "headers": {"content-type": "application/json"},
                "body": "{}",
                "proxy_base": "/clients/x/proxy"
            })
            .to_string(),
        );
        match parsed {
            Some(Inbound::HttpProxyRequest(req)) => {
                assert_eq!(req.request_id, "r9");
                assert_eq!(req.method, "POST");
                assert_eq!(req.proxy_base.as_deref(), Some("/clients/x/proxy"));
                assert_eq!(req.query, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        let parsed = parse_inbound(&json!({"type": "hub_telemetry", "rate": 3}).to_string());
        match parsed {
            Some(Inbound::Unknown { kind, raw }) => {
                assert_eq!(kind, "hub_telemetry");
                assert_eq!(raw["rate"], 3);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
