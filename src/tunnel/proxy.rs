//! HTTP-proxy-over-tunnel: serve `http_proxy_request` envelopes by fetching
//! from the local callback server.
//!
//! The hub relays an end user's HTTP request over the tunnel; this module
//! replays it against `http://localhost:<port>`, classifies the response as
//! text or binary, rewrites HTML/JS bodies when a proxy base is in play, and
//! answers with exactly one `http_proxy_response`. A failed local fetch
//! becomes a synthesized 502 — it never propagates as an unhandled failure.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use crate::protocol::{HttpProxyRequest, Outbound};
use crate::rewrite::{self, MintedIdentity};

/// Header marking a base64-encoded binary body.
const ENCODING_HEADER: &str = "x-orch-encoding";
/// Trusted identity headers stamped by the hub on proxied requests.
const USER_ID_HEADER: &str = "x-orchestrator-user-id";
const USERNAME_HEADER: &str = "x-orchestrator-username";

/// Mints a local bearer credential for a remote identity, so proxied requests
/// arrive at the local server already authenticated as that visitor. Supplied
/// by the embedding application; credential storage is not this crate's
/// concern.
pub trait IdentityMinter: Send + Sync {
    fn mint(&self, user_id: &str, username: &str) -> Option<String>;
}

impl<F> IdentityMinter for F
where
    F: Fn(&str, &str) -> Option<String> + Send + Sync,
{
    fn mint(&self, user_id: &str, username: &str) -> Option<String> {
        self(user_id, username)
    }
}

pub struct ProxyForwarder {
    http: reqwest::Client,
    local_base: String,
    minter: Option<Arc<dyn IdentityMinter>>,
}

impl ProxyForwarder {
    pub fn new(callback_port: u16, minter: Option<Arc<dyn IdentityMinter>>) -> Self {
        Self::with_local_base(format!("http://localhost:{callback_port}"), minter)
    }

    /// Same as [`new`](Self::new) with the full local base URL — used by
    /// tests to point at a mock server.
    pub fn with_local_base(
        local_base: impl Into<String>,
        minter: Option<Arc<dyn IdentityMinter>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            local_base: local_base.into(),
            minter,
        }
    }

    /// Serve one proxied exchange. Always yields the matching
    /// `http_proxy_response`.
    pub async fn handle(&self, request: HttpProxyRequest) -> Outbound {
        let request_id = request.request_id.clone();
        match self.forward(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id, "Proxied fetch failed: {e}");
                bad_gateway(&request_id, &e)
            }
        }
    }

    async fn forward(&self, request: &HttpProxyRequest) -> Result<Outbound, String> {
        let minted = self.mint_identity(&request.headers);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| format!("invalid method {:?}", request.method))?;
        let mut url = format!("{}{}", self.local_base, request.path);
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        debug!(method = %method, url = %url, "Forwarding proxied request");

        let mut builder = self.http.request(method, &url);
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            // The local fetch gets its own host and credentials; the hub's
            // identity headers must never reach the local server.
            if lower == "host" || lower == "authorization" || lower.starts_with("x-orchestrator-")
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(identity) = &minted {
            builder = builder.header("authorization", format!("Bearer {}", identity.token));
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;

        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let mut body = if is_text_content_type(&content_type) {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            headers.insert(ENCODING_HEADER.to_string(), "base64".to_string());
            BASE64.encode(&bytes)
        };

        if let Some(proxy_base) = request.proxy_base.as_deref().filter(|b| !b.is_empty()) {
            if is_html_content_type(&content_type) {
                body = rewrite::rewrite_html(&body, proxy_base, minted.as_ref());
                rewrite::retune_cache_headers(&mut headers);
            } else if is_js_content_type(&content_type) {
                body = rewrite::rewrite_js(&body, proxy_base);
                rewrite::retune_cache_headers(&mut headers);
            }
        }

        Ok(Outbound::HttpProxyResponse {
            request_id: request.request_id.clone(),
            status,
            headers,
            body,
        })
    }

    /// Mint a credential from the hub's trusted identity headers. A malformed
    /// credential (not exactly three dot-separated segments) is discarded,
    /// not sent.
    fn mint_identity(&self, headers: &HashMap<String, String>) -> Option<MintedIdentity> {
        let minter = self.minter.as_ref()?;
        let find = |wanted: &str| {
            headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
                .map(|(_, value)| value.clone())
        };
        let user_id = find(USER_ID_HEADER)?;
        let username = find(USERNAME_HEADER)?;
        let token = minter.mint(&user_id, &username)?;
        if token.split('.').count() != 3 {
            warn!(user_id, "Minted credential is malformed, discarding");
            return None;
        }
        Some(MintedIdentity {
            token,
            user_id,
            username,
        })
    }
}

/// Synthesized response for a failed local fetch.
pub fn bad_gateway(request_id: &str, error: &str) -> Outbound {
    Outbound::HttpProxyResponse {
        request_id: request_id.to_string(),
        status: 502,
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: json!({
            "error": format!("local fetch failed: {error}"),
            "code": "BAD_GATEWAY",
        })
        .to_string(),
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_text_content_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    media.starts_with("text/")
        || media.ends_with("+json")
        || media.ends_with("+xml")
        || matches!(
            media.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/xml"
                | "application/x-www-form-urlencoded"
        )
}

fn is_html_content_type(content_type: &str) -> bool {
    media_type(content_type) == "text/html"
}

fn is_js_content_type(content_type: &str) -> bool {
    matches!(
        media_type(content_type).as_str(),
        "application/javascript" | "application/x-javascript" | "text/javascript"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use base64::Engine;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use serde_json::Value;

    async fn start_local(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(path: &str, headers: &[(&str, &str)], proxy_base: Option<&str>) -> HttpProxyRequest {
        HttpProxyRequest {
            request_id: "rq1".into(),
            method: "GET".into(),
            path: path.into(),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            body: None,
            query: None,
            proxy_base: proxy_base.map(ToString::to_string),
        }
    }

    fn minter(token: &'static str) -> Option<Arc<dyn IdentityMinter>> {
        Some(Arc::new(move |_: &str, _: &str| Some(token.to_string())))
    }

    #[tokio::test]
    async fn forwards_and_filters_headers() {
        let app = Router::new().route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let seen: HashMap<String, String> = headers
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap().to_string()))
                    .collect();
                axum::Json(seen)
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, minter("h.p.s"));

        let result = forwarder
            .handle(request(
                "/echo",
                &[
                    ("Authorization", "Bearer hub-token"),
                    ("X-Orchestrator-User-Id", "u1"),
                    ("X-Orchestrator-Username", "alice"),
                    ("X-Custom", "kept"),
                    ("Host", "hub.example.com"),
                ],
                None,
            ))
            .await;

        let Outbound::HttpProxyResponse { status, body, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(status, 200);
        let seen: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(seen["authorization"], "Bearer h.p.s");
        assert_eq!(seen["x-custom"], "kept");
        assert!(seen.get("x-orchestrator-user-id").is_none());
        assert!(seen.get("x-orchestrator-username").is_none());
    }

    #[tokio::test]
    async fn malformed_minted_credential_is_discarded() {
        let app = Router::new().route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .map(|v| v.to_str().unwrap().to_string())
                    .unwrap_or_default();
                auth
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, minter("no-dot-segments"));

        let result = forwarder
            .handle(request(
                "/echo",
                &[
                    ("x-orchestrator-user-id", "u1"),
                    ("x-orchestrator-username", "alice"),
                ],
                None,
            ))
            .await;

        let Outbound::HttpProxyResponse { body, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn binary_bodies_are_base64_marked() {
        let png: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x00, 0xff];
        let app = Router::new().route(
            "/logo.png",
            get(move || async move {
                ([("content-type", "image/png")], png.to_vec()).into_response()
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, None);

        let result = forwarder.handle(request("/logo.png", &[], None)).await;
        let Outbound::HttpProxyResponse { headers, body, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(headers.get(ENCODING_HEADER).map(String::as_str), Some("base64"));
        assert_eq!(BASE64.decode(body).unwrap(), png);
    }

    #[tokio::test]
    async fn html_is_rewritten_and_cache_retuned() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [
                        ("content-type", "text/html; charset=utf-8"),
                        ("cache-control", "public, max-age=86400, immutable"),
                    ],
                    r#"<head></head><body><img src="/a.png"></body>"#,
                )
                    .into_response()
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, None);

        let result = forwarder
            .handle(request("/", &[], Some("/clients/x/proxy")))
            .await;
        let Outbound::HttpProxyResponse { headers, body, status, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(status, 200);
        assert!(body.contains(r#"src="/clients/x/proxy/a.png""#));
        assert!(body.contains("__ORCHESTRATOR_PROXY_BASE__"));
        assert!(!headers.contains_key("content-length"));
        assert_eq!(
            headers.get("cache-control").map(String::as_str),
            Some("public, max-age=3600, must-revalidate")
        );
    }

    #[tokio::test]
    async fn js_is_rewritten_under_proxy_base() {
        let app = Router::new().route(
            "/app.js",
            get(|| async {
                (
                    [("content-type", "application/javascript")],
                    r#"fetch("/api/foo");"#,
                )
                    .into_response()
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, None);

        let result = forwarder
            .handle(request("/app.js", &[], Some("/clients/x/proxy")))
            .await;
        let Outbound::HttpProxyResponse { body, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(body, r#"fetch("/clients/x/proxy/api/foo");"#);
    }

    #[tokio::test]
    async fn failed_fetch_becomes_bad_gateway() {
        // Nothing listens on this port.
        let forwarder = ProxyForwarder::with_local_base("http://127.0.0.1:9", None);
        let result = forwarder.handle(request("/anything", &[], None)).await;

        let Outbound::HttpProxyResponse { request_id, status, headers, body } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(request_id, "rq1");
        assert_eq!(status, 502);
        assert_eq!(
            headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["code"], "BAD_GATEWAY");
    }

    #[tokio::test]
    async fn query_string_is_preserved() {
        let app = Router::new().route(
            "/search",
            get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                q.unwrap_or_default()
            }),
        );
        let base = start_local(app).await;
        let forwarder = ProxyForwarder::with_local_base(base, None);

        let mut req = request("/search", &[], None);
        req.query = Some("q=tunnel&page=2".into());
        let result = forwarder.handle(req).await;
        let Outbound::HttpProxyResponse { body, .. } = result else {
            panic!("expected proxy response");
        };
        assert_eq!(body, "q=tunnel&page=2");
    }
}
