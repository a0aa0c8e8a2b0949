//! Proxy-base content rewriting for HTML and JavaScript bodies.
//!
//! Content served through the hub lives under a path prefix (the proxy base,
//! e.g. `/clients/<id>/proxy`). Root-relative references inside proxied
//! bodies must be re-rooted under that prefix or the browser requests them at
//! the hub's root and gets the hub, not this client.
//!
//! The rewriting is deliberately textual — quote-anchored regex substitution
//! over an allow-list of likely route prefixes, not an HTML/JS parser. The
//! quote anchor is what keeps regular-expression literals like `/\/api\//`
//! untouched. Known limitation: `/apix` matches the `/api` prefix; that
//! looseness is the documented best-effort contract.

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Bump only when rewrite logic changes — appended as a cache-busting query
/// to rewritten script/style URLs so browsers refetch rewritten assets.
pub const REWRITE_VERSION: u32 = 4;

/// Route prefixes rewritten inside JavaScript string literals.
const JS_ROUTE_PREFIXES: &str =
    r"api|assets|auth|ws|favicon|static|socket\.io|sw\.js|manifest\.json|icons";

/// A locally minted credential for the remote visitor, used by the injected
/// auto-auth script.
#[derive(Debug, Clone)]
pub struct MintedIdentity {
    pub token: String,
    pub user_id: String,
    pub username: String,
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(src|href|action)=(["'])(/[^"']*)(["'])"#).expect("attr pattern")
    })
}

fn sw_register_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"register\(\s*(["'])(/sw\.js[^"']*)(["'])"#).expect("sw pattern")
    })
}

fn script_src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(<script\b[^>]*\bsrc=)(["'])([^"']+)(["'])"#).expect("script pattern")
    })
}

fn link_href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(<link\b[^>]*\bhref=)(["'])([^"']+)(["'])"#).expect("link pattern")
    })
}

fn head_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<head[^>]*>").expect("head pattern"))
}

fn js_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r#"(["'`])/({JS_ROUTE_PREFIXES})([^"'`]*)(["'`])"#
        ))
        .expect("js literal pattern")
    })
}

fn max_age_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"max-age=(\d+)").expect("max-age pattern"))
}

const FETCH_PATCH_TEMPLATE: &str = r#"<script>
window.__ORCHESTRATOR_PROXY_BASE__ = '__PROXY_BASE__';
(function () {
  var base = window.__ORCHESTRATOR_PROXY_BASE__;
  var original = window.fetch;
  window.fetch = function (input, init) {
    try {
      var url = typeof input === 'string' ? input : input.url;
      if (url && url.charAt(0) === '/' && url.charAt(1) !== '/' && url.indexOf(base) !== 0) {
        var rerooted = base + url;
        input = typeof input === 'string' ? rerooted : new Request(rerooted, input);
      }
    } catch (e) {}
    return original.call(this, input, init);
  };
})();
</script>"#;

const AUTO_AUTH_TEMPLATE: &str = r#"<script>
(function () {
  try {
    var token = '__TOKEN__';
    var identity = '__IDENTITY__';
    var previous = localStorage.getItem('orchestratorProxyIdentity');
    localStorage.setItem('authToken', token);
    localStorage.setItem('orchestratorProxyIdentity', identity);
    if (previous && previous !== identity) {
      window.location.reload();
    }
  } catch (e) {}
})();
</script>"#;

/// Rewrite a proxied HTML body so it survives being served under `proxy_base`.
///
/// Re-roots root-relative `src`/`href`/`action` attributes (protocol-relative
/// `//` URLs untouched), special-cases service-worker registration, appends a
/// cache-busting query to rewritten script/style URLs, and injects the fetch
/// patch — plus the auto-auth script when a credential was minted — directly
/// after `<head>`.
pub fn rewrite_html(body: &str, proxy_base: &str, identity: Option<&MintedIdentity>) -> String {
    // Service-worker registration first: re-root and carry the prefix as a
    // query so the worker script can scope its own fetches.
    let body = sw_register_re().replace_all(body, |caps: &Captures| {
        let quote = &caps[1];
        let path = &caps[2];
        let sep = if path.contains('?') { '&' } else { '?' };
        format!(
            "register({quote}{proxy_base}{path}{sep}proxyBase={}{quote}",
            encode_component(proxy_base)
        )
    });

    let body = attr_re().replace_all(&body, |caps: &Captures| {
        let path = &caps[3];
        if path.starts_with("//") {
            return caps[0].to_string();
        }
        format!("{}={}{proxy_base}{path}{}", &caps[1], &caps[2], &caps[4])
    });

    let body = append_asset_version(&body, script_src_re(), proxy_base);
    let body = append_asset_version(&body, link_href_re(), proxy_base);

    let mut scripts = fetch_patch_script(proxy_base);
    if let Some(identity) = identity {
        scripts.push_str(&auto_auth_script(identity));
    }
    head_re()
        .replacen(&body, 1, |caps: &Captures| format!("{}{scripts}", &caps[0]))
        .into_owned()
}

/// Rewrite a proxied JavaScript body: re-root allow-listed route prefixes
/// where they start a quoted string literal.
pub fn rewrite_js(body: &str, proxy_base: &str) -> String {
    js_literal_re()
        .replace_all(body, |caps: &Captures| {
            format!(
                "{}{proxy_base}/{}{}{}",
                &caps[1], &caps[2], &caps[3], &caps[4]
            )
        })
        .into_owned()
}

/// Retune caching headers on a rewritten body: the rewritten bytes invalidate
/// the original length and immutability guarantees.
pub fn retune_cache_headers(headers: &mut std::collections::HashMap<String, String>) {
    headers.remove("content-length");
    if let Some(cache) = headers.get("cache-control").cloned() {
        let cache = cache.replace("immutable", "must-revalidate");
        let cache = max_age_re()
            .replace_all(&cache, |caps: &Captures| {
                let secs: u64 = caps[1].parse().unwrap_or(0);
                format!("max-age={}", secs.min(3600))
            })
            .into_owned();
        headers.insert("cache-control".to_string(), cache);
    }
}

fn append_asset_version(body: &str, re: &Regex, proxy_base: &str) -> String {
    re.replace_all(body, |caps: &Captures| {
        let url = &caps[3];
        if !url.starts_with(proxy_base) {
            return caps[0].to_string();
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{url}{sep}v={REWRITE_VERSION}{}",
            &caps[1], &caps[2], &caps[4]
        )
    })
    .into_owned()
}

fn fetch_patch_script(proxy_base: &str) -> String {
    FETCH_PATCH_TEMPLATE.replace("__PROXY_BASE__", proxy_base)
}

fn auto_auth_script(identity: &MintedIdentity) -> String {
    AUTO_AUTH_TEMPLATE
        .replace("__TOKEN__", &identity.token)
        .replace("__IDENTITY__", &identity.user_id)
}

/// Percent-encode a string for use inside a query parameter value.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "/clients/x/proxy";

    #[test]
    fn reroots_root_relative_attributes() {
        let html = r#"<head></head><body><img src="/a.png"></body>"#;
        let out = rewrite_html(html, BASE, None);
        assert!(out.contains(r#"src="/clients/x/proxy/a.png""#));
    }

    #[test]
    fn injects_two_scripts_inside_head() {
        let html = r#"<head></head><body><img src="/a.png"></body>"#;
        let identity = MintedIdentity {
            token: "a.b.c".into(),
            user_id: "u1".into(),
            username: "alice".into(),
        };
        let out = rewrite_html(html, BASE, Some(&identity));
        let head_start = out.find("<head>").unwrap() + "<head>".len();
        let after_head = &out[head_start..];
        assert!(after_head.starts_with("<script>"));
        assert_eq!(out.matches("<script>").count(), 2);
        // Fetch patch comes first, auto-auth second.
        let patch_at = out.find("__ORCHESTRATOR_PROXY_BASE__").unwrap();
        let auth_at = out.find("orchestratorProxyIdentity").unwrap();
        assert!(patch_at < auth_at);
        assert!(out.contains("var token = 'a.b.c';"));
    }

    #[test]
    fn auth_script_omitted_without_identity() {
        let out = rewrite_html("<head></head>", BASE, None);
        assert_eq!(out.matches("<script>").count(), 1);
        assert!(!out.contains("orchestratorProxyIdentity"));
    }

    #[test]
    fn leaves_protocol_relative_urls_alone() {
        let html = r#"<head></head><a href="//cdn.example.com/x.js">x</a>"#;
        let out = rewrite_html(html, BASE, None);
        assert!(out.contains(r#"href="//cdn.example.com/x.js""#));
    }

    #[test]
    fn rewrites_both_quote_styles_and_actions() {
        let html = r#"<head></head><form action='/submit'><a href="/docs">d</a></form>"#;
        let out = rewrite_html(html, BASE, None);
        assert!(out.contains("action='/clients/x/proxy/submit'"));
        assert!(out.contains(r#"href="/clients/x/proxy/docs""#));
    }

    #[test]
    fn service_worker_registration_gets_proxy_base_query() {
        let html = r#"<head></head><script>navigator.serviceWorker.register('/sw.js');</script>"#;
        let out = rewrite_html(html, BASE, None);
        assert!(out.contains(
            "register('/clients/x/proxy/sw.js?proxyBase=%2Fclients%2Fx%2Fproxy'"
        ));
    }

    #[test]
    fn rewritten_script_and_style_urls_get_version_query() {
        let html = concat!(
            "<head></head>",
            r#"<script src="/app.js"></script>"#,
            r#"<link rel="stylesheet" href="/style.css">"#,
            r#"<link rel="icon" href="//cdn.example.com/i.ico">"#,
        );
        let out = rewrite_html(html, BASE, None);
        assert!(out.contains(&format!(
            r#"src="/clients/x/proxy/app.js?v={REWRITE_VERSION}""#
        )));
        assert!(out.contains(&format!(
            r#"href="/clients/x/proxy/style.css?v={REWRITE_VERSION}""#
        )));
        assert!(out.contains(r#"href="//cdn.example.com/i.ico""#));
    }

    #[test]
    fn js_rewrites_quoted_route_literals() {
        let out = rewrite_js(r#"fetch("/api/foo")"#, BASE);
        assert_eq!(out, r#"fetch("/clients/x/proxy/api/foo")"#);

        let out = rewrite_js("const s = io(`/socket.io`);", BASE);
        assert_eq!(out, "const s = io(`/clients/x/proxy/socket.io`);");

        let out = rewrite_js(r#"const icon = '/favicon.ico';"#, BASE);
        assert_eq!(out, r#"const icon = '/clients/x/proxy/favicon.ico';"#);
    }

    #[test]
    fn js_regex_literals_are_untouched() {
        let src = r"const re = /\/api\//;";
        assert_eq!(rewrite_js(src, BASE), src);
    }

    #[test]
    fn js_unlisted_prefixes_are_untouched() {
        let src = r#"fetch("/internal/foo")"#;
        assert_eq!(rewrite_js(src, BASE), src);
    }

    #[test]
    fn cache_headers_are_retuned() {
        let mut headers = std::collections::HashMap::from([
            ("content-length".to_string(), "1234".to_string()),
            (
                "cache-control".to_string(),
                "public, max-age=86400, immutable".to_string(),
            ),
        ]);
        retune_cache_headers(&mut headers);
        assert!(!headers.contains_key("content-length"));
        assert_eq!(
            headers["cache-control"],
            "public, max-age=3600, must-revalidate"
        );
    }

    #[test]
    fn short_max_age_is_kept() {
        let mut headers = std::collections::HashMap::from([(
            "cache-control".to_string(),
            "max-age=60".to_string(),
        )]);
        retune_cache_headers(&mut headers);
        assert_eq!(headers["cache-control"], "max-age=60");
    }
}
