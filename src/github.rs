//! GitHub-backed authorization for proxied user requests.
//!
//! A bearer token is validated against an org/team/user allow-list via the
//! GitHub REST API. With no rule configured every request is rejected —
//! secure by default. Rules resolve cheapest-first: the username allow-list
//! needs no call beyond resolving the caller, team membership one call, org
//! membership one call with a list-orgs fallback for reduced token scopes.
//!
//! Calls are stateless; repeated validation of the same token is correct.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub use crate::config::GithubAuthConfig;

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("hublink/", env!("CARGO_PKG_VERSION"));

/// How a caller was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    GithubUser,
    GithubTeam,
    GithubOrg,
}

/// The identity of an authorized caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizedUser {
    pub id: u64,
    pub username: String,
    pub method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Serialize)]
pub struct AuthDecision {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthorizedUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthDecision {
    fn denied(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            user: None,
            error: Some(error.into()),
        }
    }

    fn granted(user: AuthorizedUser) -> Self {
        Self {
            authenticated: true,
            user: Some(user),
            error: None,
        }
    }
}

/// Caller identity resolved from `GET /user`.
struct Caller {
    id: u64,
    login: String,
}

enum MembershipCheck {
    Member,
    NotMember,
}

pub struct GithubAuthorizer {
    http: reqwest::Client,
    config: GithubAuthConfig,
    api_base: String,
}

impl GithubAuthorizer {
    pub fn new(config: GithubAuthConfig) -> Self {
        Self::with_api_base(config, GITHUB_API_BASE)
    }

    /// Same as [`new`](Self::new) with the API base overridden — used by tests
    /// to point at a local mock.
    pub fn with_api_base(config: GithubAuthConfig, api_base: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            config,
            api_base: api_base.into(),
        }
    }

    fn has_rules(&self) -> bool {
        self.config.allowed_org.is_some()
            || self.config.allowed_team.is_some()
            || !self.config.allowed_users.is_empty()
    }

    /// The team rule as `(org, team-slug)`. Accepts `org/team-slug`, or a bare
    /// slug combined with `allowed_org`.
    fn team_rule(&self) -> Option<(String, String)> {
        let team = self.config.allowed_team.as_deref()?;
        if let Some((org, slug)) = team.split_once('/') {
            return Some((org.to_string(), slug.to_string()));
        }
        self.config
            .allowed_org
            .as_ref()
            .map(|org| (org.clone(), team.to_string()))
    }

    /// Validate a bearer token against the configured allow-list.
    pub async fn authorize(&self, token: Option<&str>) -> AuthDecision {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return AuthDecision::denied("missing bearer token");
        };
        if !self.has_rules() {
            return AuthDecision::denied("no authorization rules configured");
        }

        let caller = match self.fetch_caller(token).await {
            Ok(caller) => caller,
            Err(e) => return AuthDecision::denied(e),
        };

        // 1. Username allow-list — cheapest, no further calls.
        if self
            .config
            .allowed_users
            .iter()
            .any(|u| u.eq_ignore_ascii_case(&caller.login))
        {
            debug!(username = %caller.login, "Authorized via user allow-list");
            return AuthDecision::granted(AuthorizedUser {
                id: caller.id,
                username: caller.login,
                method: AuthMethod::GithubUser,
                org: None,
                team: None,
            });
        }

        // 2. Team membership.
        if let Some((org, team)) = self.team_rule() {
            if let MembershipCheck::Member =
                self.check_team(token, &org, &team, &caller.login).await
            {
                debug!(username = %caller.login, org = %org, team = %team, "Authorized via team membership");
                return AuthDecision::granted(AuthorizedUser {
                    id: caller.id,
                    username: caller.login,
                    method: AuthMethod::GithubTeam,
                    org: Some(org),
                    team: Some(team),
                });
            }
        }

        // 3. Org membership.
        if let Some(org) = self.config.allowed_org.clone() {
            if let MembershipCheck::Member = self.check_org(token, &org).await {
                debug!(username = %caller.login, org = %org, "Authorized via org membership");
                return AuthDecision::granted(AuthorizedUser {
                    id: caller.id,
                    username: caller.login,
                    method: AuthMethod::GithubOrg,
                    org: Some(org),
                    team: None,
                });
            }
        }

        AuthDecision::denied(format!(
            "user {} matched no allow-list rule",
            caller.login
        ))
    }

    async fn get(&self, token: &str, path: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.http
            .get(format!("{}{path}", self.api_base))
            .header("authorization", format!("Bearer {token}"))
            .header("accept", "application/vnd.github+json")
            .header("user-agent", USER_AGENT)
            .send()
            .await
    }

    async fn fetch_caller(&self, token: &str) -> Result<Caller, String> {
        let response = self
            .get(token, "/user")
            .await
            .map_err(|e| format!("GitHub user lookup failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "token rejected by GitHub ({})",
                response.status().as_u16()
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("GitHub user lookup returned invalid JSON: {e}"))?;
        let login = body
            .get("login")
            .and_then(Value::as_str)
            .ok_or_else(|| "GitHub user lookup returned no login".to_string())?;
        Ok(Caller {
            id: body.get("id").and_then(Value::as_u64).unwrap_or(0),
            login: login.to_string(),
        })
    }

    /// 404 means not a member; any other failure fails closed.
    async fn check_team(
        &self,
        token: &str,
        org: &str,
        team: &str,
        username: &str,
    ) -> MembershipCheck {
        let path = format!("/orgs/{org}/teams/{team}/memberships/{username}");
        match self.get(token, &path).await {
            Ok(response) if response.status().is_success() => {
                let state = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("state").and_then(Value::as_str).map(ToString::to_string));
                if state.as_deref() == Some("active") {
                    MembershipCheck::Member
                } else {
                    MembershipCheck::NotMember
                }
            }
            Ok(response) if response.status().as_u16() == 404 => MembershipCheck::NotMember,
            Ok(response) => {
                warn!(
                    org,
                    team,
                    status = response.status().as_u16(),
                    "Team membership check failed, treating as not a member"
                );
                MembershipCheck::NotMember
            }
            Err(e) => {
                warn!(org, team, "Team membership check failed: {e}");
                MembershipCheck::NotMember
            }
        }
    }

    /// Primary check is the caller's own membership record. 404 means not a
    /// member; other failures fall back to listing orgs and matching by name,
    /// which works with reduced token scopes.
    async fn check_org(&self, token: &str, org: &str) -> MembershipCheck {
        let path = format!("/user/memberships/orgs/{org}");
        match self.get(token, &path).await {
            Ok(response) if response.status().is_success() => {
                let state = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("state").and_then(Value::as_str).map(ToString::to_string));
                if state.as_deref() == Some("active") {
                    MembershipCheck::Member
                } else {
                    MembershipCheck::NotMember
                }
            }
            Ok(response) if response.status().as_u16() == 404 => MembershipCheck::NotMember,
            Ok(response) => {
                debug!(
                    org,
                    status = response.status().as_u16(),
                    "Org membership lookup failed, falling back to org listing"
                );
                self.check_org_by_listing(token, org).await
            }
            Err(e) => {
                debug!(org, "Org membership lookup failed ({e}), falling back to org listing");
                self.check_org_by_listing(token, org).await
            }
        }
    }

    async fn check_org_by_listing(&self, token: &str, org: &str) -> MembershipCheck {
        match self.get(token, "/user/orgs").await {
            Ok(response) if response.status().is_success() => {
                let orgs: Vec<Value> = response.json().await.unwrap_or_default();
                let member = orgs.iter().any(|o| {
                    o.get("login")
                        .and_then(Value::as_str)
                        .is_some_and(|login| login.eq_ignore_ascii_case(org))
                });
                if member {
                    MembershipCheck::Member
                } else {
                    MembershipCheck::NotMember
                }
            }
            Ok(response) => {
                warn!(
                    org,
                    status = response.status().as_u16(),
                    "Org listing fallback failed, treating as not a member"
                );
                MembershipCheck::NotMember
            }
            Err(e) => {
                warn!(org, "Org listing fallback failed: {e}");
                MembershipCheck::NotMember
            }
        }
    }
}
