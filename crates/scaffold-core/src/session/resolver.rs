use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use sha2::{Digest, Sha256};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";
const IP_HASH_HEX_LEN: usize = 16;

pub const DEFAULT_SESSION_HEADER: &str = "X-App-Session";
pub const DEFAULT_SESSION_QUERY_PARAM: &str = "session";
pub const DEFAULT_SESSION_COOKIE: &str = "app_session";
pub const DEFAULT_SESSION_KEY: &str = "default";
pub const DEFAULT_IP_SESSION_PREFIX: &str = "ip_";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolverConfig {
    pub header_name: String,
    pub query_param: String,
    pub cookie_name: String,
    pub default_session: String,
    pub ip_session_prefix: String,
    pub session_isolation: bool,
    pub auto_map_by_ip: bool,
    pub full_auth: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_SESSION_HEADER.to_string(),
            query_param: DEFAULT_SESSION_QUERY_PARAM.to_string(),
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            default_session: DEFAULT_SESSION_KEY.to_string(),
            ip_session_prefix: DEFAULT_IP_SESSION_PREFIX.to_string(),
            session_isolation: true,
            auto_map_by_ip: true,
            full_auth: false,
        }
    }
}

/// What an inbound request tells us about its caller.
#[derive(Clone, Debug, Default)]
pub struct RequestFacts {
    user_id: Option<String>,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    cookies: HashMap<String, String>,
    remote_addr: Option<String>,
}

impl RequestFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        non_empty(self.headers.get(&name.to_ascii_lowercase()))
    }

    /// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header_value(FORWARDED_FOR_HEADER)
            && let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty())
        {
            return first.to_string();
        }
        if let Some(real_ip) = self.header_value(REAL_IP_HEADER) {
            return real_ip.trim().to_string();
        }
        non_empty(self.remote_addr.as_ref())
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    User,
    Header,
    Query,
    Cookie,
    ClientIp,
    Default,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedSession {
    /// Unsanitized key; the factory sanitizes it on lookup.
    pub raw_key: String,
    pub source: SessionSource,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSessionMapping {
    pub ip: String,
    pub session_key: String,
}

/// Picks the session a request belongs to.
pub struct SessionResolver {
    config: ResolverConfig,
    ip_mappings: Mutex<BTreeMap<String, String>>,
}

impl SessionResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            ip_mappings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn resolve(&self, facts: &RequestFacts) -> ResolvedSession {
        if !self.config.session_isolation {
            return self.default_session();
        }

        if self.config.full_auth
            && let Some(user_id) = non_empty(facts.user_id.as_ref())
        {
            return resolved(user_id, SessionSource::User);
        }
        if let Some(key) = facts.header_value(&self.config.header_name) {
            return resolved(key, SessionSource::Header);
        }
        if let Some(key) = non_empty(facts.query.get(&self.config.query_param)) {
            return resolved(key, SessionSource::Query);
        }
        if let Some(key) = non_empty(facts.cookies.get(&self.config.cookie_name)) {
            return resolved(key, SessionSource::Cookie);
        }
        if self.config.auto_map_by_ip {
            let ip = facts.client_ip();
            let key = self.ip_session_key(&ip);
            if let Ok(mut mappings) = self.ip_mappings.lock()
                && mappings.insert(ip.clone(), key.clone()).is_none()
            {
                tracing::debug!(session = %key, "mapped client address to session");
            }
            return resolved(&key, SessionSource::ClientIp);
        }

        self.default_session()
    }

    /// `prefix` followed by the first 16 hex digits of SHA-256 over the address.
    pub fn ip_session_key(&self, ip: &str) -> String {
        let digest = Sha256::digest(ip.as_bytes());
        let hex: String = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        format!("{}{}", self.config.ip_session_prefix, &hex[..IP_HASH_HEX_LEN])
    }

    pub fn ip_mappings(&self) -> Vec<IpSessionMapping> {
        self.ip_mappings
            .lock()
            .map(|mappings| {
                mappings
                    .iter()
                    .map(|(ip, session_key)| IpSessionMapping {
                        ip: ip.clone(),
                        session_key: session_key.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_ip_mappings(&self) -> usize {
        match self.ip_mappings.lock() {
            Ok(mut mappings) => {
                let cleared = mappings.len();
                mappings.clear();
                cleared
            }
            Err(_) => 0,
        }
    }

    fn default_session(&self) -> ResolvedSession {
        resolved(&self.config.default_session, SessionSource::Default)
    }
}

fn resolved(key: &str, source: SessionSource) -> ResolvedSession {
    ResolvedSession {
        raw_key: key.to_string(),
        source,
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::{RequestFacts, ResolverConfig, SessionResolver, SessionSource};

    fn resolver() -> SessionResolver {
        SessionResolver::new(ResolverConfig::default())
    }

    #[test]
    fn header_beats_query_and_cookie() {
        let facts = RequestFacts::new()
            .header("x-app-session", "from-header")
            .query("session", "from-query")
            .cookie("app_session", "from-cookie");

        let session = resolver().resolve(&facts);
        assert_eq!(session.raw_key, "from-header");
        assert_eq!(session.source, SessionSource::Header);
    }

    #[test]
    fn query_then_cookie_are_fallbacks() {
        let by_query = resolver().resolve(&RequestFacts::new().query("session", "q"));
        assert_eq!(by_query.source, SessionSource::Query);

        let by_cookie = resolver().resolve(&RequestFacts::new().cookie("app_session", "c"));
        assert_eq!(by_cookie.raw_key, "c");
        assert_eq!(by_cookie.source, SessionSource::Cookie);
    }

    #[test]
    fn same_ip_maps_to_same_hashed_key() {
        let resolver = resolver();
        let first = resolver.resolve(&RequestFacts::new().header("X-Forwarded-For", "192.168.1.100"));
        let second =
            resolver.resolve(&RequestFacts::new().header("X-Forwarded-For", "192.168.1.100, 10.0.0.1"));
        let other = resolver.resolve(&RequestFacts::new().header("X-Forwarded-For", "192.168.1.101"));

        assert_eq!(first.source, SessionSource::ClientIp);
        assert_eq!(first.raw_key, second.raw_key);
        assert_ne!(first.raw_key, other.raw_key);
        assert!(first.raw_key.starts_with("ip_"));
        assert_eq!(first.raw_key.len(), "ip_".len() + 16);
        assert!(first.raw_key[3..].chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(resolver.ip_mappings().len(), 2);
        assert_eq!(resolver.clear_ip_mappings(), 2);
        assert!(resolver.ip_mappings().is_empty());
    }

    #[test]
    fn client_ip_falls_back_through_real_ip_and_peer() {
        assert_eq!(
            RequestFacts::new().header("X-Real-IP", "10.1.1.1").client_ip(),
            "10.1.1.1"
        );
        assert_eq!(
            RequestFacts::new().remote_addr("127.0.0.1").client_ip(),
            "127.0.0.1"
        );
        assert_eq!(RequestFacts::new().client_ip(), "unknown");
    }

    #[test]
    fn user_id_wins_only_in_full_auth_mode() {
        let facts = RequestFacts::new().user("user-42").header("X-App-Session", "h");
        assert_eq!(resolver().resolve(&facts).source, SessionSource::Header);

        let full = SessionResolver::new(ResolverConfig {
            full_auth: true,
            ..ResolverConfig::default()
        });
        let session = full.resolve(&facts);
        assert_eq!(session.raw_key, "user-42");
        assert_eq!(session.source, SessionSource::User);
    }

    #[test]
    fn disabled_isolation_always_uses_default_session() {
        let resolver = SessionResolver::new(ResolverConfig {
            session_isolation: false,
            ..ResolverConfig::default()
        });
        let session = resolver.resolve(&RequestFacts::new().header("X-App-Session", "h"));
        assert_eq!(session.raw_key, "default");
        assert_eq!(session.source, SessionSource::Default);
    }

    #[test]
    fn without_ip_mapping_unidentified_requests_share_default() {
        let resolver = SessionResolver::new(ResolverConfig {
            auto_map_by_ip: false,
            ..ResolverConfig::default()
        });
        let session = resolver.resolve(&RequestFacts::new().remote_addr("10.0.0.9"));
        assert_eq!(session.source, SessionSource::Default);
        assert!(resolver.ip_mappings().is_empty());
    }
}
