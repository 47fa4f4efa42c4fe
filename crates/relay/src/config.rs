// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use wikisync_common::settings::HeartbeatSettings;
use wikisync_common::SessionId;

use crate::auth::{BasicAuthGate, ANONYMOUS};

const DEV_API_KEY: &str = "wikisync-local-development-key";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `wikisync_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Room secret clients must present on upgrade.
    pub api_key: String,
    /// Upper bound on session lifetime granted at handshake.
    pub session_ttl: Duration,
    pub heartbeat: HeartbeatSettings,
    /// Keep deleted history out of documents. Disabled by `GC=false` or `GC=0`.
    pub gc_enabled: bool,
    /// Snapshot directory; documents are memory-only when unset.
    pub persistence_dir: Option<PathBuf>,
    /// `user:password` pairs for HTTP Basic authentication.
    pub credentials: HashMap<String, String>,
    pub readers: Vec<String>,
    pub writers: Vec<String>,
    pub max_frame_bytes: usize,
    /// Sessions opened at startup for standalone deployments.
    pub sessions: Vec<ProvisionedSession>,
}

/// A session entry from `WIKISYNC_RELAY_SESSIONS`, written `id=room` or
/// `id=room@user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSession {
    pub id: SessionId,
    pub room: String,
    pub username: Option<String>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `WIKISYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `WIKISYNC_RELAY_PORT` | `8080` |
    /// | `WIKISYNC_RELAY_LOG_FILTER` | `info` |
    /// | `WIKISYNC_RELAY_LOG_JSON` | `false` |
    /// | `WIKISYNC_RELAY_API_KEY` | dev-only placeholder |
    /// | `WIKISYNC_RELAY_SESSION_TTL_SECS` | `3600` |
    /// | `WIKISYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `WIKISYNC_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `GC` | enabled |
    /// | `WIKISYNC_RELAY_PERSISTENCE_DIR` | *(none)* |
    /// | `WIKISYNC_RELAY_CREDENTIALS` | *(none)*, comma-separated `user:password` |
    /// | `WIKISYNC_RELAY_READERS` | `(anon)` |
    /// | `WIKISYNC_RELAY_WRITERS` | `(anon)` |
    /// | `WIKISYNC_RELAY_MAX_FRAME_BYTES` | `1048576` |
    /// | `WIKISYNC_RELAY_SESSIONS` | *(none)*, comma-separated `id=room[@user]` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("WIKISYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parsed(&env, "WIKISYNC_RELAY_PORT").unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("WIKISYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("WIKISYNC_RELAY_LOG_JSON").is_ok_and(|value| is_truthy(&value));
        let api_key = env("WIKISYNC_RELAY_API_KEY").unwrap_or_else(|_| DEV_API_KEY.into());
        let session_ttl =
            Duration::from_secs(parsed(&env, "WIKISYNC_RELAY_SESSION_TTL_SECS").unwrap_or(3_600));

        let defaults = HeartbeatSettings::default();
        let heartbeat = HeartbeatSettings {
            interval_ms: parsed(&env, "WIKISYNC_RELAY_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.interval_ms),
            timeout_ms: parsed(&env, "WIKISYNC_RELAY_HEARTBEAT_TIMEOUT_MS")
                .unwrap_or(defaults.timeout_ms),
        };

        let gc_enabled = env("GC").map_or(true, |value| value != "false" && value != "0");
        let persistence_dir = env("WIKISYNC_RELAY_PERSISTENCE_DIR").ok().map(PathBuf::from);

        let credentials = env("WIKISYNC_RELAY_CREDENTIALS")
            .map(|raw| parse_credentials(&raw))
            .unwrap_or_default();
        let readers = env("WIKISYNC_RELAY_READERS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|_| vec![ANONYMOUS.to_string()]);
        let writers = env("WIKISYNC_RELAY_WRITERS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|_| vec![ANONYMOUS.to_string()]);
        let max_frame_bytes = parsed(&env, "WIKISYNC_RELAY_MAX_FRAME_BYTES").unwrap_or(1 << 20);
        let sessions = env("WIKISYNC_RELAY_SESSIONS")
            .map(|raw| parse_sessions(&raw))
            .unwrap_or_default();

        Self {
            listen_addr,
            log_filter,
            log_json,
            api_key,
            session_ttl,
            heartbeat,
            gc_enabled,
            persistence_dir,
            credentials,
            readers,
            writers,
            max_frame_bytes,
            sessions,
        }
    }

    /// Returns true when using the development-only API key.
    pub fn is_dev_api_key(&self) -> bool {
        self.api_key == DEV_API_KEY
    }

    pub fn auth_gate(&self) -> BasicAuthGate {
        BasicAuthGate::new(self.credentials.clone(), self.readers.clone(), self.writers.clone())
    }
}

fn parsed<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_owned).collect()
}

fn parse_credentials(raw: &str) -> HashMap<String, String> {
    split_list(raw)
        .into_iter()
        .filter_map(|pair| {
            let (user, password) = pair.split_once(':')?;
            Some((user.to_owned(), password.to_owned()))
        })
        .collect()
}

fn parse_sessions(raw: &str) -> Vec<ProvisionedSession> {
    split_list(raw)
        .into_iter()
        .filter_map(|entry| {
            let (id, target) = entry.split_once('=')?;
            let id = id.trim().parse().ok()?;
            let (room, username) = match target.split_once('@') {
                Some((room, user)) => (room, Some(user.trim().to_owned())),
                None => (target, None),
            };
            let room = room.trim();
            (!room.is_empty()).then(|| ProvisionedSession { id, room: room.to_owned(), username })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.log_json);
        assert!(cfg.is_dev_api_key());
        assert_eq!(cfg.session_ttl, Duration::from_secs(3_600));
        assert_eq!(cfg.heartbeat, HeartbeatSettings::default());
        assert!(cfg.gc_enabled);
        assert!(cfg.persistence_dir.is_none());
        assert!(cfg.credentials.is_empty());
        assert_eq!(cfg.readers, vec!["(anon)".to_string()]);
        assert_eq!(cfg.writers, vec!["(anon)".to_string()]);
        assert!(cfg.sessions.is_empty());
    }

    #[test]
    fn provisioned_sessions_are_parsed() {
        let mut m = HashMap::new();
        m.insert(
            "WIKISYNC_RELAY_SESSIONS",
            "11111111-2222-4333-8444-555555555555=wiki@alice, 11111111-2222-4333-8444-666666666666=notes,bad=wiki,00000000-0000-0000-0000-000000000000=nil",
        );
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.sessions.len(), 2);
        assert_eq!(cfg.sessions[0].room, "wiki");
        assert_eq!(cfg.sessions[0].username.as_deref(), Some("alice"));
        assert_eq!(cfg.sessions[1].room, "notes");
        assert_eq!(cfg.sessions[1].username, None);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("WIKISYNC_RELAY_HOST", "127.0.0.1");
        m.insert("WIKISYNC_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn gc_can_be_disabled() {
        for value in ["false", "0"] {
            let mut m = HashMap::new();
            m.insert("GC", value);
            assert!(!RelayConfig::from_env_fn(env_from_map(m)).gc_enabled);
        }
        let mut m = HashMap::new();
        m.insert("GC", "true");
        assert!(RelayConfig::from_env_fn(env_from_map(m)).gc_enabled);
    }

    #[test]
    fn heartbeat_and_ttl_overrides() {
        let mut m = HashMap::new();
        m.insert("WIKISYNC_RELAY_HEARTBEAT_INTERVAL_MS", "2000");
        m.insert("WIKISYNC_RELAY_HEARTBEAT_TIMEOUT_MS", "500");
        m.insert("WIKISYNC_RELAY_SESSION_TTL_SECS", "60");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.heartbeat, HeartbeatSettings { interval_ms: 2_000, timeout_ms: 500 });
        assert_eq!(cfg.session_ttl, Duration::from_secs(60));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let mut m = HashMap::new();
        m.insert("WIKISYNC_RELAY_PORT", "not-a-port");
        m.insert("WIKISYNC_RELAY_HEARTBEAT_INTERVAL_MS", "-5");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.heartbeat.interval_ms, 15_000);
    }

    #[test]
    fn credentials_and_scopes_are_parsed() {
        let mut m = HashMap::new();
        m.insert("WIKISYNC_RELAY_CREDENTIALS", "alice:secret, bob:pa:ss ,broken");
        m.insert("WIKISYNC_RELAY_READERS", "(authenticated)");
        m.insert("WIKISYNC_RELAY_WRITERS", "alice");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.credentials.get("alice").map(String::as_str), Some("secret"));
        assert_eq!(cfg.credentials.get("bob").map(String::as_str), Some("pa:ss"));
        assert_eq!(cfg.credentials.len(), 2);
        assert_eq!(cfg.readers, vec!["(authenticated)".to_string()]);
        assert_eq!(cfg.writers, vec!["alice".to_string()]);
    }

    #[test]
    fn persistence_dir_and_json_logs() {
        let mut m = HashMap::new();
        m.insert("WIKISYNC_RELAY_PERSISTENCE_DIR", "/var/lib/wikisync");
        m.insert("WIKISYNC_RELAY_LOG_JSON", "true");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.persistence_dir, Some(PathBuf::from("/var/lib/wikisync")));
        assert!(cfg.log_json);
    }
}
