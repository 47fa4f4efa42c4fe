// Client configuration file.
//
// Default location: `<config dir>/wikisync/client.toml`

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use wikisync_common::settings::SessionSettings;
use wikisync_common::SessionId;

/// Path to the default client config file.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wikisync").join("client.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid relay_url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no session_id configured")]
    MissingSession,
}

/// HTTP Basic credentials presented on the upgrade request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL. `http` and `https` map to `ws` and `wss`.
    pub relay_url: String,
    /// Session provisioned for this client on the relay.
    pub session_id: Option<SessionId>,
    /// Wiki key checked by the relay on upgrade.
    pub key: String,
    /// Room whose default document this client edits.
    pub room: String,
    pub credentials: Option<Credentials>,
    /// Session lifetime declared in the handshake.
    pub session_ttl_secs: u64,
    pub gc_enabled: bool,
    pub session: SessionSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8080".into(),
            session_id: None,
            key: String::new(),
            room: "wiki".into(),
            credentials: None,
            session_ttl_secs: 3_600,
            gc_enabled: true,
            session: SessionSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load from the default path. Returns defaults if the file doesn't
    /// exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|path| Self::load_from(&path).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        restrict_to_owner(path)?;
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Socket URL: `<relay>/ws?session=<id>&wiki=<key>`.
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        let session_id = self.session_id.ok_or(ConfigError::MissingSession)?;
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: self.relay_url.clone(),
            reason: reason.to_owned(),
        };

        let mut url = Url::parse(&self.relay_url).map_err(|err| invalid(&err.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid("scheme must be http, https, ws or wss")),
        };
        url.set_scheme(scheme).map_err(|()| invalid("cannot switch to a websocket scheme"))?;
        if scheme == "ws" && !is_loopback_host(url.host_str()) {
            warn!(relay_url = %self.relay_url, "connecting without TLS to a non-loopback relay");
        }

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("session", &session_id.to_string())
            .append_pair("wiki", &self.key);
        Ok(url)
    }

    /// `Authorization` header value, if credentials are configured.
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|credentials| {
            let raw = format!("{}:{}", credentials.username, credentials.password);
            format!("Basic {}", STANDARD.encode(raw))
        })
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
