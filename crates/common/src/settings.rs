// Timing knobs shared by both ends of a connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_DECAY: f64 = 1.5;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub heartbeat: HeartbeatSettings,
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Quiet period before a ping is sent.
    pub interval_ms: u64,
    /// Grace period after the ping before the connection is declared dead.
    pub timeout_ms: u64,
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Reconnect automatically after abnormal closes.
    pub auto: bool,
    /// Closes before `connected` tolerated in a row before giving up.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub decay: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            auto: true,
            max_retries: DEFAULT_RECONNECT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            decay: DEFAULT_RECONNECT_DECAY,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"heartbeat":{"interval_ms":500}}"#).expect("valid settings");
        assert_eq!(settings.heartbeat.interval(), Duration::from_millis(500));
        assert_eq!(settings.heartbeat.timeout(), Duration::from_millis(10_000));
        assert_eq!(settings.reconnect, ReconnectSettings::default());
    }
}
