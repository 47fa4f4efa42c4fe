//! Backoff schedule for reopening a dropped relay connection.

use std::time::Duration;

use rand::Rng;
use wikisync_common::settings::ReconnectSettings;
use wikisync_common::types::{CLOSE_INVALID_SESSION, CLOSE_NORMAL};

/// What to do after the socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Open a fresh connection after the delay.
    Retry(Duration),
    /// Clean close: stay disconnected until asked to connect again.
    Stop,
    /// Invalid session or retry budget exhausted. Terminal.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub auto: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub decay: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(ReconnectSettings::default())
    }
}

impl From<ReconnectSettings> for ReconnectPolicy {
    fn from(settings: ReconnectSettings) -> Self {
        Self {
            auto: settings.auto,
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            decay: settings.decay,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// `min(max, round(sample * base * decay^unsuccessful))` for `sample` in `[0, 1]`.
    pub fn delay_for_sample(&self, unsuccessful: u32, sample: f64) -> Duration {
        let exponent = i32::try_from(unsuccessful).unwrap_or(i32::MAX);
        let scaled = sample * self.base_delay.as_millis() as f64 * self.decay.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        // Float-to-int casts saturate, and NaN becomes zero.
        Duration::from_millis(scaled.round().min(max_ms).max(0.0) as u64)
    }

    pub fn delay<R: Rng + ?Sized>(&self, unsuccessful: u32, rng: &mut R) -> Duration {
        self.delay_for_sample(unsuccessful, rng.gen::<f64>())
    }

    pub fn decide<R: Rng + ?Sized>(
        &self,
        close_code: u16,
        unsuccessful: u32,
        rng: &mut R,
    ) -> ReconnectDecision {
        if close_code == CLOSE_INVALID_SESSION || !self.auto || unsuccessful > self.max_retries {
            return ReconnectDecision::GiveUp;
        }
        if close_code == CLOSE_NORMAL {
            return ReconnectDecision::Stop;
        }
        ReconnectDecision::Retry(self.delay(unsuccessful, rng))
    }
}
