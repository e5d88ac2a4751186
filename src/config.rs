use std::env;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:3479";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ENDPOINT_ENV: &str = "PARLEY_ENDPOINT";
const TRANSPORT_ENV: &str = "PARLEY_TRANSPORT";

/// Which transport backs the signaling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// In-process fabric, no network. Used by tests and the demo.
    Simulated,
    /// WebSocket connection to a relay endpoint.
    WebSocket,
}

/// Client configuration, environment-overridable.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay endpoint URL for the WebSocket transport.
    pub endpoint: String,
    pub transport: TransportMode,
    /// Reconnection attempt cap; the attempt after the cap is never
    /// scheduled.
    pub max_reconnect_attempts: u32,
    /// First retry delay; doubles on each subsequent attempt.
    pub base_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            transport: TransportMode::WebSocket,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SignalingConfig {
    /// Read `PARLEY_ENDPOINT` and `PARLEY_TRANSPORT` ("simulated" or
    /// "websocket") from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = env::var(ENDPOINT_ENV) {
            config.endpoint = endpoint;
        }
        if let Ok(mode) = env::var(TRANSPORT_ENV) {
            if mode.eq_ignore_ascii_case("simulated") {
                config.transport = TransportMode::Simulated;
            }
        }
        config
    }

    /// Retry delay for the given 1-based attempt: `base * 2^(attempt-1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(factor)
    }
}
