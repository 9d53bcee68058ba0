use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::policy::PolicyConfig;

const SESSION_CHECK_MIN: Duration = Duration::from_secs(30);
const SESSION_CHECK_MAX: Duration = Duration::from_secs(600);

/// Server-side gateway configuration. Every field has a baked-in default and
/// an optional `WS_*` environment override.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub port: u16,
    pub path: String,
    pub ping_interval: Duration,
    pub pending_per_user: usize,
    pub max_frame_bytes: usize,
    pub shutdown_grace: Duration,
    /// Per-connection bounded send queue depth.
    pub max_send_queue: usize,
    /// Lifetime dropped-message budget before a slow client is disconnected.
    pub max_total_drops: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            path: "/ws".into(),
            ping_interval: Duration::from_secs(30),
            pending_per_user: 1000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace: Duration::from_secs(10),
            max_send_queue: 256,
            max_total_drops: 100,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: defaults.port,
            path: std::env::var("WS_PATH").unwrap_or(defaults.path),
            ping_interval: env_ms("WS_PING_INTERVAL_MS", defaults.ping_interval),
            pending_per_user: env_num("WS_PENDING_PER_USER", defaults.pending_per_user),
            max_frame_bytes: env_num("WS_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            shutdown_grace: env_ms("WS_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            max_send_queue: defaults.max_send_queue,
            max_total_drops: defaults.max_total_drops,
        }
    }
}

/// Client-side connection manager configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub session_check_interval: Duration,
    pub max_frame_bytes: usize,
    pub policy: PolicyConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 50,
            session_check_interval: Duration::from_secs(120),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            policy: PolicyConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ping_interval: env_ms("WS_PING_INTERVAL_MS", defaults.ping_interval),
            pong_timeout: env_ms("WS_PONG_TIMEOUT_MS", defaults.pong_timeout),
            connect_timeout: defaults.connect_timeout,
            queue_capacity: defaults.queue_capacity,
            session_check_interval: clamp_session_interval(env_ms(
                "WS_SESSION_CHECK_INTERVAL_MS",
                defaults.session_check_interval,
            )),
            max_frame_bytes: env_num("WS_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            policy: PolicyConfig {
                initial_delay: env_ms("WS_INITIAL_RETRY_MS", defaults.policy.initial_delay),
                max_delay: env_ms("WS_MAX_RETRY_MS", defaults.policy.max_delay),
                jitter_factor: env_num("WS_JITTER_FACTOR", defaults.policy.jitter_factor),
                max_attempts: env_num("WS_MAX_ATTEMPTS", defaults.policy.max_attempts),
                circuit_threshold: env_num("WS_CB_THRESHOLD", defaults.policy.circuit_threshold),
                circuit_window: defaults.policy.circuit_window,
                circuit_cooldown: env_ms("WS_CB_COOLDOWN_MS", defaults.policy.circuit_cooldown),
            },
        }
    }
}

/// The session probe interval is clamped to [30s, 600s].
pub fn clamp_session_interval(requested: Duration) -> Duration {
    requested.clamp(SESSION_CHECK_MIN, SESSION_CHECK_MAX)
}

fn env_num<T: FromStr + Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = %default, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_num(key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_defaults_match_protocol() {
        let c = GatewayConfig::default();
        assert_eq!(c.path, "/ws");
        assert_eq!(c.ping_interval, Duration::from_secs(30));
        assert_eq!(c.pending_per_user, 1000);
        assert_eq!(c.max_frame_bytes, 65536);
        assert_eq!(c.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn client_defaults_match_protocol() {
        let c = ClientConfig::default();
        assert_eq!(c.ping_interval, Duration::from_secs(25));
        assert_eq!(c.pong_timeout, Duration::from_secs(10));
        assert_eq!(c.queue_capacity, 50);
        assert_eq!(c.session_check_interval, Duration::from_secs(120));
        assert_eq!(c.policy.max_attempts, 10);
    }

    #[test]
    fn session_interval_clamped_low() {
        assert_eq!(
            clamp_session_interval(Duration::from_secs(5)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn session_interval_clamped_high() {
        assert_eq!(
            clamp_session_interval(Duration::from_secs(3600)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn session_interval_in_range_untouched() {
        assert_eq!(
            clamp_session_interval(Duration::from_secs(120)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn env_num_falls_back_on_missing() {
        assert_eq!(env_num("RELAY_TEST_UNSET_VAR", 42u32), 42);
    }
}
