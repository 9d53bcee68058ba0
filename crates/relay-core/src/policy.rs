use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Reconnection backoff and circuit breaker configuration.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub max_attempts: u32,
    pub circuit_threshold: u32,
    pub circuit_window: Duration,
    pub circuit_cooldown: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.5,
            max_attempts: 10,
            circuit_threshold: 5,
            circuit_window: Duration::from_secs(60),
            circuit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Mutable reconnection bookkeeping. Reset wholesale on a successful connect.
#[derive(Clone, Debug, Default)]
pub struct ReconnectState {
    /// Consecutive failures since the last successful connect. Doubles as the
    /// backoff exponent.
    pub attempts: u32,
    pub last_failure_at: Option<Instant>,
    /// Failure streak inside the current circuit window.
    pub failures_in_window: u32,
    pub window_start: Option<Instant>,
    pub circuit_open: bool,
    pub circuit_opened_at: Option<Instant>,
}

/// Outcome of a reconnect decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt a connect.
    Retry(Duration),
    /// The circuit breaker is cooling down; do not attempt yet.
    CircuitOpen,
    /// Attempts are exhausted; this session is done reconnecting.
    GiveUp,
}

/// The single decision oracle for reconnection. `next` is a pure function of
/// (state, now, rng); all mutation goes through `record_failure` /
/// `record_success`.
#[derive(Clone, Debug, Default)]
pub struct ReconnectPolicy {
    config: PolicyConfig,
}

impl ReconnectPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn next(&self, state: &ReconnectState, now: Instant, rng: &mut impl Rng) -> RetryDecision {
        if state.circuit_open {
            if let Some(opened_at) = state.circuit_opened_at {
                if now.duration_since(opened_at) < self.config.circuit_cooldown {
                    return RetryDecision::CircuitOpen;
                }
            }
            // Cooldown elapsed: the circuit auto-closes on this attempt.
        }

        if state.attempts >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }

        let exponent = state.attempts.saturating_sub(1).min(31);
        let base = (self.config.initial_delay.as_millis() as f64 * 2.0_f64.powi(exponent as i32))
            .min(self.config.max_delay.as_millis() as f64);

        let jittered = if self.config.jitter_factor > 0.0 {
            let jitter = rng.gen_range(-self.config.jitter_factor..=self.config.jitter_factor) * base;
            (base + jitter).clamp(0.0, self.config.max_delay.as_millis() as f64)
        } else {
            base
        };

        RetryDecision::Retry(Duration::from_millis(jittered as u64))
    }

    /// Record a failed connect attempt; trips the circuit after `threshold`
    /// consecutive failures inside the circuit window.
    pub fn record_failure(&self, state: &mut ReconnectState, now: Instant) {
        state.attempts = state.attempts.saturating_add(1);
        state.last_failure_at = Some(now);

        let in_window = state
            .window_start
            .is_some_and(|start| now.duration_since(start) <= self.config.circuit_window);
        if in_window {
            state.failures_in_window += 1;
        } else {
            state.window_start = Some(now);
            state.failures_in_window = 1;
        }

        if state.failures_in_window >= self.config.circuit_threshold {
            state.circuit_open = true;
            state.circuit_opened_at = Some(now);
        }
    }

    /// A successful connect resets everything, including the circuit.
    pub fn record_success(&self, state: &mut ReconnectState) {
        *state = ReconnectState::default();
    }
}
