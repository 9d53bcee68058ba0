use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON-formatted lines instead of human-readable output.
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_output: false,
        }
    }
}

/// Initialize the tracing subscriber. Call once at startup; subsequent calls
/// are no-ops so tests can call it freely.
pub fn init_telemetry(config: TelemetryConfig) {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = if config.json_output {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = TelemetryConfig::default();
        assert_eq!(c.log_level, Level::INFO);
        assert!(c.module_levels.is_empty());
        assert!(!c.json_output);
    }

    #[test]
    fn init_is_idempotent() {
        init_telemetry(TelemetryConfig::default());
        init_telemetry(TelemetryConfig {
            json_output: true,
            ..Default::default()
        });
        tracing::debug!("telemetry initialized twice without panicking");
    }

    #[test]
    fn module_levels_build_filter() {
        init_telemetry(TelemetryConfig {
            module_levels: vec![("relay_server".into(), Level::DEBUG)],
            ..Default::default()
        });
    }
}
