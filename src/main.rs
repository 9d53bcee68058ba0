use clap::Parser;

use relay_core::GatewayConfig;
use relay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "relay", version, about = "Real-time session gateway")]
struct Args {
    /// Listen port (overrides the default 9090)
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_telemetry(TelemetryConfig {
        json_output: args.json_logs,
        ..Default::default()
    });

    let mut config = GatewayConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }

    let mut handle = relay_server::start(config).await?;
    tracing::info!(port = handle.port, "relay ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some((user, frame)) = handle.inbound.recv() => {
                // No task engine attached in the standalone binary; frames
                // from clients are logged and dropped.
                tracing::debug!(user = %user, kind = %frame.kind, "client frame");
            }
        }
    }

    tracing::info!("shutdown signal received");
    handle.gateway.shutdown().await;
    Ok(())
}
