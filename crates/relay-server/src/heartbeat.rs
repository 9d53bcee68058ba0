use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// One heartbeat round over a snapshot of the live connections: connections
/// that never ponged since the previous round are closed and removed; the
/// rest are marked not-alive and pinged.
pub fn run_round(registry: &Registry) -> usize {
    let mut closed = 0;
    for conn in registry.connection_snapshot() {
        if !conn.is_alive() {
            tracing::info!(
                connection_id = %conn.id,
                user = %conn.user,
                last_pong_at = conn.last_pong_at(),
                "heartbeat timeout, closing connection"
            );
            conn.request_close(4000, "heartbeat timeout");
            registry.remove(&conn.user, &conn.id);
            closed += 1;
        } else {
            conn.mark_ping_sent();
        }
    }
    closed
}

/// Periodic heartbeat task. Cancelled at shutdown.
pub fn start_heartbeat(
    registry: Arc<Registry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = run_round(&registry);
                    if closed > 0 {
                        tracing::info!(closed, "heartbeat round closed dead connections");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
