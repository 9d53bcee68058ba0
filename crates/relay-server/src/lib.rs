//! WebSocket gateway: admission, per-user fan-out with a replay window,
//! server-driven heartbeat, and coordinated shutdown.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use registry::{ConnectionHandle, GatewayStats, PublishOutcome, Registry};
pub use server::{build_router, start, Gateway, ServerHandle};
pub use shutdown::ShutdownCoordinator;
