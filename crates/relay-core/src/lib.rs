pub mod clock;
pub mod config;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod policy;
pub mod queue;

pub use config::{ClientConfig, GatewayConfig};
pub use errors::GatewayError;
pub use frame::{Frame, FrameCodec};
pub use ids::{ConnectionId, UserId};
pub use policy::{PolicyConfig, ReconnectPolicy, ReconnectState, RetryDecision};
pub use queue::FrameQueue;
