//! Client-side connection manager: lifecycle state machine, heartbeat with a
//! pong deadline, backoff reconnection behind a circuit breaker, bounded
//! queueing across disconnects, and subscriber fan-out.

pub mod fanout;
pub mod manager;
pub mod session;
pub mod state;
pub mod transport;

pub use fanout::{SubscriberSet, Subscription};
pub use manager::RelayClient;
pub use session::{AlwaysValid, SessionStatus, SessionValidator};
pub use state::ClientState;
pub use transport::{Transport, TransportEvent, TransportLink, WsTransport};
