use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior, Sleep};

use relay_core::frame::kind;
use relay_core::{
    ClientConfig, Frame, FrameCodec, FrameQueue, GatewayError, ReconnectPolicy, ReconnectState,
    RetryDecision, UserId,
};

use crate::fanout::{SubscriberSet, Subscription};
use crate::session::{AlwaysValid, SessionStatus, SessionValidator};
use crate::state::ClientState;
use crate::transport::{Transport, TransportEvent, TransportLink, WsTransport};

enum Command {
    Initialize { user: UserId, is_authenticated: bool },
    Send(Frame),
    UpdateAuth { user: UserId, is_authenticated: bool },
    Visibility { visible: bool },
    Close,
}

struct Shared {
    state: Mutex<ClientState>,
    queue_dropped: AtomicU64,
    closed: AtomicBool,
}

/// Client-side connection manager. All lifecycle decisions run on a single
/// actor task; this handle posts commands to it and reads shared snapshots.
pub struct RelayClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    subscribers: SubscriberSet,
    shared: Arc<Shared>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_parts(url, config, Arc::new(WsTransport), Arc::new(AlwaysValid))
    }

    /// Full constructor with the transport and session-probe seams exposed.
    pub fn with_parts(
        url: impl Into<String>,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn SessionValidator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let subscribers = SubscriberSet::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState::Disconnected),
            queue_dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let codec = FrameCodec::new(config.max_frame_bytes);
        let queue = FrameQueue::new(config.queue_capacity);
        let policy = ReconnectPolicy::new(config.policy.clone());
        let actor = Actor {
            url: url.into(),
            config,
            codec,
            transport,
            validator,
            subscribers: subscribers.clone(),
            shared: Arc::clone(&shared),
            cmd_rx,
            queue,
            policy,
            reconnect: ReconnectState::default(),
            // Until `initialize` supplies a real identity, this client is a
            // guest; the id lives as long as the client instance.
            identity: Identity {
                user: UserId::guest(),
                is_authenticated: false,
            },
            visible: true,
            seq: 0,
            rng: StdRng::from_entropy(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            subscribers,
            shared,
        }
    }

    /// Register a listener for inbound and synthetic frames.
    pub fn subscribe(&self, callback: impl Fn(&Frame) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(callback)
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    /// Start (or restart) the connection under the given identity.
    pub fn initialize(&self, user: UserId, is_authenticated: bool) {
        self.shared.closed.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Initialize {
            user,
            is_authenticated,
        });
    }

    /// Send a frame, or queue it while no connection is live.
    pub fn send(&self, frame: Frame) {
        let _ = self.cmd_tx.send(Command::Send(frame));
    }

    /// See the auth-update contract: same pair is a no-op, a flag flip rides
    /// the open socket, an identity change reconnects and clears the queue.
    pub fn update_auth(&self, user: UserId, is_authenticated: bool) {
        let _ = self.cmd_tx.send(Command::UpdateAuth {
            user,
            is_authenticated,
        });
    }

    /// Page-visibility signal. A hidden page suspends the heartbeat but keeps
    /// the socket; a visible edge restarts an idle client.
    pub fn set_visible(&self, visible: bool) {
        let _ = self.cmd_tx.send(Command::Visibility { visible });
    }

    /// Idempotent. Drops the socket and cancels timers without touching the
    /// queue; a later `initialize` replays it.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Frames evicted from the outbound queue since construction.
    pub fn queue_dropped(&self) -> u64 {
        self.shared.queue_dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone, PartialEq, Eq)]
struct Identity {
    user: UserId,
    is_authenticated: bool,
}

/// Why an established connection ended.
enum SessionEnd {
    /// Explicit close; no reconnection.
    Closed,
    /// Transport loss, heartbeat timeout, or session expiry; backoff applies.
    Lost(GatewayError),
    /// Identity changed; reconnect immediately with a fresh backoff.
    Restart,
}

struct Actor {
    url: String,
    config: ClientConfig,
    codec: FrameCodec,
    transport: Arc<dyn Transport>,
    validator: Arc<dyn SessionValidator>,
    subscribers: SubscriberSet,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    queue: FrameQueue,
    policy: ReconnectPolicy,
    reconnect: ReconnectState,
    identity: Identity,
    visible: bool,
    seq: u64,
    rng: StdRng,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return;
            };
            if self.handle_idle_command(cmd) {
                self.run_session().await;
            }
        }
    }

    fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn enter(&mut self, state: ClientState) {
        *self.shared.state.lock() = state;
        self.seq += 1;
        self.emit(Frame::connection_state(state.as_str(), self.seq));
    }

    fn emit(&self, frame: Frame) {
        // After close() only lifecycle edges are announced.
        if self.closed() && !frame.is_kind(kind::CONNECTION_STATE) {
            return;
        }
        self.subscribers.deliver(&frame);
    }

    fn enqueue(&mut self, frame: Frame) {
        if self.queue.push(frame).is_some() {
            self.shared.queue_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns true when a connection session should start.
    fn handle_idle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Initialize {
                user,
                is_authenticated,
            } => {
                self.identity = Identity {
                    user,
                    is_authenticated,
                };
                self.reconnect = ReconnectState::default();
                true
            }
            Command::Send(frame) => {
                self.enqueue(frame);
                false
            }
            Command::UpdateAuth {
                user,
                is_authenticated,
            } => {
                if self.identity.user != user {
                    self.queue.clear();
                }
                self.identity = Identity {
                    user,
                    is_authenticated,
                };
                false
            }
            Command::Visibility { visible } => {
                self.visible = visible;
                visible && self.state().is_restartable() && !self.closed()
            }
            Command::Close => {
                if self.state() != ClientState::Disconnected {
                    self.enter(ClientState::Disconnected);
                }
                false
            }
        }
    }

    /// One connection session: Connecting, Connected, and the Reconnecting
    /// cycles in between. Returns with the state at Disconnected or Failed.
    async fn run_session(&mut self) {
        loop {
            if self.closed() {
                self.enter(ClientState::Disconnected);
                return;
            }
            self.enter(ClientState::Connecting);
            match self.try_connect().await {
                Ok(link) => {
                    self.policy.record_success(&mut self.reconnect);
                    self.enter(ClientState::Connected);
                    match self.run_connected(link).await {
                        SessionEnd::Closed => {
                            self.enter(ClientState::Disconnected);
                            return;
                        }
                        SessionEnd::Restart => continue,
                        SessionEnd::Lost(err) => {
                            tracing::warn!(error = %err, "connection lost");
                            self.policy.record_failure(&mut self.reconnect, Instant::now());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connect failed");
                    self.policy.record_failure(&mut self.reconnect, Instant::now());
                }
            }

            self.enter(ClientState::Reconnecting);
            match self.policy.next(&self.reconnect, Instant::now(), &mut self.rng) {
                RetryDecision::Retry(delay) => {
                    self.emit(Frame::reconnecting(
                        self.reconnect.attempts,
                        self.policy.config().max_attempts,
                        delay.as_millis() as u64,
                    ));
                    if !self.wait_backoff(delay).await {
                        return;
                    }
                }
                RetryDecision::CircuitOpen => {
                    tracing::warn!("reconnect circuit open, waiting out cooldown");
                    if !self.wait_backoff(self.policy.config().circuit_cooldown).await {
                        return;
                    }
                }
                RetryDecision::GiveUp => {
                    let err = GatewayError::PolicyExhausted {
                        attempts: self.reconnect.attempts,
                    };
                    tracing::warn!(error = %err, "giving up on reconnection");
                    self.emit(Frame::connection_failed());
                    self.enter(ClientState::Failed);
                    return;
                }
            }
        }
    }

    async fn try_connect(&mut self) -> Result<Box<dyn TransportLink>, GatewayError> {
        let url = self.connect_url();
        match timeout(self.config.connect_timeout, self.transport.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transport("connect timed out".into())),
        }
    }

    fn connect_url(&self) -> String {
        format!(
            "{}?user={}&isAuthenticated={}",
            self.url, self.identity.user, self.identity.is_authenticated
        )
    }

    /// Sleep out a backoff delay while still servicing commands. Returns
    /// false when the session is over (close or handle dropped).
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::Close) => {
                        self.enter(ClientState::Disconnected);
                        return false;
                    }
                    Some(Command::Send(frame)) => self.enqueue(frame),
                    Some(Command::Initialize { user, is_authenticated }) => {
                        self.identity = Identity { user, is_authenticated };
                        self.reconnect = ReconnectState::default();
                        return true;
                    }
                    Some(Command::UpdateAuth { user, is_authenticated }) => {
                        if self.identity.user != user {
                            self.queue.clear();
                        }
                        self.identity = Identity { user, is_authenticated };
                    }
                    Some(Command::Visibility { visible }) => self.visible = visible,
                },
            }
        }
    }

    async fn run_connected(&mut self, mut link: Box<dyn TransportLink>) -> SessionEnd {
        if let Err(err) = self.drain_queue(&mut link).await {
            return SessionEnd::Lost(err);
        }

        let mut ping_timer = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session_timer = interval_at(
            Instant::now() + self.config.session_check_interval,
            self.config.session_check_interval,
        );
        session_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;
        let (probe_tx, mut probe_rx) = mpsc::channel::<SessionStatus>(4);

        loop {
            let heartbeat_active = self.visible;
            tokio::select! {
                event = link.next_event() => match event {
                    Some(TransportEvent::Text(text)) => {
                        self.handle_text(&mut link, &text, &mut pong_deadline).await;
                    }
                    Some(TransportEvent::Pong) => {
                        pong_deadline = None;
                    }
                    // The transport layer answers protocol pings itself.
                    Some(TransportEvent::Ping) => {}
                    Some(TransportEvent::Binary) => {
                        let err = GatewayError::Unsupported("binary frame");
                        tracing::warn!(kind = err.error_kind(), "rejecting binary frame");
                        self.emit(Frame::error(err.to_string()));
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        if code == Some(4003) {
                            self.emit(Frame::session_expired());
                            return SessionEnd::Lost(GatewayError::SessionExpired);
                        }
                        return SessionEnd::Lost(GatewayError::Transport(format!(
                            "closed by peer (code {code:?}): {reason}"
                        )));
                    }
                    None => {
                        return SessionEnd::Lost(GatewayError::Transport("stream ended".into()));
                    }
                },
                _ = ping_timer.tick(), if heartbeat_active => {
                    if let Ok(wire) = self.codec.encode(&Frame::ping()) {
                        if let Err(err) = link.send_text(wire).await {
                            return SessionEnd::Lost(err);
                        }
                        pong_deadline = Some(Box::pin(sleep(self.config.pong_timeout)));
                    }
                },
                _ = pong_expiry(&mut pong_deadline), if heartbeat_active => {
                    tracing::warn!(
                        timeout_ms = self.config.pong_timeout.as_millis() as u64,
                        "no pong before deadline"
                    );
                    link.close(4000, "pong timeout").await;
                    return SessionEnd::Lost(GatewayError::HeartbeatTimeout);
                },
                _ = session_timer.tick() => {
                    let validator = Arc::clone(&self.validator);
                    let tx = probe_tx.clone();
                    tokio::spawn(async move {
                        // Probe failures count as "probably valid".
                        let status = validator.validate().await.unwrap_or(SessionStatus::Valid);
                        let _ = tx.send(status).await;
                    });
                },
                Some(status) = probe_rx.recv() => {
                    if status == SessionStatus::Invalid {
                        self.emit(Frame::session_expired());
                        link.close(4003, "session expired").await;
                        return SessionEnd::Lost(GatewayError::SessionExpired);
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        link.close(1000, "client dropped").await;
                        return SessionEnd::Closed;
                    }
                    Some(Command::Close) => {
                        link.close(1000, "normal closure").await;
                        return SessionEnd::Closed;
                    }
                    Some(Command::Send(frame)) => match self.codec.encode(&frame) {
                        Ok(wire) => {
                            if let Err(err) = link.send_text(wire).await {
                                self.enqueue(frame);
                                return SessionEnd::Lost(err);
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "dropping unencodable frame"),
                    },
                    Some(Command::Initialize { user, is_authenticated })
                    | Some(Command::UpdateAuth { user, is_authenticated }) => {
                        if let Some(end) =
                            self.apply_auth_online(&mut link, user, is_authenticated).await
                        {
                            return end;
                        }
                    }
                    Some(Command::Visibility { visible }) => {
                        if visible && !self.visible {
                            // Rearm the heartbeat from a clean slate.
                            ping_timer.reset();
                        }
                        if !visible {
                            pong_deadline = None;
                        }
                        self.visible = visible;
                    }
                },
            }
        }
    }

    async fn handle_text(
        &mut self,
        link: &mut Box<dyn TransportLink>,
        text: &str,
        pong_deadline: &mut Option<Pin<Box<Sleep>>>,
    ) {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "malformed inbound frame");
                if let Ok(wire) = self.codec.encode(&Frame::error("Invalid message format")) {
                    let _ = link.send_text(wire).await;
                }
                return;
            }
        };
        if frame.is_kind(kind::PING) {
            if let Ok(wire) = self.codec.encode(&Frame::pong()) {
                let _ = link.send_text(wire).await;
            }
        } else if frame.is_kind(kind::PONG) {
            *pong_deadline = None;
        } else {
            self.emit(frame);
        }
    }

    async fn apply_auth_online(
        &mut self,
        link: &mut Box<dyn TransportLink>,
        user: UserId,
        is_authenticated: bool,
    ) -> Option<SessionEnd> {
        if self.identity.user == user {
            if self.identity.is_authenticated == is_authenticated {
                return None;
            }
            self.identity.is_authenticated = is_authenticated;
            let frame = Frame::auth(&user, is_authenticated);
            if let Ok(wire) = self.codec.encode(&frame) {
                if let Err(err) = link.send_text(wire).await {
                    return Some(SessionEnd::Lost(err));
                }
            }
            return None;
        }
        // Queued frames were addressed to the previous identity.
        self.queue.clear();
        self.identity = Identity {
            user,
            is_authenticated,
        };
        self.enter(ClientState::Reconnecting);
        link.close(1000, "auth change").await;
        self.reconnect = ReconnectState::default();
        Some(SessionEnd::Restart)
    }

    /// Replay queued frames oldest first, stopping at the first send failure.
    async fn drain_queue(&mut self, link: &mut Box<dyn TransportLink>) -> Result<(), GatewayError> {
        while let Some(frame) = self.queue.pop_front() {
            let wire = match self.codec.encode(&frame) {
                Ok(wire) => wire,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unencodable queued frame");
                    continue;
                }
            };
            if let Err(err) = link.send_text(wire).await {
                self.queue.push_front(frame);
                return Err(err);
            }
        }
        Ok(())
    }
}

async fn pong_expiry(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(wait) => wait.as_mut().await,
        None => std::future::pending().await,
    }
}
