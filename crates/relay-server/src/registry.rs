use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use relay_core::{clock, ConnectionId, Frame, FrameCodec, FrameQueue, GatewayError, UserId};

/// Control messages for a connection's writer task. Kept off the bounded data
/// channel so heartbeats and closes are never starved by backpressure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMsg {
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Server view of one live socket. Owned by the registry; everyone else holds
/// it only for the duration of a callback.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: UserId,
    pub remote_addr: String,
    pub created_at: i64,
    authenticated: AtomicBool,
    alive: AtomicBool,
    last_pong_at: AtomicI64,
    drops: AtomicU64,
    data_tx: mpsc::Sender<String>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        user: UserId,
        remote_addr: String,
        data_tx: mpsc::Sender<String>,
        control_tx: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        let now = clock::now_ms();
        Self {
            id,
            user,
            remote_addr,
            created_at: now,
            authenticated: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            last_pong_at: AtomicI64::new(now),
            drops: AtomicU64::new(0),
            data_tx,
            control_tx,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn last_pong_at(&self) -> i64 {
        self.last_pong_at.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.alive.store(true, Ordering::Relaxed);
        self.last_pong_at.store(clock::now_ms(), Ordering::Relaxed);
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// One heartbeat round: mark not-alive and ask the writer to ping. The
    /// next round closes the connection unless a pong arrived in between.
    pub fn mark_ping_sent(&self) {
        self.alive.store(false, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlMsg::Ping);
    }

    /// Queue wire text for the writer. A full queue drops the message and
    /// bumps the drop counter; removal stays with the socket close path.
    pub fn send_text(&self, wire: String) -> bool {
        match self.data_tx.try_send(wire) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    connection_id = %self.id,
                    user = %self.user,
                    msg_len = msg.len(),
                    total_drops = drops,
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    connection_id = %self.id,
                    error = %GatewayError::QueueClosed,
                    "writer gone, frame not delivered"
                );
                false
            }
        }
    }

    pub fn request_close(&self, code: u16, reason: &'static str) {
        let _ = self.control_tx.send(ControlMsg::Close { code, reason });
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Per-user bookkeeping: the set of live connections plus the replay window
/// of frames published while no connection was live. One mutex covers both so
/// admission and publish for a user are serialized.
pub struct UserEntry {
    user: UserId,
    inner: Mutex<EntryInner>,
}

struct EntryInner {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    pending: FrameQueue,
}

impl UserEntry {
    fn new(user: UserId, pending_capacity: usize) -> Self {
        Self {
            user,
            inner: Mutex::new(EntryInner {
                connections: HashMap::new(),
                pending: FrameQueue::new(pending_capacity),
            }),
        }
    }
}

/// Result of a publish call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Live connections the frame was handed to.
    pub delivered: usize,
    /// The frame went to the replay window instead.
    pub queued: bool,
}

/// Counters and gauges reported by the health endpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GatewayStats {
    pub users: usize,
    pub connections: usize,
    pub pending_frames: usize,
    pub pending_dropped: u64,
    pub published: u64,
    pub queued: u64,
    pub oversize_dropped: u64,
}

/// Mapping from user identity to live connections and pending frames.
/// The global map is lock-free; each entry has one short-held mutex, and no
/// entry operation performs I/O while holding it — delivery is a non-blocking
/// channel push.
pub struct Registry {
    entries: DashMap<UserId, Arc<UserEntry>>,
    codec: FrameCodec,
    pending_capacity: usize,
    max_total_drops: u64,
    connection_count: AtomicUsize,
    published: AtomicU64,
    queued: AtomicU64,
    oversize_dropped: AtomicU64,
}

impl Registry {
    pub fn new(codec: FrameCodec, pending_capacity: usize, max_total_drops: u64) -> Self {
        Self {
            entries: DashMap::new(),
            codec,
            pending_capacity,
            max_total_drops,
            connection_count: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            oversize_dropped: AtomicU64::new(0),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn entry(&self, user: &UserId) -> Arc<UserEntry> {
        self.entries
            .entry(user.clone())
            .or_insert_with(|| Arc::new(UserEntry::new(user.clone(), self.pending_capacity)))
            .clone()
    }

    /// Admit a new connection: greet it, replay the pending window oldest
    /// first, then add it to the live set. All three happen under the entry
    /// lock so a concurrent publish cannot interleave ahead of the replay.
    pub fn admit(
        &self,
        conn: Arc<ConnectionHandle>,
        greeting: &Frame,
    ) -> Result<usize, GatewayError> {
        let wire = self.codec.encode(greeting)?;
        let entry = self.entry(&conn.user);
        let mut inner = entry.inner.lock();

        conn.send_text(wire);
        let codec = self.codec;
        let replayed = inner.pending.drain_into(|frame| match codec.encode(&frame) {
            Ok(wire) => {
                if conn.send_text(wire) {
                    Ok(())
                } else {
                    Err(frame)
                }
            }
            // Undeliverable by construction; drop rather than wedge the queue.
            Err(_) => Ok(()),
        });

        inner.connections.insert(conn.id.clone(), conn.clone());
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        Ok(replayed)
    }

    /// Remove a connection after its socket closed. The entry is retained:
    /// frames may still arrive for the user and belong in the replay window.
    pub fn remove(&self, user: &UserId, id: &ConnectionId) -> bool {
        let Some(entry) = self.entries.get(user) else {
            return false;
        };
        let removed = entry.inner.lock().connections.remove(id).is_some();
        if removed {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Deliver a frame to every live connection of the user, or queue it in
    /// the replay window when none is live. Write failures are recorded but
    /// removal belongs to the close path; a client over its lifetime drop
    /// budget is asked to close.
    pub fn publish_to(
        &self,
        user: &UserId,
        frame: Frame,
    ) -> Result<PublishOutcome, GatewayError> {
        let wire = match self.codec.encode(&frame) {
            Ok(wire) => wire,
            Err(e) => {
                if matches!(e, GatewayError::FrameTooLarge { .. }) {
                    self.oversize_dropped.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        let entry = self.entry(user);
        let mut inner = entry.inner.lock();

        if inner.connections.is_empty() {
            inner.pending.push(frame);
            self.queued.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome { delivered: 0, queued: true });
        }

        let mut delivered = 0;
        for conn in inner.connections.values() {
            if conn.send_text(wire.clone()) {
                delivered += 1;
            } else if conn.drop_count() >= self.max_total_drops {
                tracing::warn!(
                    connection_id = %conn.id,
                    user = %entry.user,
                    drops = conn.drop_count(),
                    "disconnecting slow client"
                );
                conn.request_close(1008, "slow consumer");
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(PublishOutcome { delivered, queued: false })
    }

    /// Best-effort delivery to every live connection of every user. Never
    /// queues into replay windows.
    pub fn publish_all(&self, frame: &Frame) {
        let Ok(wire) = self.codec.encode(frame) else {
            return;
        };
        for entry in self.entries.iter() {
            let inner = entry.inner.lock();
            for conn in inner.connections.values() {
                conn.send_text(wire.clone());
            }
        }
    }

    /// Record an in-band auth update for one of the user's connections.
    pub fn record_auth(&self, user: &UserId, id: &ConnectionId, is_authenticated: bool) {
        if let Some(entry) = self.entries.get(user) {
            if let Some(conn) = entry.inner.lock().connections.get(id) {
                conn.set_authenticated(is_authenticated);
                tracing::info!(user = %user, connection_id = %id, is_authenticated, "auth state updated");
            }
        }
    }

    /// Read-only snapshot of every live connection, for heartbeat rounds and
    /// shutdown.
    pub fn connection_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        let mut out = Vec::with_capacity(self.connection_count());
        for entry in self.entries.iter() {
            let inner = entry.inner.lock();
            out.extend(inner.connections.values().cloned());
        }
        out
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn user_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> GatewayStats {
        let mut pending_frames = 0;
        let mut pending_dropped = 0;
        for entry in self.entries.iter() {
            let inner = entry.inner.lock();
            pending_frames += inner.pending.len();
            pending_dropped += inner.pending.dropped();
        }
        GatewayStats {
            users: self.user_count(),
            connections: self.connection_count(),
            pending_frames,
            pending_dropped,
            published: self.published.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            oversize_dropped: self.oversize_dropped.load(Ordering::Relaxed),
        }
    }
}
