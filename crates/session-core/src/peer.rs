//! Presence engine: who is currently connected.
//!
//! One permanent instance per registry. Streams observing `peers` are
//! linked to it and receive `{"op": "peers", "d": [...]}` on every change.

use std::any::Any;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::clock::Clock;
use crate::engine::{Engine, EngineBase, EngineContext};
use crate::types::{EngineId, EngineKind, StreamId};

/// Entries not refreshed for this long are dropped on the minute tick.
pub const PEER_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// One logged-in user as shown to observers.
#[derive(Debug, Clone, Serialize)]
pub struct PeerUser {
    pub username: String,
    pub host: String,
    pub agent: String,

    /// Last activity, seconds since the Unix epoch.
    pub timestamp: i64,

    #[serde(skip)]
    seen: Option<Instant>,
}

impl PeerUser {
    pub fn new(username: String, host: String, agent: String, clock: Clock) -> Self {
        PeerUser {
            username,
            host,
            agent,
            timestamp: clock.unix_secs(),
            seen: Some(clock.now),
        }
    }

    fn same_peer(&self, other: &PeerUser) -> bool {
        self.username == other.username && self.host == other.host && self.agent == other.agent
    }
}

#[derive(Debug)]
pub struct PeerEngine {
    base: EngineBase,
    users: Vec<PeerUser>,
}

impl PeerEngine {
    pub fn new(id: EngineId) -> Self {
        PeerEngine {
            base: EngineBase::new(EngineKind::Peer, id),
            users: Vec::new(),
        }
    }

    pub fn users(&self) -> &[PeerUser] {
        &self.users
    }

    /// Add a user or refresh its timestamp. Returns `true` when the list
    /// changed (a new entry).
    pub fn log_user(&mut self, user: PeerUser) -> bool {
        if user.username.is_empty() {
            return false;
        }

        match self.users.iter_mut().find(|u| u.same_peer(&user)) {
            Some(existing) => {
                existing.timestamp = user.timestamp;
                existing.seen = user.seen;
                false
            }
            None => {
                trace!(user = %user.username, "peer logged");
                self.users.push(user);
                true
            }
        }
    }

    /// Drop every entry of `username`.
    pub fn remove_user(&mut self, username: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.username != username);
        before != self.users.len()
    }

    /// Drop entries older than [`PEER_EXPIRY`].
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.users.len();
        self.users.retain(|u| match u.seen {
            Some(seen) => now.saturating_duration_since(seen) <= PEER_EXPIRY,
            None => false,
        });
        before != self.users.len()
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(&self.users).unwrap_or(Value::Array(Vec::new()))
    }
}

impl Engine for PeerEngine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EngineBase {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    /// Presence lives as long as the registry.
    fn can_delete(&self, _use_count: usize) -> bool {
        false
    }

    fn timer_minute_tick(&mut self, ctx: &mut EngineContext) {
        if self.expire(ctx.now()) {
            ctx.trigger();
        }
    }

    fn trigger_event(&mut self, ctx: &mut EngineContext) {
        let list = self.snapshot();
        for stream in self.base.streams() {
            ctx.send(*stream, EngineKind::Peer.op(), list.clone());
        }
    }

    fn stream_trigger_event(&mut self, stream: StreamId, ctx: &mut EngineContext) {
        ctx.send(stream, EngineKind::Peer.op(), self.snapshot());
    }
}
