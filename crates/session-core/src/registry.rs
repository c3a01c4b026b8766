//! Engine registry.
//!
//! The process-wide authority over live engines and live streams:
//! - owns every engine in an arena keyed by `(kind, id)`,
//! - hands out engine ids (one counter per kind),
//! - keeps the stream table (credential, linked engines, observers),
//! - links and unlinks streams, firing the engine hooks,
//! - ticks every engine and reaps the unused ones.
//!
//! The registry is synchronous and single-owner. The server drives it
//! from one worker task; everything an engine asks for comes out of
//! [`EngineRegistry::drain`] as [`Output`]s that the server routes.
//!
//! Holder count of an engine: 1 (the registry) + linked streams + jobs
//! in flight. An engine is reaped only when `can_delete(holders)` holds,
//! so a linked stream or a pending job always keeps it alive.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::conquest::{self, ConquestSettings};
use crate::credential::Credential;
use crate::directory::JobResult;
use crate::engine::{Caller, Effect, Engine, EngineContext, Reply};
use crate::error::CommandError;
use crate::exam;
use crate::peer::{PeerEngine, PeerUser};
use crate::types::{EngineId, EngineKey, EngineKind, StreamId};

/// How `connect` resolves a request that names no engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectPolicy {
    /// An id is required. Without one the request fails (`ambiguous
    /// engine` when candidates exist, `invalid engine` otherwise).
    Strict,

    /// No id: create the engine when none exists, join it when exactly
    /// one exists, join the lowest id (with a warning) otherwise.
    #[default]
    SingleInstance,
}

#[derive(Debug, Error)]
#[error("unknown connect policy: {0}")]
pub struct ParsePolicyError(String);

impl FromStr for ConnectPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ConnectPolicy::Strict),
            "single" | "single_instance" | "singleinstance" => Ok(ConnectPolicy::SingleInstance),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub connect_policy: ConnectPolicy,

    /// Period of the fixed-rate tick, reported to clients as `interval`.
    pub tick_interval_ms: u64,

    pub conquest: Arc<ConquestSettings>,

    /// Seed for every engine's random source. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            connect_policy: ConnectPolicy::default(),
            tick_interval_ms: 1000 / 120,
            conquest: Arc::new(ConquestSettings::default()),
            seed: None,
        }
    }
}

/// Work the registry hands back to its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Send `{"op": op, "d": data}` to a stream.
    Send {
        stream: StreamId,
        op: String,
        data: Value,
    },

    /// Close a stream's connection.
    Close { stream: StreamId },

    /// Run a job off the worker, then report back via
    /// [`EngineRegistry::job_finished`].
    Job {
        engine: EngineKey,
        job: crate::directory::EngineJob,
    },
}

struct EngineSlot {
    engine: Box<dyn Engine>,
    jobs: usize,
}

impl EngineSlot {
    fn use_count(&self) -> usize {
        1 + self.engine.base().streams().len() + self.jobs
    }
}

#[derive(Debug, Default)]
struct StreamEntry {
    credential: Option<Credential>,
    engines: BTreeSet<EngineKey>,
    observers: BTreeSet<EngineKind>,
    host: String,
    agent: String,
}

/// Arena of live engines and streams.
pub struct EngineRegistry {
    settings: RegistrySettings,
    engines: BTreeMap<EngineKey, EngineSlot>,
    streams: BTreeMap<StreamId, StreamEntry>,
    next_ids: BTreeMap<EngineKind, EngineId>,
    peer: EngineKey,
    clock: Clock,
    rng: StdRng,

    /// Engines whose state push is due once the current operation ends.
    pending: BTreeSet<EngineKey>,
    outbox: Vec<Output>,
    shutting_down: bool,
}

impl EngineRegistry {
    /// Create a registry holding only the permanent presence engine.
    pub fn new(settings: RegistrySettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut registry = EngineRegistry {
            settings,
            engines: BTreeMap::new(),
            streams: BTreeMap::new(),
            next_ids: BTreeMap::new(),
            peer: EngineKey::new(EngineKind::Peer, 0),
            clock: Clock::system(),
            rng,
            pending: BTreeSet::new(),
            outbox: Vec::new(),
            shutting_down: false,
        };

        let id = registry.allocate_id(EngineKind::Peer);
        let peer = PeerEngine::new(id);
        if let Some(key) = registry.engine_add(Box::new(peer)) {
            registry.peer = key;
        }

        registry
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Move the registry clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.clock = self.clock.advanced(by);
    }

    /// Next engine id for `kind`. Ids start at 1 and are never reused.
    pub fn allocate_id(&mut self, kind: EngineKind) -> EngineId {
        let next = self.next_ids.entry(kind).or_insert(0);
        *next += 1;
        *next
    }

    /// Fresh seed for a new engine's random source.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn peer_key(&self) -> EngineKey {
        self.peer
    }

    // -------------------------------------------------------------------------
    // Engines
    // -------------------------------------------------------------------------

    /// Register an engine. Returns `None` while shutting down or when the
    /// key is already taken.
    pub fn engine_add(&mut self, engine: Box<dyn Engine>) -> Option<EngineKey> {
        if self.shutting_down {
            return None;
        }

        let key = engine.base().key();

        if self.engines.contains_key(&key) {
            warn!(engine = %key, "engine already registered");
            return None;
        }

        debug!(engine = %key, "engine added");
        self.engines.insert(key, EngineSlot { engine, jobs: 0 });
        Some(key)
    }

    /// Deregister an engine, detaching it from every stream.
    pub fn engine_remove(&mut self, key: EngineKey) -> bool {
        if self.shutting_down {
            return false;
        }

        let Some(slot) = self.engines.remove(&key) else {
            return false;
        };

        for stream in slot.engine.base().streams() {
            if let Some(entry) = self.streams.get_mut(stream) {
                entry.engines.remove(&key);
            }
        }

        self.pending.remove(&key);
        debug!(engine = %key, "engine removed");
        true
    }

    pub fn engine_get(&self, key: EngineKey) -> Option<&dyn Engine> {
        self.engines.get(&key).map(|slot| slot.engine.as_ref())
    }

    /// Typed read access to an engine.
    pub fn engine_get_as<T: Engine + 'static>(&self, key: EngineKey) -> Option<&T> {
        self.engines
            .get(&key)
            .and_then(|slot| slot.engine.as_any().downcast_ref::<T>())
    }

    pub(crate) fn engine_get_as_mut<T: Engine + 'static>(&mut self, key: EngineKey) -> Option<&mut T> {
        self.engines
            .get_mut(&key)
            .and_then(|slot| slot.engine.as_any_mut().downcast_mut::<T>())
    }

    /// Keys of all engines of one kind, lowest id first.
    pub fn engines_of(&self, kind: EngineKind) -> Vec<EngineKey> {
        self.engines.keys().filter(|k| k.kind == kind).copied().collect()
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Current holder count, `None` for an unknown engine.
    pub fn use_count(&self, key: EngineKey) -> Option<usize> {
        self.engines.get(&key).map(EngineSlot::use_count)
    }

    /// Remove every engine whose `can_delete(use_count)` holds.
    pub fn engine_remove_unused(&mut self) -> usize {
        let doomed: Vec<EngineKey> = self
            .engines
            .iter()
            .filter(|(_, slot)| slot.engine.can_delete(slot.use_count()))
            .map(|(key, _)| *key)
            .collect();

        let mut removed = 0;
        for key in doomed {
            if self.engine_remove(key) {
                info!(engine = %key, "unused engine reaped");
                removed += 1;
            }
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Register a freshly accepted connection.
    pub fn stream_add(&mut self, stream: StreamId, host: impl Into<String>, agent: impl Into<String>) {
        let entry = StreamEntry {
            host: host.into(),
            agent: agent.into(),
            ..StreamEntry::default()
        };
        self.streams.insert(stream, entry);
        trace!(stream = %stream, "stream added");
    }

    /// Attach the verified credential. A stream authenticates once; later
    /// calls are refused.
    pub fn stream_authenticated(&mut self, stream: StreamId, credential: Credential) -> bool {
        let Some(entry) = self.streams.get_mut(&stream) else {
            return false;
        };

        if entry.credential.is_some() {
            warn!(stream = %stream, "credential already set");
            return false;
        }

        let user = PeerUser::new(
            credential.username.clone(),
            entry.host.clone(),
            entry.agent.clone(),
            self.clock,
        );
        debug!(stream = %stream, user = %credential.username, "stream authenticated");
        entry.credential = Some(credential);

        let peer = self.peer;
        let logged = self
            .engine_get_as_mut::<PeerEngine>(peer)
            .map(|p| p.log_user(user))
            .unwrap_or(false);

        if logged {
            self.pending.insert(peer);
        }
        self.flush_triggers();
        true
    }

    /// Drop a closed connection, unlinking it from every engine.
    pub fn stream_remove(&mut self, stream: StreamId) {
        let Some(entry) = self.streams.remove(&stream) else {
            return;
        };

        for key in &entry.engines {
            self.detach(stream, *key);
        }

        if let Some(credential) = &entry.credential {
            let still_online = self
                .streams
                .values()
                .any(|e| e.credential.as_ref().map(|c| c.username == credential.username).unwrap_or(false));

            if !still_online {
                let peer = self.peer;
                let removed = self
                    .engine_get_as_mut::<PeerEngine>(peer)
                    .map(|p| p.remove_user(&credential.username))
                    .unwrap_or(false);
                if removed {
                    self.pending.insert(peer);
                }
            }
        }

        trace!(stream = %stream, "stream removed");
        self.flush_triggers();
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_credential(&self, stream: StreamId) -> Option<&Credential> {
        self.streams.get(&stream).and_then(|e| e.credential.as_ref())
    }

    /// Engines the stream is linked to.
    pub fn stream_engines(&self, stream: StreamId) -> Vec<EngineKey> {
        self.streams
            .get(&stream)
            .map(|e| e.engines.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The stream's linked engine of `kind`, optionally restricted to `id`.
    pub fn stream_engine(&self, stream: StreamId, kind: EngineKind, id: Option<EngineId>) -> Option<EngineKey> {
        let entry = self.streams.get(&stream)?;
        entry
            .engines
            .iter()
            .find(|k| k.kind == kind && id.map(|id| k.id == id).unwrap_or(true))
            .copied()
    }

    // -------------------------------------------------------------------------
    // Linking
    // -------------------------------------------------------------------------

    /// Link a stream to an engine; the engine then pushes its state there.
    ///
    /// Linking an already linked pair is a no-op.
    pub fn link(&mut self, stream: StreamId, key: EngineKey) -> Result<(), CommandError> {
        let credential = self
            .streams
            .get(&stream)
            .and_then(|e| e.credential.clone())
            .ok_or(CommandError::PermissionDenied)?;

        let slot = self.engines.get_mut(&key).ok_or(CommandError::InvalidEngine)?;

        if slot.engine.base().has_stream(stream) {
            return Ok(());
        }

        if !slot.engine.can_connect() {
            return Err(CommandError::ConnectionDisabled);
        }

        slot.engine.base_mut().add_stream(stream);

        if let Some(entry) = self.streams.get_mut(&stream) {
            entry.engines.insert(key);
        }

        debug!(engine = %key, stream = %stream, user = %credential.username, "stream linked");

        let caller = Caller::new(stream, &credential);
        self.with_engine(key, |engine, ctx| engine.stream_linked_event(&caller, ctx));
        Ok(())
    }

    /// Unlink a stream from an engine. Returns whether a link existed.
    pub fn unlink(&mut self, stream: StreamId, key: EngineKey) -> bool {
        if let Some(entry) = self.streams.get_mut(&stream) {
            entry.engines.remove(&key);
            if key == self.peer {
                entry.observers.remove(&EngineKind::Peer);
            }
        }
        self.detach(stream, key)
    }

    fn detach(&mut self, stream: StreamId, key: EngineKey) -> bool {
        let removed = self
            .engines
            .get_mut(&key)
            .map(|slot| slot.engine.base_mut().remove_stream(stream))
            .unwrap_or(false);

        if removed {
            debug!(engine = %key, stream = %stream, "stream unlinked");
            self.with_engine(key, |engine, ctx| engine.stream_unlinked_event(stream, ctx));
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Subscribe a stream to a broadcast category and push it the current
    /// snapshot.
    pub fn observer_add(&mut self, stream: StreamId, kind: EngineKind) -> bool {
        if kind != EngineKind::Peer {
            warn!(stream = %stream, kind = %kind, "invalid observer");
            return false;
        }

        let peer = self.peer;
        if self.link(stream, peer).is_err() {
            return false;
        }

        if let Some(entry) = self.streams.get_mut(&stream) {
            entry.observers.insert(kind);
        }

        self.with_engine(peer, |engine, ctx| engine.stream_trigger_event(stream, ctx));
        self.flush_triggers();
        true
    }

    pub fn observer_remove(&mut self, stream: StreamId, kind: EngineKind) -> bool {
        if kind != EngineKind::Peer {
            warn!(stream = %stream, kind = %kind, "invalid observer");
            return false;
        }

        let peer = self.peer;
        let removed = self.unlink(stream, peer);
        self.flush_triggers();
        removed
    }

    pub fn observers(&self, stream: StreamId) -> Vec<EngineKind> {
        self.streams
            .get(&stream)
            .map(|e| e.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Triggers
    // -------------------------------------------------------------------------

    /// Push one engine's state to its streams now.
    pub fn trigger_engine(&mut self, key: EngineKey) {
        if self.engines.contains_key(&key) {
            self.pending.insert(key);
        }
        self.flush_triggers();
    }

    /// Push state for every engine of `kind`, or only the one with `id`.
    pub fn trigger(&mut self, kind: EngineKind, id: Option<EngineId>) {
        let keys: Vec<EngineKey> = self
            .engines
            .keys()
            .filter(|k| k.kind == kind && id.map(|id| k.id == id).unwrap_or(true))
            .copied()
            .collect();
        self.pending.extend(keys);
        self.flush_triggers();
    }

    fn flush_triggers(&mut self) {
        // Trigger hooks push state; a hook that re-triggers is served on
        // the next round, bounded so it cannot spin.
        for _ in 0..4 {
            if self.pending.is_empty() {
                break;
            }
            let keys = std::mem::take(&mut self.pending);
            for key in keys {
                self.with_engine(key, |engine, ctx| engine.trigger_event(ctx));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Dispatch one engine-operation frame (`{"op": kind, "d": payload}`).
    ///
    /// The reply (if any) goes back to `stream` only, under the same op.
    pub fn handle_message(&mut self, stream: StreamId, kind: EngineKind, payload: &Value) {
        let empty = Map::new();
        let msg = payload.as_object().unwrap_or(&empty);
        let cmd = msg.get("cmd").and_then(Value::as_str).unwrap_or_default().to_string();

        let result = match self.stream_credential(stream).cloned() {
            Some(credential) => {
                let caller = Caller::new(stream, &credential);
                trace!(stream = %stream, kind = %kind, cmd = %cmd, "handle message");
                match kind {
                    EngineKind::Conquest => conquest::dispatch(self, &caller, &cmd, msg),
                    EngineKind::Exam => exam::dispatch(self, &caller, &cmd, msg),
                    EngineKind::Peer => Err(CommandError::InvalidCommand),
                }
            }
            None => Err(CommandError::PermissionDenied),
        };

        let mut reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!(stream = %stream, kind = %kind, cmd = %cmd, error = %err, "command rejected");
                err.to_reply()
            }
        };

        if !reply.is_empty() {
            reply.insert("cmd".to_string(), Value::String(cmd));
            self.outbox.push(Output::Send {
                stream,
                op: kind.op().to_string(),
                data: Value::Object(reply),
            });
        }

        self.flush_triggers();
    }

    /// Run an engine-level command against a registered engine.
    pub fn dispatch_command(
        &mut self,
        caller: &Caller<'_>,
        key: EngineKey,
        cmd: &str,
        msg: &Map<String, Value>,
    ) -> Result<Reply, CommandError> {
        self.with_engine(key, |engine, ctx| engine.handle_command(caller, cmd, msg, ctx))
            .unwrap_or(Err(CommandError::InvalidEngine))
    }

    // -------------------------------------------------------------------------
    // Timers and jobs
    // -------------------------------------------------------------------------

    /// Fixed-rate tick: `timer_tick` on every engine.
    pub fn timer_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let keys: Vec<EngineKey> = self.engines.keys().copied().collect();
        for key in keys {
            self.with_engine(key, |engine, ctx| engine.timer_tick(ctx));
        }
        self.flush_triggers();
    }

    /// Minute tick: `timer_minute_tick` on every engine, then reaping.
    pub fn timer_minute_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let keys: Vec<EngineKey> = self.engines.keys().copied().collect();
        for key in keys {
            self.with_engine(key, |engine, ctx| engine.timer_minute_tick(ctx));
        }
        self.flush_triggers();
        self.engine_remove_unused();
    }

    /// Deliver a job result to the engine that requested it.
    pub fn job_finished(&mut self, key: EngineKey, result: JobResult) {
        match self.engines.get_mut(&key) {
            Some(slot) => slot.jobs = slot.jobs.saturating_sub(1),
            None => {
                debug!(engine = %key, "job finished for a removed engine");
                return;
            }
        }
        self.with_engine(key, |engine, ctx| engine.job_finished(result, ctx));
        self.flush_triggers();
    }

    /// Enter shutdown: no more engines are added or removed, every stream
    /// is asked to close.
    pub fn close_all(&mut self) {
        self.shutting_down = true;
        let streams: Vec<StreamId> = self.streams.keys().copied().collect();
        info!(streams = streams.len(), engines = self.engines.len(), "closing all streams");
        for stream in streams {
            self.outbox.push(Output::Close { stream });
        }
    }

    /// Take everything queued for the driver.
    pub fn drain(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Run a hook on one engine, then apply the effects it queued.
    fn with_engine<R>(
        &mut self,
        key: EngineKey,
        f: impl FnOnce(&mut dyn Engine, &mut EngineContext) -> R,
    ) -> Option<R> {
        let clock = self.clock;
        let interval = self.settings.tick_interval_ms;
        let slot = self.engines.get_mut(&key)?;

        let mut ctx = EngineContext::new(key, clock, interval);
        let out = f(slot.engine.as_mut(), &mut ctx);

        self.apply(key, ctx.into_effects());
        Some(out)
    }

    fn apply(&mut self, key: EngineKey, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { stream, op, data } => {
                    self.outbox.push(Output::Send { stream, op, data });
                }
                Effect::Trigger => {
                    self.pending.insert(key);
                }
                Effect::Unlink(stream) => {
                    self.unlink(stream, key);
                }
                Effect::Job(job) => {
                    if let Some(slot) = self.engines.get_mut(&key) {
                        slot.jobs += 1;
                        self.outbox.push(Output::Job { engine: key, job });
                    }
                }
                Effect::Close(stream) => {
                    self.outbox.push(Output::Close { stream });
                }
            }
        }
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        EngineRegistry::new(RegistrySettings::default())
    }
}
