//! The polymorphic engine contract.
//!
//! - [`EngineBase`]: state every engine carries (kind, id, linked streams,
//!   limits).
//! - [`Engine`]: hooks the registry invokes on the worker.
//! - [`EngineContext`]: the only way an engine affects anything outside
//!   itself. Hooks queue [`Effect`]s; the registry applies them after the
//!   hook returns.

use std::any::Any;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::credential::Credential;
use crate::directory::{EngineJob, JobResult};
use crate::error::CommandError;
use crate::types::{EngineId, EngineKey, EngineKind, StreamId};

/// Reply body of a command. An empty map means "send nothing".
pub type Reply = Map<String, Value>;

/// The `engine` field of a command: `Ok(None)` when absent, an error when
/// present but not a valid id.
pub(crate) fn requested_engine_id(msg: &Map<String, Value>) -> Result<Option<EngineId>, CommandError> {
    match msg.get("engine") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|id| EngineId::try_from(id).ok())
            .map(Some)
            .ok_or(CommandError::InvalidEngine),
    }
}

/// The stream that issued a command, with its credential.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub stream: StreamId,
    pub credential: &'a Credential,
}

impl<'a> Caller<'a> {
    pub fn new(stream: StreamId, credential: &'a Credential) -> Self {
        Caller { stream, credential }
    }

    pub fn username(&self) -> &str {
        &self.credential.username
    }
}

/// Side effect requested by an engine hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send `{"op": op, "d": data}` to one stream.
    Send {
        stream: StreamId,
        op: String,
        data: Value,
    },

    /// Push this engine's state to all its streams once the current
    /// operation completes. Repeated triggers coalesce.
    Trigger,

    /// Unlink a stream from this engine.
    Unlink(StreamId),

    /// Run blocking work off the worker; the result comes back through
    /// [`Engine::job_finished`].
    Job(EngineJob),

    /// Close a stream's connection.
    Close(StreamId),
}

/// Handle passed to every engine hook.
#[derive(Debug)]
pub struct EngineContext {
    key: EngineKey,
    clock: Clock,
    tick_interval_ms: u64,
    effects: Vec<Effect>,
}

impl EngineContext {
    pub fn new(key: EngineKey, clock: Clock, tick_interval_ms: u64) -> Self {
        EngineContext {
            key,
            clock,
            tick_interval_ms,
            effects: Vec::new(),
        }
    }

    pub fn key(&self) -> EngineKey {
        self.key
    }

    pub fn now(&self) -> Instant {
        self.clock.now
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Period of the registry's fixed-rate tick.
    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms
    }

    pub fn send(&mut self, stream: StreamId, op: &str, data: Value) {
        self.effects.push(Effect::Send {
            stream,
            op: op.to_string(),
            data,
        });
    }

    pub fn trigger(&mut self) {
        if !self.effects.contains(&Effect::Trigger) {
            self.effects.push(Effect::Trigger);
        }
    }

    pub fn unlink(&mut self, stream: StreamId) {
        self.effects.push(Effect::Unlink(stream));
    }

    pub fn spawn_job(&mut self, job: EngineJob) {
        self.effects.push(Effect::Job(job));
    }

    pub fn close(&mut self, stream: StreamId) {
        self.effects.push(Effect::Close(stream));
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

/// State shared by every concrete engine.
#[derive(Debug, Clone)]
pub struct EngineBase {
    pub kind: EngineKind,
    pub id: EngineId,

    /// Linked streams in link order. Non-owning: streams live in the
    /// registry's stream table.
    streams: Vec<StreamId>,

    /// Maximum number of linked streams; `None` is unlimited.
    pub connection_limit: Option<usize>,

    pub player_limit: usize,
}

impl EngineBase {
    pub fn new(kind: EngineKind, id: EngineId) -> Self {
        EngineBase {
            kind,
            id,
            streams: Vec::new(),
            connection_limit: None,
            player_limit: 0,
        }
    }

    pub fn key(&self) -> EngineKey {
        EngineKey::new(self.kind, self.id)
    }

    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    pub fn has_stream(&self, stream: StreamId) -> bool {
        self.streams.contains(&stream)
    }

    pub(crate) fn add_stream(&mut self, stream: StreamId) -> bool {
        if self.has_stream(stream) {
            return false;
        }
        self.streams.push(stream);
        true
    }

    pub(crate) fn remove_stream(&mut self, stream: StreamId) -> bool {
        let before = self.streams.len();
        self.streams.retain(|s| *s != stream);
        before != self.streams.len()
    }
}

/// Common contract of every engine kind.
///
/// All hooks run on the registry worker; none may block.
pub trait Engine: Send {
    fn base(&self) -> &EngineBase;
    fn base_mut(&mut self) -> &mut EngineBase;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Whether the registry may drop this engine.
    ///
    /// `use_count` is 1 (the registry) plus linked streams plus jobs in
    /// flight.
    fn can_delete(&self, use_count: usize) -> bool {
        use_count == 1
    }

    /// Connection-limit check for a new stream.
    fn can_connect(&self) -> bool {
        let base = self.base();
        match base.connection_limit {
            Some(limit) => base.streams().len() < limit,
            None => true,
        }
    }

    fn timer_tick(&mut self, _ctx: &mut EngineContext) {}

    fn timer_minute_tick(&mut self, _ctx: &mut EngineContext) {}

    /// Push state to every linked stream.
    fn trigger_event(&mut self, ctx: &mut EngineContext);

    /// Push state to one stream.
    fn stream_trigger_event(&mut self, _stream: StreamId, _ctx: &mut EngineContext) {}

    fn stream_linked_event(&mut self, _caller: &Caller<'_>, _ctx: &mut EngineContext) {}

    fn stream_unlinked_event(&mut self, _stream: StreamId, _ctx: &mut EngineContext) {}

    /// Engine-level command (`cmd` other than create/connect/list).
    fn handle_command(
        &mut self,
        _caller: &Caller<'_>,
        _cmd: &str,
        _msg: &Map<String, Value>,
        _ctx: &mut EngineContext,
    ) -> Result<Reply, CommandError> {
        Err(CommandError::InvalidCommand)
    }

    fn job_finished(&mut self, _result: JobResult, _ctx: &mut EngineContext) {}
}
