//! Exam engine stub.
//!
//! Only the connection surface exists: `connect` creates or joins the
//! single exam engine, `state` pushes an empty state. Every other command
//! is `invalid command`.

use std::any::Any;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::engine::{requested_engine_id, Caller, Engine, EngineBase, EngineContext, Reply};
use crate::error::CommandError;
use crate::registry::EngineRegistry;
use crate::types::{EngineId, EngineKind, StreamId};

#[derive(Debug)]
pub struct ExamEngine {
    base: EngineBase,
}

impl ExamEngine {
    pub fn new(id: EngineId) -> Self {
        ExamEngine {
            base: EngineBase::new(EngineKind::Exam, id),
        }
    }

    fn state(&self) -> Value {
        json!({
            "cmd": "state",
            "engine": self.base.id,
        })
    }
}

impl Engine for ExamEngine {
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

    fn trigger_event(&mut self, ctx: &mut EngineContext) {
        let state = self.state();
        for stream in self.base.streams() {
            ctx.send(*stream, EngineKind::Exam.op(), state.clone());
        }
    }

    fn stream_trigger_event(&mut self, stream: StreamId, ctx: &mut EngineContext) {
        ctx.send(stream, EngineKind::Exam.op(), self.state());
    }

    fn handle_command(
        &mut self,
        caller: &Caller<'_>,
        cmd: &str,
        _msg: &Map<String, Value>,
        ctx: &mut EngineContext,
    ) -> Result<Reply, CommandError> {
        match cmd {
            "state" => {
                self.stream_trigger_event(caller.stream, ctx);
                Ok(Reply::new())
            }
            _ => Err(CommandError::InvalidCommand),
        }
    }
}

/// Entry point for `{"op": "exam"}` frames.
pub(crate) fn dispatch(
    registry: &mut EngineRegistry,
    caller: &Caller<'_>,
    cmd: &str,
    msg: &Map<String, Value>,
) -> Result<Reply, CommandError> {
    if cmd == "connect" {
        let key = match registry.engines_of(EngineKind::Exam).first() {
            Some(key) => *key,
            None => {
                let id = registry.allocate_id(EngineKind::Exam);
                let key = registry
                    .engine_add(Box::new(ExamEngine::new(id)))
                    .ok_or(CommandError::Internal)?;
                debug!(engine = %key, user = %caller.username(), "exam engine created");
                key
            }
        };

        registry.link(caller.stream, key)?;

        let mut reply = Reply::new();
        reply.insert("engine".to_string(), json!(key.id));
        return Ok(reply);
    }

    if cmd != "state" {
        return Err(CommandError::InvalidCommand);
    }

    let id = requested_engine_id(msg)?;
    let key = registry
        .stream_engine(caller.stream, EngineKind::Exam, id)
        .ok_or(CommandError::InvalidEngine)?;

    registry.dispatch_command(caller, key, cmd, msg)
}
