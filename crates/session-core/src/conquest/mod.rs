//! Conquest: turn-based land-grab quiz battle.
//!
//! - `config`: authoritative match state and the land rules
//! - `engine`: roster, host authority, stage machine
//! - `player`, `turn`, `world`: serializable data model
//! - `question`: host-fed question queue
//!
//! [`dispatch`] routes `{"op": "conquest"}` frames: `create`, `connect`
//! and `list` act on the registry, every other command goes to the engine
//! the stream is linked to.

mod config;
mod engine;
mod player;
mod question;
mod turn;
mod world;

pub use config::{default_start_hp, ConquestConfig, GameState};
pub use engine::{ConquestEngine, MAX_PLAYERS};
pub use player::{ConquestPlayer, STREAK_SIZE};
pub use question::{QuestionQueue, QUEUE_TARGET, REQUEST_INTERVAL};
pub use turn::{AnswerState, ConquestAnswer, ConquestTurn, Stage, SubStage};
pub use world::{
    ConquestLand, ConquestWorld, WorldCatalog, WorldTemplate, INITIAL_FORTRESS, LAND_XP, LAND_XP_ONCE,
};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::engine::{requested_engine_id, Caller, Engine, Reply};
use crate::error::CommandError;
use crate::registry::{ConnectPolicy, EngineRegistry};
use crate::types::{EngineKey, EngineKind};

/// Timing and capacity of Conquest matches.
#[derive(Debug, Clone)]
pub struct ConquestSettings {
    /// Players per match, clamped to 2..=4.
    pub player_limit: usize,

    /// Countdown between entering play and the first pick.
    pub prepare_delay: Duration,

    /// Select window of a turn.
    pub select_timeout: Duration,

    /// Minimum answer window; a question's own `duration` may extend it.
    pub answer_timeout: Duration,

    /// Pause after a resolution.
    pub wait_delay: Duration,

    /// Play time after which a match still picking ends with an error.
    pub game_timeout: Duration,

    /// Unsolicited state push period.
    pub state_interval: Duration,

    pub worlds: WorldCatalog,
}

impl Default for ConquestSettings {
    fn default() -> Self {
        ConquestSettings {
            player_limit: MAX_PLAYERS,
            prepare_delay: Duration::from_millis(2500),
            select_timeout: Duration::from_secs(15),
            answer_timeout: Duration::from_secs(15),
            wait_delay: Duration::from_secs(2),
            game_timeout: Duration::from_secs(30 * 60),
            state_interval: Duration::from_secs(3),
            worlds: WorldCatalog::builtin(),
        }
    }
}

/// Commands handled by a linked engine.
const ENGINE_COMMANDS: &[&str] = &[
    "state",
    "enroll",
    "leave",
    "start",
    "prepare",
    "play",
    "questionRequest",
    "pick",
    "answer",
    "finish",
];

/// Entry point for `{"op": "conquest"}` frames.
pub(crate) fn dispatch(
    registry: &mut EngineRegistry,
    caller: &Caller<'_>,
    cmd: &str,
    msg: &Map<String, Value>,
) -> Result<Reply, CommandError> {
    match cmd {
        "create" => create(registry, caller, msg),
        "connect" => connect(registry, caller, msg),
        "list" => list(registry, caller, msg),
        _ if ENGINE_COMMANDS.contains(&cmd) => {
            let key = registry
                .stream_engine(caller.stream, EngineKind::Conquest, requested_engine_id(msg)?)
                .ok_or(CommandError::InvalidEngine)?;
            registry.dispatch_command(caller, key, cmd, msg)
        }
        _ => Err(CommandError::InvalidCommand),
    }
}

/// `(map, mission, level)` of a create or list request.
fn match_params(msg: &Map<String, Value>) -> Result<(String, String, u32), CommandError> {
    let text = |name: &str| {
        msg.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let map = text("map").ok_or(CommandError::MissingMap)?;
    let mission = text("mission").ok_or(CommandError::MissingMission)?;
    let level = msg
        .get("level")
        .and_then(Value::as_u64)
        .and_then(|l| u32::try_from(l).ok())
        .filter(|l| *l > 0)
        .ok_or(CommandError::MissingLevel)?;

    Ok((map, mission, level))
}

fn already_linked(registry: &EngineRegistry, caller: &Caller<'_>) -> bool {
    registry
        .stream_engine(caller.stream, EngineKind::Conquest, None)
        .is_some()
}

fn users(registry: &EngineRegistry, key: EngineKey) -> Value {
    registry
        .engine_get_as::<ConquestEngine>(key)
        .and_then(|e| serde_json::to_value(e.players()).ok())
        .unwrap_or(Value::Array(Vec::new()))
}

fn create(registry: &mut EngineRegistry, caller: &Caller<'_>, msg: &Map<String, Value>) -> Result<Reply, CommandError> {
    if already_linked(registry, caller) {
        return Err(CommandError::EngineAlreadyConnected);
    }

    let (map, mission, level) = match_params(msg)?;

    let id = registry.allocate_id(EngineKind::Conquest);
    let settings = Arc::clone(&registry.settings().conquest);
    let seed = registry.next_seed();

    let mut config = ConquestConfig::new(map, mission, level);
    if let Some(hp) = msg
        .get("startHp")
        .and_then(Value::as_u64)
        .and_then(|hp| u32::try_from(hp).ok())
        .filter(|hp| *hp > 0)
    {
        config.start_hp = hp;
    }

    let mut engine = ConquestEngine::new(id, config, settings, seed);
    engine.set_owner(caller.username());

    let key = registry
        .engine_add(Box::new(engine))
        .ok_or(CommandError::Internal)?;

    if let Err(err) = registry.link(caller.stream, key) {
        registry.engine_remove(key);
        return Err(err);
    }

    if let Err(err) = registry.dispatch_command(caller, key, "enroll", msg) {
        warn!(engine = %key, user = %caller.username(), error = %err, "creator enroll failed");
        registry.unlink(caller.stream, key);
        registry.engine_remove(key);
        return Err(CommandError::EnrollFailed);
    }

    info!(engine = %key, user = %caller.username(), "conquest created");

    let mut reply = Reply::new();
    reply.insert("created".to_string(), json!(true));
    reply.insert("engine".to_string(), json!(id));
    reply.insert("users".to_string(), users(registry, key));
    Ok(reply)
}

/// Resolve the engine a `connect` targets. `Ok(None)` asks for creation.
fn connect_target(registry: &EngineRegistry, msg: &Map<String, Value>) -> Result<Option<EngineKey>, CommandError> {
    let candidates = registry.engines_of(EngineKind::Conquest);

    if let Some(id) = requested_engine_id(msg)? {
        let key = EngineKey::new(EngineKind::Conquest, id);
        if !candidates.contains(&key) {
            return Err(CommandError::InvalidEngine);
        }
        return Ok(Some(key));
    }

    match registry.settings().connect_policy {
        ConnectPolicy::Strict if candidates.is_empty() => Err(CommandError::InvalidEngine),
        ConnectPolicy::Strict => Err(CommandError::AmbiguousEngine),
        ConnectPolicy::SingleInstance => match candidates.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            [first, ..] => {
                warn!(engine = %first, candidates = candidates.len(), "ambiguous connect, joining lowest id");
                Ok(Some(*first))
            }
        },
    }
}

fn connect(registry: &mut EngineRegistry, caller: &Caller<'_>, msg: &Map<String, Value>) -> Result<Reply, CommandError> {
    if already_linked(registry, caller) {
        return Err(CommandError::EngineAlreadyConnected);
    }

    let Some(key) = connect_target(registry, msg)? else {
        debug!(user = %caller.username(), "no conquest engine, creating one");
        return create(registry, caller, msg);
    };

    let forced = msg.get("forced").and_then(Value::as_bool).unwrap_or(false);

    let previous = {
        let engine = registry
            .engine_get_as::<ConquestEngine>(key)
            .ok_or(CommandError::InvalidEngine)?;

        if !engine.user_can_connect(caller.username()) {
            return Err(CommandError::ConnectionDisabled);
        }

        engine
            .player_by_username(caller.username())
            .and_then(|p| p.stream)
            .filter(|s| *s != caller.stream)
    };

    if previous.is_some() && !forced {
        return Err(CommandError::AlreadyConnected);
    }

    // The new stream goes in before the stale one leaves, so the engine
    // never sees itself without streams mid-match.
    registry.link(caller.stream, key)?;

    if let Some(stale) = previous {
        info!(engine = %key, user = %caller.username(), stream = %stale, "replacing stale stream");
        registry.unlink(stale, key);
    }

    let mut reply = Reply::new();
    reply.insert("engine".to_string(), json!(key.id));
    reply.insert("users".to_string(), users(registry, key));
    Ok(reply)
}

fn list(registry: &mut EngineRegistry, caller: &Caller<'_>, msg: &Map<String, Value>) -> Result<Reply, CommandError> {
    let (map, mission, level) = match_params(msg)?;

    let list: Vec<Value> = registry
        .engines_of(EngineKind::Conquest)
        .into_iter()
        .filter_map(|key| registry.engine_get_as::<ConquestEngine>(key))
        .filter(|e| {
            let c = e.config();
            c.map == map && c.mission == mission && c.level == level && e.user_can_connect(caller.username())
        })
        .map(|e| json!({ "engineId": e.base().id, "owner": e.owner() }))
        .collect();

    let mut reply = Reply::new();
    reply.insert("list".to_string(), Value::Array(list));
    Ok(reply)
}
