//! The Conquest engine: roster, host authority, stage machine.
//!
//! Game states: `Connect` (lobby) -> `start` -> `Prepare` (clients load,
//! signal readiness) -> `Play` -> `Finished` / `Error`.
//!
//! Inside `Play` the stages run `Prepare` (countdown) -> `Pick` -> `Battle`
//! -> `LastRound`. Each turn moves through its sub-stages either on a
//! command (pick, last expected answer) or when its deadline passes on
//! the tick.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, trace, warn};

use super::config::{ConquestConfig, GameState};
use super::player::ConquestPlayer;
use super::question::QuestionQueue;
use super::turn::{AnswerState, ConquestAnswer, ConquestTurn, Stage, SubStage};
use super::world::{ConquestLand, ConquestWorld, INITIAL_FORTRESS, LAND_XP, LAND_XP_ONCE};
use super::ConquestSettings;
use crate::directory::{EngineJob, GameRecord, JobResult};
use crate::engine::{Caller, Engine, EngineBase, EngineContext, Reply};
use crate::error::CommandError;
use crate::types::{EngineId, EngineKind, PlayerId, StreamId};

/// Upper bound of players a match supports (turn templates exist for 2-4).
pub const MAX_PLAYERS: usize = 4;

/// Turn templates by player count; entries index into the player order.
fn turn_template(players: usize) -> &'static [&'static [usize]] {
    match players {
        2 => &[&[0, 1], &[1, 0], &[1, 0], &[0, 1]],
        3 => &[&[0, 1, 2], &[2, 0, 1], &[1, 2, 0]],
        4 => &[&[0, 1, 2, 3], &[3, 0, 1, 2], &[2, 3, 0, 1], &[1, 2, 3, 0]],
        _ => &[],
    }
}

/// Longest answer window a question's `duration` may ask for.
const MAX_ANSWER_WINDOW: Duration = Duration::from_secs(10 * 60);

fn ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub struct ConquestEngine {
    base: EngineBase,
    config: ConquestConfig,
    players: Vec<ConquestPlayer>,
    host: Option<StreamId>,
    owner: String,
    settings: Arc<ConquestSettings>,
    rng: StdRng,
    questions: QuestionQueue,

    /// Start of the match clock; `None` outside `Play`.
    play_started: Option<Instant>,

    /// Wall-clock start, Unix ms.
    started_at: Option<i64>,

    /// Final match duration, kept after the clock stops.
    duration_ms: i64,

    last_state_sent: Option<Instant>,
}

impl ConquestEngine {
    pub fn new(id: EngineId, config: ConquestConfig, settings: Arc<ConquestSettings>, seed: u64) -> Self {
        let mut base = EngineBase::new(EngineKind::Conquest, id);
        base.player_limit = settings.player_limit.clamp(2, MAX_PLAYERS);

        ConquestEngine {
            base,
            config,
            players: Vec::new(),
            host: None,
            owner: String::new(),
            settings,
            rng: StdRng::seed_from_u64(seed),
            questions: QuestionQueue::new(),
            play_started: None,
            started_at: None,
            duration_ms: 0,
            last_state_sent: None,
        }
    }

    pub fn config(&self) -> &ConquestConfig {
        &self.config
    }

    pub fn players(&self) -> &[ConquestPlayer] {
        &self.players
    }

    pub fn host(&self) -> Option<StreamId> {
        self.host
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    pub fn questions(&self) -> &QuestionQueue {
        &self.questions
    }

    pub fn player_by_username(&self, username: &str) -> Option<&ConquestPlayer> {
        self.players.iter().find(|p| p.username == username)
    }

    pub fn player_by_stream(&self, stream: StreamId) -> Option<&ConquestPlayer> {
        self.players.iter().find(|p| p.stream == Some(stream))
    }

    /// Whether `username` may link to this engine.
    pub fn user_can_connect(&self, username: &str) -> bool {
        matches!(self.config.game_state, GameState::Invalid | GameState::Connect)
            || self.player_by_username(username).is_some()
    }

    /// Match-relative time in ms; 0 while the match clock is stopped.
    pub fn current_tick(&self, now: Instant) -> i64 {
        match self.play_started {
            Some(start) => ms(now.saturating_duration_since(start)),
            None => 0,
        }
    }

    fn is_host(&self, stream: StreamId) -> bool {
        self.host == Some(stream)
    }

    fn player_index(&self, stream: StreamId) -> Option<usize> {
        self.players.iter().position(|p| p.stream == Some(stream))
    }

    fn player_index_by_id(&self, id: PlayerId) -> Option<usize> {
        self.players.iter().position(|p| p.player_id == id)
    }

    fn users_json(&self) -> Value {
        serde_json::to_value(&self.players).unwrap_or(Value::Array(Vec::new()))
    }

    // -------------------------------------------------------------------------
    // State push
    // -------------------------------------------------------------------------

    fn state_json(&self, stream: StreamId, ctx: &EngineContext) -> Value {
        let mut state = match serde_json::to_value(&self.config) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        state.insert("cmd".to_string(), json!("state"));
        state.insert("engine".to_string(), json!(self.base.id));
        state.insert("interval".to_string(), json!(ctx.tick_interval_ms()));
        state.insert("playerLimit".to_string(), json!(self.base.player_limit));
        state.insert("users".to_string(), self.users_json());
        state.insert("host".to_string(), json!(self.is_host(stream)));

        if let Some(started_at) = self.started_at {
            state.insert("startedAt".to_string(), json!(started_at));
        }

        if self.play_started.is_some() {
            state.insert("tick".to_string(), json!(self.current_tick(ctx.now())));
        }

        if let Some(player) = self.player_by_stream(stream) {
            state.insert("playerId".to_string(), json!(player.player_id));
        }

        Value::Object(state)
    }

    fn push_state(&mut self, stream: StreamId, ctx: &mut EngineContext) {
        let state = self.state_json(stream, ctx);
        ctx.send(stream, EngineKind::Conquest.op(), state);
    }

    // -------------------------------------------------------------------------
    // Roster
    // -------------------------------------------------------------------------

    fn player_enroll(&mut self, caller: &Caller<'_>, character: &str, ctx: &mut EngineContext) -> Result<PlayerId, CommandError> {
        if !matches!(self.config.game_state, GameState::Connect | GameState::Finished) {
            return Err(CommandError::InvalidState);
        }

        if let Some(existing) = self.player_by_username(caller.username()) {
            warn!(engine = %self.base.key(), user = %caller.username(), "player already enrolled");
            return Ok(existing.player_id);
        }

        if self.players.len() >= self.base.player_limit {
            return Err(CommandError::PlayerLimitReached);
        }

        if !character.is_empty() && self.players.iter().any(|p| p.character == character) {
            warn!(engine = %self.base.key(), character, "character already used");
            return Err(CommandError::EnrollFailed);
        }

        let player_id = self.players.iter().map(|p| p.player_id + 1).max().unwrap_or(1);

        let mut player = ConquestPlayer::new(player_id, caller.username(), Some(caller.stream));
        player.character = character.to_string();
        self.players.push(player);

        debug!(engine = %self.base.key(), user = %caller.username(), player = player_id, "player enrolled");

        ctx.spawn_job(EngineJob::LookupNickname {
            username: caller.username().to_string(),
        });
        ctx.trigger();

        Ok(player_id)
    }

    /// Mark the caller ready; starts play once nobody is left waiting.
    fn player_prepared(&mut self, stream: StreamId, ctx: &mut EngineContext) -> Reply {
        let mut modified = false;
        let mut waiting = 0;

        for p in &mut self.players {
            if p.stream == Some(stream) {
                if !p.prepared {
                    p.prepared = true;
                    modified = true;
                }
            } else if !p.prepared {
                waiting += 1;
            }
        }

        let mut reply = Reply::new();

        if waiting > 0 {
            trace!(engine = %self.base.key(), waiting, "waiting for players to prepare");
            if modified {
                ctx.trigger();
            }
            reply.insert("wait".to_string(), json!(waiting));
            return reply;
        }

        if self.config.game_state == GameState::Prepare {
            self.play_start(ctx);
        }

        reply.insert("play".to_string(), json!(true));
        reply
    }

    fn play_start(&mut self, ctx: &mut EngineContext) {
        info!(engine = %self.base.key(), players = self.players.len(), "conquest play");

        self.play_started = Some(ctx.now());
        self.started_at = Some(ctx.clock().unix_ms);
        self.duration_ms = 0;
        self.config.game_state = GameState::Play;
        self.config.current_stage = Stage::Prepare;
        self.config.current_turn = None;

        for p in &mut self.players {
            p.hp = self.config.start_hp;
            p.streak = 0;
        }

        ctx.trigger();
    }

    // -------------------------------------------------------------------------
    // World setup
    // -------------------------------------------------------------------------

    fn prepare_world(&mut self, name: Option<&str>) -> Result<(), CommandError> {
        let template = self
            .settings
            .worlds
            .find(name, self.players.len())
            .ok_or(CommandError::NoWorld)?;

        self.config.world = ConquestWorld::from_template(template);
        trace!(engine = %self.base.key(), world = %self.config.world.name, "world prepared");
        Ok(())
    }

    fn prepare_player_order(&mut self) {
        let mut order: Vec<PlayerId> = self.players.iter().map(|p| p.player_id).collect();
        order.shuffle(&mut self.rng);
        trace!(engine = %self.base.key(), ?order, "player order");
        self.config.order = order;
    }

    /// Give every player a fortified starting land, avoiding lands next
    /// to an existing fortress when possible.
    fn pick_start_lands(&mut self) {
        let mut free: Vec<usize> = (0..self.config.world.land_list.len())
            .filter(|i| self.config.world.land_list[*i].proprietor.is_none())
            .collect();

        let ids: Vec<PlayerId> = self.players.iter().map(|p| p.player_id).collect();

        for player in ids {
            if free.is_empty() {
                error!(engine = %self.base.key(), "no free land for start position");
                return;
            }

            let mut choice = self.rng.gen_range(0..free.len());
            for _ in 0..10 {
                let world = &self.config.world;
                let near_fortress = world
                    .neighbours(&world.land_list[free[choice]].id)
                    .iter()
                    .filter_map(|n| world.land(n))
                    .any(|n| n.fortress.is_some());
                if !near_fortress {
                    break;
                }
                choice = self.rng.gen_range(0..free.len());
            }

            let idx = free.swap_remove(choice);
            let land = &mut self.config.world.land_list[idx];
            land.proprietor = Some(player);
            land.fortress = Some(INITIAL_FORTRESS);
            land.xp = 0;
            land.xp_once = 0;
        }
    }

    fn prepare_turns(&mut self, stage: Stage) {
        self.config.turn_list.clear();
        self.config.current_turn = None;

        let order = self.config.order.clone();
        let template = turn_template(order.len());

        if template.is_empty() {
            return;
        }

        match stage {
            Stage::Pick => {
                let rounds = match order.len() {
                    2 => 4,
                    3 => 3,
                    _ => 2,
                };
                for round in template.iter().take(rounds) {
                    for (i, idx) in round.iter().enumerate() {
                        let sub = if i == 0 { SubStage::UserAnswer } else { SubStage::UserSelect };
                        self.config.turn_list.push(ConquestTurn::new(order[*idx], sub));
                    }
                }
            }
            Stage::Battle => {
                let repeat = if order.len() == 4 { 1 } else { 2 };
                for _ in 0..repeat {
                    for round in template {
                        for idx in round.iter() {
                            let player = order[*idx];
                            let mut turn = ConquestTurn::new(player, SubStage::UserSelect);
                            if !self.config.check_player_lands(player) {
                                turn.player = None;
                            }
                            self.config.turn_list.push(turn);
                        }
                    }
                }
            }
            Stage::LastRound => {
                let mut ranked: Vec<&ConquestPlayer> = self.players.iter().collect();
                ranked.sort_by(|a, b| b.xp.cmp(&a.xp));
                for p in ranked {
                    let mut turn = ConquestTurn::new(p.player_id, SubStage::UserSelect);
                    if !self.config.check_player_lands(p.player_id) {
                        turn.player = None;
                    }
                    self.config.turn_list.push(turn);
                }
            }
            Stage::Invalid | Stage::Prepare => {}
        }
    }

    /// Lands `player` may pick: neighbours of its own lands, or any
    /// eligible land when it has no such neighbour. Fortresses cannot be
    /// attacked in the first battle round.
    fn pickable_lands(&self, player: PlayerId, turn_index: usize) -> Vec<String> {
        let stage = self.config.current_stage;
        let first_round = stage == Stage::Battle && turn_index < self.config.order.len();
        let world = &self.config.world;

        let eligible = |land: &ConquestLand| {
            if land.proprietor == Some(player) {
                return false;
            }
            if stage == Stage::Pick && land.proprietor.is_some() {
                return false;
            }
            !(first_round && land.fortress.is_some())
        };

        let mut near: Vec<&str> = world
            .land_list
            .iter()
            .filter(|l| l.proprietor == Some(player))
            .flat_map(|l| world.neighbours(&l.id).iter().map(String::as_str))
            .collect();
        near.sort_unstable();
        near.dedup();

        let list: Vec<String> = world
            .land_list
            .iter()
            .filter(|&l| near.contains(&l.id.as_str()) && eligible(l))
            .map(|l| l.id.clone())
            .collect();

        if !list.is_empty() {
            return list;
        }

        world
            .land_list
            .iter()
            .filter(|&l| eligible(l))
            .map(|l| l.id.clone())
            .collect()
    }

    fn remove_eliminated_from_turns(&mut self) {
        let ids: Vec<PlayerId> = self.players.iter().map(|p| p.player_id).collect();
        for id in ids {
            if !self.config.check_player_lands(id) {
                trace!(engine = %self.base.key(), player = id, "player eliminated");
                self.config.remove_player_from_next_turns(id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Questions
    // -------------------------------------------------------------------------

    fn question_next(&mut self) -> bool {
        match self.questions.next() {
            Some(q) => {
                self.config.current_question = q;
                true
            }
            None => {
                error!(engine = %self.base.key(), "question queue empty");
                false
            }
        }
    }

    fn question_clear(&mut self) {
        self.config.current_question = Value::Null;
    }

    fn question_check(&mut self, ctx: &mut EngineContext) {
        let Some(host) = self.host else {
            return;
        };
        if self.questions.request_due(ctx.now()) {
            trace!(engine = %self.base.key(), queued = self.questions.len(), "question request");
            ctx.send(host, EngineKind::Conquest.op(), json!({ "cmd": "questionRequest" }));
        }
    }

    /// Answer window length in ms: the configured timeout, or the
    /// question's `duration` (ms) when longer, capped at
    /// [`MAX_ANSWER_WINDOW`].
    fn answer_window(&self) -> i64 {
        let duration = self
            .config
            .current_question
            .get("duration")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .clamp(0, ms(MAX_ANSWER_WINDOW));
        ms(self.settings.answer_timeout).max(duration)
    }

    // -------------------------------------------------------------------------
    // Stage machine
    // -------------------------------------------------------------------------

    /// Advance on deadline. Returns `true` when a sub-stage changed.
    fn check_turn(&mut self, ctx: &mut EngineContext) -> bool {
        if self.config.game_state != GameState::Play {
            return false;
        }

        let tick = self.current_tick(ctx.now());

        if self.config.current_stage == Stage::Prepare {
            if tick >= ms(self.settings.prepare_delay) && self.questions.has_question() {
                self.play_begin(ctx);
                return true;
            }
            return false;
        }

        let Some(turn) = self.config.current() else {
            return false;
        };

        if turn.sub_stage_end == 0 || turn.sub_stage_end > tick {
            return false;
        }

        self.next_sub_stage(ctx);
        true
    }

    fn play_begin(&mut self, ctx: &mut EngineContext) {
        debug!(engine = %self.base.key(), "game play begin");
        self.config.current_stage = Stage::Pick;

        if !self.next_pick(false, ctx) {
            error!(engine = %self.base.key(), "play begin failed");
            self.game_finish(true, ctx);
        }
        ctx.trigger();
    }

    fn next_sub_stage(&mut self, ctx: &mut EngineContext) {
        if self.config.game_state != GameState::Play {
            return;
        }

        let ok = match self.config.current_stage {
            Stage::Pick => self.next_pick(true, ctx),
            Stage::Battle => self.next_battle(true, false, ctx),
            Stage::LastRound => self.next_battle(true, true, ctx),
            Stage::Prepare => true,
            Stage::Invalid => false,
        };

        if !ok {
            error!(engine = %self.base.key(), stage = ?self.config.current_stage, "next sub-stage failed");
            self.game_finish(true, ctx);
            return;
        }

        ctx.trigger();
    }

    fn next_pick(&mut self, advance: bool, ctx: &mut EngineContext) -> bool {
        if self.config.game_state != GameState::Play || self.config.current_stage != Stage::Pick {
            return false;
        }

        let tick = self.current_tick(ctx.now());
        let wait = ms(self.settings.wait_delay);
        let mut next = self.config.current_turn.map(|c| c + 1).unwrap_or(0);

        if let Some(cur) = self.config.current_turn.filter(|c| *c < self.config.turn_list.len()) {
            match self.config.turn_list[cur].sub_stage {
                SubStage::UserAnswer => {
                    // Shared question resolved: every correct answerer keeps
                    // its select turn in this round, the rest are voided and
                    // lose one hp.
                    let answered = self.config.turn_list[cur].clone();
                    self.config.turn_list[cur].open(SubStage::Wait, tick, tick.saturating_add(wait));

                    for i in cur..self.config.turn_list.len() {
                        let t = &mut self.config.turn_list[i];
                        if i > cur && t.sub_stage != SubStage::UserSelect {
                            break;
                        }
                        let keep = t.player.map(|p| answered.answer_is_success(p, false)).unwrap_or(false);
                        if !keep {
                            if let Some(p) = t.player.and_then(|p| self.players.iter_mut().find(|x| x.player_id == p)) {
                                p.hp = p.hp.saturating_sub(1);
                            }
                            t.player = None;
                            if i > cur {
                                t.close();
                            }
                        }
                    }

                    self.question_clear();
                    return true;
                }
                SubStage::Wait => {
                    next = cur;
                    self.config.turn_list[cur].open(SubStage::UserSelect, 0, 0);
                }
                _ => self.config.turn_list[cur].close(),
            }
            self.config.turn_list[cur].clear();
        }

        if advance {
            while next < self.config.turn_list.len() {
                let (sub, player) = {
                    let t = &self.config.turn_list[next];
                    (t.sub_stage, t.player)
                };

                if sub == SubStage::UserAnswer {
                    self.question_clear();
                    if !self.question_next() {
                        return false;
                    }
                    let end = tick.saturating_add(self.answer_window());
                    self.config.turn_list[next].open(SubStage::UserAnswer, tick, end);
                    self.config.current_turn = Some(next);
                    return true;
                }

                let Some(player) = player else {
                    next += 1;
                    continue;
                };

                let lands = self.pickable_lands(player, next);
                if lands.is_empty() {
                    trace!(engine = %self.base.key(), player, "no more pickable lands");
                    break;
                }

                let end = tick.saturating_add(ms(self.settings.select_timeout));
                let t = &mut self.config.turn_list[next];
                t.can_pick = lands;
                t.open(SubStage::UserSelect, tick, end);
                self.config.current_turn = Some(next);
                return true;
            }
        }

        if !self.config.has_free_land() {
            debug!(engine = %self.base.key(), "pick stage over");
            self.config.current_stage = Stage::Battle;
            self.config.current_turn = None;
            self.config.turn_list.clear();
            return self.next_battle(false, false, ctx);
        }

        self.prepare_turns(Stage::Pick);

        if self.config.turn_list.is_empty() {
            error!(engine = %self.base.key(), "empty pick turn list");
            return false;
        }

        self.next_pick(true, ctx)
    }

    fn next_battle(&mut self, advance: bool, last_round: bool, ctx: &mut EngineContext) -> bool {
        if self.config.game_state != GameState::Play
            || !matches!(self.config.current_stage, Stage::Battle | Stage::LastRound)
        {
            return false;
        }

        let tick = self.current_tick(ctx.now());

        if let Some(cur) = self.config.current_turn.filter(|c| *c < self.config.turn_list.len()) {
            match self.config.turn_list[cur].sub_stage {
                SubStage::UserSelect => {
                    if self.config.turn_list[cur].picked_id.is_empty() {
                        let player = self.config.turn_list[cur].player;
                        debug!(engine = %self.base.key(), ?player, "attack target missing");
                        if let Some(p) = player.and_then(|p| self.player_index_by_id(p)) {
                            self.players[p].answered(false);
                        }
                    } else {
                        self.config.turn_list[cur].can_pick.clear();
                        if !self.open_battle_question(cur, tick) {
                            return false;
                        }
                        return true;
                    }
                }
                SubStage::UserAnswer => return self.resolve_battle(cur, tick),
                SubStage::Wait => {
                    let turn = &self.config.turn_list[cur];
                    let siege = turn.answer_state == AnswerState::PlayerWin
                        && self
                            .config
                            .world
                            .land(&turn.picked_id)
                            .map(|l| l.is_fortified())
                            .unwrap_or(false);

                    if siege {
                        let turn = &mut self.config.turn_list[cur];
                        turn.answer_list.clear();
                        turn.answer_state = AnswerState::Pending;
                        return self.open_battle_question(cur, tick);
                    }
                }
                _ => {}
            }

            let turn = &mut self.config.turn_list[cur];
            turn.close();
            turn.clear();
        }

        let mut next = self.config.current_turn.map(|c| c + 1).unwrap_or(0);

        if advance {
            if !self.config.has_opponents() {
                debug!(engine = %self.base.key(), "one proprietor left");
                self.game_finish(false, ctx);
                return true;
            }

            while next < self.config.turn_list.len() {
                let Some(player) = self.config.turn_list[next].player else {
                    next += 1;
                    continue;
                };

                let lands = self.pickable_lands(player, next);
                if lands.is_empty() {
                    debug!(engine = %self.base.key(), player, "no attackable land, turn skipped");
                    let t = &mut self.config.turn_list[next];
                    t.player = None;
                    t.close();
                    next += 1;
                    continue;
                }

                let end = tick.saturating_add(ms(self.settings.select_timeout));
                let t = &mut self.config.turn_list[next];
                t.can_pick = lands;
                t.picked_id.clear();
                t.open(SubStage::UserSelect, tick, end);
                self.config.current_turn = Some(next);
                return true;
            }

            if last_round {
                debug!(engine = %self.base.key(), "last round over");
                self.game_finish(false, ctx);
                return true;
            }

            debug!(engine = %self.base.key(), "last round");
            self.config.current_stage = Stage::LastRound;
            self.config.current_turn = None;
            self.config.turn_list.clear();
            return self.next_battle(false, true, ctx);
        }

        self.prepare_turns(if last_round { Stage::LastRound } else { Stage::Battle });

        if self.config.turn_list.is_empty() {
            error!(engine = %self.base.key(), "empty battle turn list");
            return false;
        }

        self.next_battle(true, last_round, ctx)
    }

    fn open_battle_question(&mut self, cur: usize, tick: i64) -> bool {
        self.question_clear();
        if !self.question_next() {
            return false;
        }
        let end = tick.saturating_add(self.answer_window());
        self.config.turn_list[cur].open(SubStage::UserAnswer, tick, end);
        true
    }

    /// Close an attack's answer window.
    ///
    /// The attacker wins only with the fastest correct answer. A won
    /// attack takes an unfortified land, or knocks one level off a
    /// fortress; the last level falling hands over every land of the
    /// defender. A lost attack credits a defender who answered correctly.
    /// Both sides' hp and streak follow their own answers.
    fn resolve_battle(&mut self, cur: usize, tick: i64) -> bool {
        let (attacker, land_id) = {
            let turn = &self.config.turn_list[cur];
            (turn.player, turn.picked_id.clone())
        };

        let Some(attacker) = attacker else {
            return false;
        };

        let Some(land) = self.config.world.land(&land_id) else {
            error!(engine = %self.base.key(), land = %land_id, "invalid attacked land");
            return false;
        };

        let defender = land.proprietor;
        let fortified = land.is_fortified();

        let turn = &self.config.turn_list[cur];
        let won = turn.answer_is_success(attacker, true);
        let answered = turn.answer_is_success(attacker, false);
        let defended = defender.map(|d| turn.answer_is_success(d, false)).unwrap_or(false);

        let Some(a_idx) = self.player_index_by_id(attacker) else {
            error!(engine = %self.base.key(), player = attacker, "invalid attacker");
            return false;
        };

        self.players[a_idx].answered(answered);
        if let Some(d_idx) = defender.and_then(|d| self.player_index_by_id(d)) {
            self.players[d_idx].answered(defended);
        }

        if won {
            self.config.turn_list[cur].answer_state = AnswerState::PlayerWin;

            if !fortified {
                if let Err(err) = self.config.land_swap_player(&land_id, &mut self.players[a_idx]) {
                    error!(engine = %self.base.key(), error = %err, "land swap failed");
                    return false;
                }
            } else if let Some(land) = self.config.world.land_mut(&land_id) {
                let level = land.fortress.unwrap_or(0).saturating_sub(1);
                if level == 0 {
                    land.fortress = None;
                    land.xp = LAND_XP;
                    land.xp_once = LAND_XP_ONCE;
                    if let Some(defender) = defender {
                        let taken = self.config.all_land_swap_player(&mut self.players[a_idx], defender);
                        info!(engine = %self.base.key(), attacker, defender, lands = taken, "fortress fallen");
                    }
                } else {
                    land.fortress = Some(level);
                }
            }

            self.remove_eliminated_from_turns();
        } else {
            self.config.turn_list[cur].answer_state = AnswerState::PlayerLost;

            if defended {
                if let Some(d_idx) = defender.and_then(|d| self.player_index_by_id(d)) {
                    self.config.land_defended(&land_id, &mut self.players[d_idx]);
                }
            }
        }

        let wait = ms(self.settings.wait_delay);
        self.config.turn_list[cur].open(SubStage::Wait, tick, tick.saturating_add(wait));
        self.question_clear();
        true
    }

    /// End the match. Only a running match is finished; results are
    /// computed and handed to the directory.
    fn game_finish(&mut self, has_error: bool, ctx: &mut EngineContext) {
        if self.config.game_state != GameState::Play {
            return;
        }

        if has_error {
            warn!(engine = %self.base.key(), "conquest finished with error");
        } else {
            info!(engine = %self.base.key(), "conquest finished");
        }

        self.duration_ms = self.current_tick(ctx.now());
        self.play_started = None;
        self.config.game_state = if has_error { GameState::Error } else { GameState::Finished };
        self.config.current_question = Value::Null;

        let best = self.players.iter().map(|p| p.xp).max().unwrap_or(0);

        for p in &mut self.players {
            p.success = !has_error && p.xp == best;

            ctx.spawn_job(EngineJob::RecordResult(GameRecord {
                username: p.username.clone(),
                map: self.config.map.clone(),
                mission: self.config.mission.clone(),
                level: self.config.level,
                success: p.success,
                xp: p.xp,
                duration_ms: self.duration_ms,
            }));
        }

        ctx.trigger();
    }

    /// Terminal state after every stream has gone.
    fn force_finish(&mut self, ctx: &mut EngineContext) {
        match self.config.game_state {
            GameState::Play => self.game_finish(false, ctx),
            GameState::Finished | GameState::Error => {}
            _ => {
                self.config.game_state = GameState::Finished;
                ctx.trigger();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn cmd_enroll(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        let character = msg.get("character").and_then(Value::as_str).unwrap_or_default();
        let id = self.player_enroll(caller, character, ctx)?;

        let mut reply = Reply::new();
        reply.insert("playerId".to_string(), json!(id));
        Ok(reply)
    }

    fn cmd_leave(&mut self, caller: &Caller<'_>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        if let Some(idx) = self.players.iter().position(|p| p.username == caller.username()) {
            if matches!(self.config.game_state, GameState::Prepare | GameState::Play) {
                warn!(engine = %self.base.key(), user = %caller.username(), "leave refused during game");
                return Err(CommandError::LeaveFailed);
            }
            let player = self.players.remove(idx);
            debug!(engine = %self.base.key(), player = player.player_id, "player left");
        }

        ctx.unlink(caller.stream);
        ctx.trigger();

        let mut reply = Reply::new();
        reply.insert("leaved".to_string(), json!(true));
        Ok(reply)
    }

    fn cmd_start(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        if !matches!(self.config.game_state, GameState::Connect | GameState::Finished) {
            return Err(CommandError::InvalidState);
        }

        if !self.is_host(caller.stream) {
            return Err(CommandError::PermissionDenied);
        }

        if self.players.len() < 2 {
            return Err(CommandError::InsufficientPlayers);
        }

        if self.config.game_state == GameState::Finished {
            let waiting = self.players.iter().filter(|p| p.prepared).count();
            if waiting > 0 {
                trace!(engine = %self.base.key(), waiting, "waiting for players to unprepare");
                let mut reply = Reply::new();
                reply.insert("wait".to_string(), json!(waiting));
                return Ok(reply);
            }
        }

        let world = msg.get("world").and_then(Value::as_str);
        if self.settings.worlds.find(world, self.players.len()).is_none() {
            error!(engine = %self.base.key(), players = self.players.len(), "no available world");
            return Err(CommandError::NoWorld);
        }

        self.config.reset();
        self.questions.clear();
        self.started_at = None;
        for p in &mut self.players {
            p.reset();
        }

        self.prepare_world(world)?;
        self.prepare_player_order();
        self.pick_start_lands();
        self.config.game_state = GameState::Prepare;

        info!(engine = %self.base.key(), world = %self.config.world.name, "conquest prepare");
        ctx.trigger();

        let mut reply = Reply::new();
        reply.insert("world".to_string(), json!(self.config.world.name));
        Ok(reply)
    }

    fn cmd_prepare(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        let flag = |name: &str| msg.get(name).and_then(Value::as_bool).unwrap_or(false);

        if self.config.game_state == GameState::Finished && flag("unprepare") {
            let mut modified = false;
            for p in &mut self.players {
                if p.stream == Some(caller.stream) && p.prepared {
                    p.prepared = false;
                    modified = true;
                }
            }
            if modified {
                ctx.trigger();
            }
            return Ok(Reply::new());
        }

        if !matches!(self.config.game_state, GameState::Prepare | GameState::Play) {
            return Err(CommandError::InvalidState);
        }

        if flag("ready") {
            if self.player_index(caller.stream).is_none() {
                return Err(CommandError::PermissionDenied);
            }
            return Ok(self.player_prepared(caller.stream, ctx));
        }

        Ok(Reply::new())
    }

    fn cmd_play(&mut self, caller: &Caller<'_>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        match self.config.game_state {
            GameState::Play => {
                ctx.trigger();
                Ok(Reply::new())
            }
            GameState::Prepare => {
                if self.player_index(caller.stream).is_none() {
                    return Err(CommandError::PermissionDenied);
                }
                Ok(self.player_prepared(caller.stream, ctx))
            }
            _ if !self.is_host(caller.stream) => Err(CommandError::PermissionDenied),
            _ => Err(CommandError::InvalidState),
        }
    }

    fn cmd_question_request(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>) -> Result<Reply, CommandError> {
        if !matches!(self.config.game_state, GameState::Prepare | GameState::Play) {
            return Err(CommandError::InvalidState);
        }

        if !self.is_host(caller.stream) {
            return Err(CommandError::PermissionDenied);
        }

        let list = msg.get("list").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
        self.questions.upload(list);
        debug!(engine = %self.base.key(), uploaded = list.len(), queued = self.questions.len(), "questions uploaded");

        Ok(Reply::new())
    }

    fn cmd_pick(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        if self.config.game_state != GameState::Play {
            return Err(CommandError::InvalidState);
        }

        let idx = self.player_index(caller.stream).ok_or(CommandError::PermissionDenied)?;
        let land = msg.get("id").and_then(Value::as_str).ok_or(CommandError::InvalidLand)?;

        self.config.land_pick(land, &mut self.players[idx])?;
        trace!(engine = %self.base.key(), player = self.players[idx].player_id, land, "land picked");

        self.next_sub_stage(ctx);
        Ok(Reply::new())
    }

    fn cmd_answer(&mut self, caller: &Caller<'_>, msg: &Map<String, Value>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        if self.config.game_state != GameState::Play {
            return Err(CommandError::InvalidState);
        }

        let idx = self.player_index(caller.stream).ok_or(CommandError::PermissionDenied)?;
        let player = self.players[idx].player_id;
        let battle = matches!(self.config.current_stage, Stage::Battle | Stage::LastRound);

        let (attacker, start) = {
            let turn = self.config.current().ok_or(CommandError::InvalidState)?;
            (turn.player, turn.sub_stage_start)
        };
        let defender = self.config.picked_land_proprietor();

        if battle && Some(player) != attacker && Some(player) != defender {
            return Err(CommandError::PermissionDenied);
        }

        let answer = ConquestAnswer {
            player,
            answer: msg.get("answer").cloned().unwrap_or(Value::Null),
            success: msg.get("success").and_then(Value::as_bool).unwrap_or(false),
            elapsed: (self.current_tick(ctx.now()) - start).max(0),
        };

        self.config.player_answer(answer)?;

        let expected: Vec<PlayerId> = if battle {
            attacker.into_iter().chain(defender).collect()
        } else {
            self.players.iter().map(|p| p.player_id).collect()
        };

        let complete = self
            .config
            .current()
            .map(|t| expected.iter().all(|p| t.answer_get(*p).is_some()))
            .unwrap_or(false);

        if complete {
            self.next_sub_stage(ctx);
        }

        let mut reply = Reply::new();
        reply.insert("status".to_string(), json!("ok"));
        Ok(reply)
    }

    fn cmd_finish(&mut self, caller: &Caller<'_>, ctx: &mut EngineContext) -> Result<Reply, CommandError> {
        if !self.is_host(caller.stream) {
            return Err(CommandError::PermissionDenied);
        }

        match self.config.game_state {
            GameState::Play => self.game_finish(false, ctx),
            GameState::Prepare => {
                self.config.game_state = GameState::Finished;
                ctx.trigger();
            }
            _ => return Err(CommandError::InvalidState),
        }

        Ok(Reply::new())
    }
}

impl Engine for ConquestEngine {
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

    fn can_delete(&self, use_count: usize) -> bool {
        use_count == 1 && self.config.game_state.is_idle()
    }

    fn timer_tick(&mut self, ctx: &mut EngineContext) {
        match self.config.game_state {
            GameState::Finished | GameState::Error => return,
            GameState::Prepare | GameState::Play => {
                let pick_phase = matches!(self.config.current_stage, Stage::Prepare | Stage::Pick);
                if self.config.game_state == GameState::Play
                    && pick_phase
                    && self.current_tick(ctx.now()) >= ms(self.settings.game_timeout)
                {
                    info!(engine = %self.base.key(), "conquest timeout");
                    self.game_finish(true, ctx);
                    return;
                }

                self.question_check(ctx);

                if self.check_turn(ctx) {
                    return;
                }
            }
            _ => {}
        }

        let due = self
            .last_state_sent
            .map(|last| ctx.now().saturating_duration_since(last) >= self.settings.state_interval)
            .unwrap_or(true);

        if due {
            ctx.trigger();
        }
    }

    fn trigger_event(&mut self, ctx: &mut EngineContext) {
        self.last_state_sent = Some(ctx.now());
        let streams = self.base.streams().to_vec();
        for stream in streams {
            self.push_state(stream, ctx);
        }
    }

    fn stream_trigger_event(&mut self, stream: StreamId, ctx: &mut EngineContext) {
        self.push_state(stream, ctx);
    }

    fn stream_linked_event(&mut self, caller: &Caller<'_>, ctx: &mut EngineContext) {
        if let Some(player) = self.players.iter_mut().find(|p| p.username == caller.username()) {
            if player.stream != Some(caller.stream) {
                player.attach(caller.stream);
                debug!(engine = %self.base.key(), player = player.player_id, "player stream attached");
            }
        }

        if self.host.is_none() {
            self.host = Some(caller.stream);
            if self.owner.is_empty() {
                self.owner = caller.username().to_string();
            }
        }

        ctx.trigger();
    }

    fn stream_unlinked_event(&mut self, stream: StreamId, ctx: &mut EngineContext) {
        for p in &mut self.players {
            if p.stream == Some(stream) {
                p.detach();
            }
        }

        if !self.is_host(stream) {
            debug!(engine = %self.base.key(), stream = %stream, "player stream lost");
            ctx.trigger();
            return;
        }

        match self.base.streams().first().copied() {
            Some(next) => {
                debug!(engine = %self.base.key(), host = %next, "host migrated");
                self.host = Some(next);
                ctx.trigger();
            }
            None => {
                info!(engine = %self.base.key(), "all streams gone");
                self.host = None;
                self.force_finish(ctx);
            }
        }
    }

    fn handle_command(
        &mut self,
        caller: &Caller<'_>,
        cmd: &str,
        msg: &Map<String, Value>,
        ctx: &mut EngineContext,
    ) -> Result<Reply, CommandError> {
        match cmd {
            "state" => {
                self.push_state(caller.stream, ctx);
                Ok(Reply::new())
            }
            "enroll" => self.cmd_enroll(caller, msg, ctx),
            "leave" => self.cmd_leave(caller, ctx),
            "start" => self.cmd_start(caller, msg, ctx),
            "prepare" => self.cmd_prepare(caller, msg, ctx),
            "play" => self.cmd_play(caller, ctx),
            "questionRequest" => self.cmd_question_request(caller, msg),
            "pick" => self.cmd_pick(caller, msg, ctx),
            "answer" => self.cmd_answer(caller, msg, ctx),
            "finish" => self.cmd_finish(caller, ctx),
            _ => Err(CommandError::InvalidCommand),
        }
    }

    fn job_finished(&mut self, result: JobResult, ctx: &mut EngineContext) {
        match result {
            JobResult::Nickname { username, nickname } => {
                let Some(nickname) = nickname else {
                    return;
                };
                if let Some(p) = self.players.iter_mut().find(|p| p.username == username) {
                    p.full_nick_name = nickname;
                    ctx.trigger();
                }
            }
            JobResult::ResultRecorded { username, ok } => {
                if ok {
                    trace!(engine = %self.base.key(), user = %username, "result recorded");
                } else {
                    error!(engine = %self.base.key(), user = %username, "result not recorded");
                }
            }
        }
    }
}
