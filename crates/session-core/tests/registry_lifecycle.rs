// crates/session-core/tests/registry_lifecycle.rs
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use session_core::conquest::{
    AnswerState, ConquestPlayer, ConquestTurn, GameState, Stage, SubStage, WorldCatalog, WorldTemplate,
};
use session_core::{
    ConnectPolicy, ConquestEngine, ConquestSettings, Credential, DirectoryError, EngineKey, EngineKind,
    EngineRegistry, GameRecord, Output, PlayerId, RegistrySettings, StreamId, UserDirectory,
};

#[derive(Default)]
struct TestDirectory {
    records: Mutex<Vec<GameRecord>>,
}

impl UserDirectory for TestDirectory {
    fn nickname(&self, username: &str) -> Option<String> {
        Some(format!("{username} the brave"))
    }

    fn record_game(&self, record: &GameRecord) -> Result<(), DirectoryError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Registry plus an inline job runner standing in for the server.
struct Harness {
    registry: EngineRegistry,
    directory: TestDirectory,
    sent: Vec<(StreamId, String, Value)>,
    closed: Vec<StreamId>,
}

impl Harness {
    fn new(policy: ConnectPolicy) -> Self {
        Harness::with_settings(RegistrySettings {
            connect_policy: policy,
            seed: Some(7),
            ..RegistrySettings::default()
        })
    }

    fn with_settings(settings: RegistrySettings) -> Self {
        Harness {
            registry: EngineRegistry::new(settings),
            directory: TestDirectory::default(),
            sent: Vec::new(),
            closed: Vec::new(),
        }
    }

    fn login(&mut self, n: u64, username: &str) -> StreamId {
        let stream = StreamId(n);
        self.registry.stream_add(stream, "127.0.0.1", "test-agent");
        assert!(self.registry.stream_authenticated(stream, Credential::new(username)));
        self.pump();
        stream
    }

    /// Route everything the registry queued; jobs run inline.
    fn pump(&mut self) {
        loop {
            let outputs = self.registry.drain();
            if outputs.is_empty() {
                break;
            }
            for out in outputs {
                match out {
                    Output::Send { stream, op, data } => self.sent.push((stream, op, data)),
                    Output::Close { stream } => self.closed.push(stream),
                    Output::Job { engine, job } => {
                        let result = job.run(&self.directory);
                        self.registry.job_finished(engine, result);
                    }
                }
            }
        }
    }

    /// Send one command and return the reply addressed to `stream`.
    fn command(&mut self, stream: StreamId, kind: EngineKind, payload: Value) -> Value {
        let cmd = payload["cmd"].as_str().unwrap_or_default().to_string();
        self.sent.clear();
        self.registry.handle_message(stream, kind, &payload);
        self.pump();
        self.sent
            .iter()
            .find(|(s, op, d)| *s == stream && op == kind.op() && d["cmd"] == cmd.as_str())
            .map(|(_, _, d)| d.clone())
            .unwrap_or(Value::Null)
    }

    fn tick(&mut self, by: Duration) {
        self.registry.advance(by);
        self.registry.timer_tick();
        self.pump();
    }

    fn conquest(&self, id: u32) -> &ConquestEngine {
        self.registry
            .engine_get_as::<ConquestEngine>(EngineKey::new(EngineKind::Conquest, id))
            .unwrap()
    }

    fn player(&self, id: PlayerId) -> &ConquestPlayer {
        self.conquest(1).players().iter().find(|p| p.player_id == id).unwrap()
    }

    fn turn(&self) -> ConquestTurn {
        self.conquest(1).config().current().unwrap().clone()
    }
}

fn create_payload() -> Value {
    json!({"cmd": "create", "map": "europe", "mission": "m1", "level": 1})
}

/// alice creates, bob joins and enrolls.
fn two_player_lobby(h: &mut Harness) -> (StreamId, StreamId) {
    let alice = h.login(1, "alice");
    let bob = h.login(2, "bob");

    let created = h.command(alice, EngineKind::Conquest, create_payload());
    assert_eq!(created["created"], true);
    assert_eq!(created["engine"], 1);

    let joined = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect", "engine": 1}));
    assert_eq!(joined["engine"], 1);

    let enrolled = h.command(bob, EngineKind::Conquest, json!({"cmd": "enroll"}));
    assert_eq!(enrolled["playerId"], 2);

    (alice, bob)
}

/// Lobby -> start -> both ready -> Play.
fn start_match(h: &mut Harness, world: &str) -> (StreamId, StreamId) {
    let (alice, bob) = two_player_lobby(h);

    let started = h.command(alice, EngineKind::Conquest, json!({"cmd": "start"}));
    assert_eq!(started["world"], world);

    assert_eq!(
        h.command(alice, EngineKind::Conquest, json!({"cmd": "prepare", "ready": true}))["wait"],
        1
    );
    assert_eq!(
        h.command(bob, EngineKind::Conquest, json!({"cmd": "prepare", "ready": true}))["play"],
        true
    );
    assert_eq!(h.conquest(1).config().game_state, GameState::Play);

    (alice, bob)
}

#[test]
fn create_validates_match_parameters() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "create"}));
    assert_eq!(reply["error"], "missing map");

    let reply = h.command(
        alice,
        EngineKind::Conquest,
        json!({"cmd": "create", "map": "europe", "mission": "m1"}),
    );
    assert_eq!(reply["error"], "missing level");

    assert!(h.registry.engines_of(EngineKind::Conquest).is_empty());
}

#[test]
fn created_engine_is_held_by_its_stream() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    h.command(alice, EngineKind::Conquest, create_payload());
    let key = EngineKey::new(EngineKind::Conquest, 1);

    assert_eq!(h.registry.use_count(key), Some(2));
    assert_eq!(h.conquest(1).host(), Some(alice));
    assert_eq!(h.conquest(1).owner(), "alice");
    assert_eq!(h.conquest(1).players()[0].full_nick_name, "alice the brave");

    // A second create from the same stream is refused.
    let reply = h.command(alice, EngineKind::Conquest, create_payload());
    assert_eq!(reply["error"], "engine already connected");
}

#[test]
fn engine_ids_are_unique_per_kind() {
    let mut h = Harness::new(ConnectPolicy::Strict);
    let alice = h.login(1, "alice");
    let bob = h.login(2, "bob");

    h.command(alice, EngineKind::Conquest, create_payload());
    let second = h.command(bob, EngineKind::Conquest, create_payload());
    assert_eq!(second["engine"], 2);

    let exam = h.command(alice, EngineKind::Exam, json!({"cmd": "connect"}));
    assert_eq!(exam["engine"], 1);
}

#[test]
fn strict_connect_requires_an_engine_id() {
    let mut h = Harness::new(ConnectPolicy::Strict);
    let alice = h.login(1, "alice");
    let bob = h.login(2, "bob");

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect"}));
    assert_eq!(reply["error"], "invalid engine");

    h.command(alice, EngineKind::Conquest, create_payload());

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect"}));
    assert_eq!(reply["error"], "ambiguous engine");

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect", "engine": 9}));
    assert_eq!(reply["error"], "invalid engine");

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect", "engine": 1}));
    assert_eq!(reply["engine"], 1);
}

#[test]
fn single_instance_connect_creates_then_joins() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");
    let bob = h.login(2, "bob");

    let mut payload = create_payload();
    payload["cmd"] = json!("connect");
    let first = h.command(alice, EngineKind::Conquest, payload);
    assert_eq!(first["created"], true);
    assert_eq!(first["engine"], 1);

    let second = h.command(bob, EngineKind::Conquest, json!({"cmd": "connect"}));
    assert_eq!(second["engine"], 1);
    assert_eq!(h.registry.engines_of(EngineKind::Conquest).len(), 1);
}

#[test]
fn commands_without_a_linked_engine_are_rejected() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "start"}));
    assert_eq!(reply["error"], "invalid engine");

    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "dance"}));
    assert_eq!(reply["error"], "invalid command");

    let reply = h.command(alice, EngineKind::Exam, json!({"cmd": "grade"}));
    assert_eq!(reply["error"], "invalid command");
}

#[test]
fn unauthenticated_stream_cannot_issue_commands() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let anon = StreamId(9);
    h.registry.stream_add(anon, "127.0.0.1", "test-agent");

    let reply = h.command(anon, EngineKind::Conquest, create_payload());
    assert_eq!(reply["error"], "permission denied");
}

#[test]
fn start_enforces_host_and_player_count() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");
    let bob = h.login(2, "bob");

    h.command(alice, EngineKind::Conquest, create_payload());
    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "start"}));
    assert_eq!(reply["error"], "insufficient players");

    h.command(bob, EngineKind::Conquest, json!({"cmd": "connect", "engine": 1}));
    h.command(bob, EngineKind::Conquest, json!({"cmd": "enroll"}));

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "start"}));
    assert_eq!(reply["error"], "permission denied");
    assert_eq!(h.conquest(1).config().game_state, GameState::Connect);
}

#[test]
fn enroll_is_idempotent_per_username() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (_alice, bob) = two_player_lobby(&mut h);

    let again = h.command(bob, EngineKind::Conquest, json!({"cmd": "enroll"}));
    assert_eq!(again["playerId"], 2);
    assert_eq!(h.conquest(1).players().len(), 2);
}

#[test]
fn play_begins_only_when_everyone_is_prepared() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, _bob) = two_player_lobby(&mut h);

    h.command(alice, EngineKind::Conquest, json!({"cmd": "start"}));
    let engine = h.conquest(1);
    assert_eq!(engine.config().game_state, GameState::Prepare);

    // Every player starts on one fortified land.
    let fortified = engine
        .config()
        .world
        .land_list
        .iter()
        .filter(|l| l.fortress.is_some())
        .count();
    assert_eq!(fortified, 2);

    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "prepare", "ready": true}));
    assert_eq!(reply["wait"], 1);
    assert_eq!(h.conquest(1).config().game_state, GameState::Prepare);
}

#[test]
fn host_is_asked_for_questions_while_preparing() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, bob) = two_player_lobby(&mut h);
    h.command(alice, EngineKind::Conquest, json!({"cmd": "start"}));

    h.sent.clear();
    h.tick(Duration::from_millis(10));

    let asked = |s: StreamId| {
        h.sent
            .iter()
            .any(|(to, op, d)| *to == s && op == "conquest" && d["cmd"] == "questionRequest")
    };
    assert!(asked(alice));
    assert!(!asked(bob));

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "questionRequest", "list": [{}]}));
    assert_eq!(reply["error"], "permission denied");
}

#[test]
fn fastest_correct_answer_earns_the_pick() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, bob) = start_match(&mut h, "grid");

    h.command(
        alice,
        EngineKind::Conquest,
        json!({"cmd": "questionRequest", "list": [{"q": 1}, {"q": 2}, {"q": 3}]}),
    );

    // Countdown over: the shared question of the first pick round opens.
    h.tick(Duration::from_secs(3));
    let config = h.conquest(1).config();
    assert_eq!(config.current_stage, Stage::Pick);
    assert_eq!(config.current().unwrap().sub_stage, SubStage::UserAnswer);
    assert_eq!(config.current_question, json!({"q": 1}));

    h.tick(Duration::from_millis(200));
    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "answer", "answer": 1, "success": true}));
    assert_eq!(reply["status"], "ok");

    let reply = h.command(alice, EngineKind::Conquest, json!({"cmd": "answer", "answer": 1, "success": true}));
    assert_eq!(reply["error"], "already answered");

    h.command(bob, EngineKind::Conquest, json!({"cmd": "answer", "answer": 2, "success": false}));
    assert_eq!(h.conquest(1).config().current().unwrap().sub_stage, SubStage::Wait);

    // A missed shared question costs one life.
    assert_eq!(h.player(1).hp, 2);
    assert_eq!(h.player(2).hp, 1);

    // After the pause only alice holds a select turn this round.
    h.tick(Duration::from_secs(3));
    let config = h.conquest(1).config();
    let turn = config.current().unwrap();
    assert_eq!(turn.sub_stage, SubStage::UserSelect);
    assert_eq!(turn.player, Some(1));
    assert!(!turn.can_pick.is_empty());

    let land = turn.can_pick[0].clone();
    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "pick", "id": land}));
    assert_eq!(reply["error"], "permission denied");

    h.command(alice, EngineKind::Conquest, json!({"cmd": "pick", "id": land}));
    let engine = h.conquest(1);
    assert_eq!(engine.config().world.land(&land).unwrap().proprietor, Some(1));
    assert_eq!(engine.player_by_username("alice").unwrap().xp, 100);
}

#[test]
fn state_push_carries_the_match_view() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (_alice, bob) = two_player_lobby(&mut h);

    h.sent.clear();
    h.registry.handle_message(bob, EngineKind::Conquest, &json!({"cmd": "state"}));
    h.pump();

    let states: Vec<&Value> = h
        .sent
        .iter()
        .filter(|(_, op, d)| op == "conquest" && d["cmd"] == "state")
        .map(|(to, _, d)| {
            assert_eq!(*to, bob);
            d
        })
        .collect();
    assert_eq!(states.len(), 1);

    let state = states[0];
    assert_eq!(state["engine"], 1);
    assert_eq!(state["gameState"], "connect");
    assert_eq!(state["host"], false);
    assert_eq!(state["playerId"], 2);
    assert_eq!(state["currentTurn"], -1);
    assert_eq!(state["users"].as_array().unwrap().len(), 2);
    assert!(state.get("tick").is_none());
}

#[test]
fn host_migrates_when_the_host_stream_closes() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, bob) = two_player_lobby(&mut h);

    h.registry.stream_remove(alice);
    h.pump();

    let engine = h.conquest(1);
    assert_eq!(engine.host(), Some(bob));
    assert!(!engine.player_by_username("alice").unwrap().online);
    assert_eq!(engine.config().game_state, GameState::Connect);
}

#[test]
fn reconnect_requires_forced_while_the_old_stream_lives() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (_alice, bob) = two_player_lobby(&mut h);
    let bob_again = h.login(3, "bob");

    let reply = h.command(bob_again, EngineKind::Conquest, json!({"cmd": "connect", "engine": 1}));
    assert_eq!(reply["error"], "already connected");

    let reply = h.command(
        bob_again,
        EngineKind::Conquest,
        json!({"cmd": "connect", "engine": 1, "forced": true}),
    );
    assert_eq!(reply["engine"], 1);

    let engine = h.conquest(1);
    assert_eq!(engine.player_by_username("bob").unwrap().stream, Some(bob_again));
    assert!(h.registry.stream_engine(bob, EngineKind::Conquest, None).is_none());
}

#[test]
fn leave_is_refused_mid_game() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (_alice, bob) = start_match(&mut h, "grid");

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "leave"}));
    assert_eq!(reply["error"], "leave failed");
    assert_eq!(h.conquest(1).players().len(), 2);
}

#[test]
fn leave_in_lobby_unlinks_and_removes_the_player() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (_alice, bob) = two_player_lobby(&mut h);

    let reply = h.command(bob, EngineKind::Conquest, json!({"cmd": "leave"}));
    assert_eq!(reply["leaved"], true);
    assert_eq!(h.conquest(1).players().len(), 1);
    assert!(h.registry.stream_engines(bob).iter().all(|k| k.kind != EngineKind::Conquest));
}

#[test]
fn list_reports_joinable_engines() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");
    let carol = h.login(2, "carol");
    h.command(alice, EngineKind::Conquest, create_payload());

    let mut payload = create_payload();
    payload["cmd"] = json!("list");
    let reply = h.command(carol, EngineKind::Conquest, payload);
    assert_eq!(reply["list"], json!([{"engineId": 1, "owner": "alice"}]));

    let reply = h.command(
        carol,
        EngineKind::Conquest,
        json!({"cmd": "list", "map": "asia", "mission": "m1", "level": 1}),
    );
    assert_eq!(reply["list"], json!([]));
}

#[test]
fn finished_engine_is_reaped_after_streams_and_jobs_are_gone() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, bob) = start_match(&mut h, "grid");
    let key = EngineKey::new(EngineKind::Conquest, 1);

    // Linked streams keep the engine alive.
    h.registry.timer_minute_tick();
    h.pump();
    assert!(h.registry.engine_get(key).is_some());

    h.registry.stream_remove(alice);
    h.registry.stream_remove(bob);
    h.pump();

    assert_eq!(h.conquest(1).config().game_state, GameState::Finished);
    assert_eq!(h.registry.use_count(key), Some(1));
    assert_eq!(h.directory.records.lock().unwrap().len(), 2);

    h.registry.timer_minute_tick();
    h.pump();
    assert!(h.registry.engine_get(key).is_none());
    assert_eq!(h.registry.engine_count(), 1);
}

#[test]
fn pending_jobs_hold_the_engine() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    h.registry
        .handle_message(alice, EngineKind::Conquest, &create_payload());
    let key = EngineKey::new(EngineKind::Conquest, 1);

    // Nickname lookup still queued: registry + stream + job.
    assert_eq!(h.registry.use_count(key), Some(3));

    h.pump();
    assert_eq!(h.registry.use_count(key), Some(2));
}

#[test]
fn presence_observers_see_logins_and_logouts() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    h.sent.clear();
    assert!(h.registry.observer_add(alice, EngineKind::Peer));
    h.pump();

    let (_, _, snapshot) = h.sent.iter().find(|(s, op, _)| *s == alice && op == "peers").unwrap();
    assert_eq!(snapshot[0]["username"], "alice");

    h.sent.clear();
    let bob = h.login(2, "bob");
    let (_, _, update) = h.sent.iter().rev().find(|(s, op, _)| *s == alice && op == "peers").unwrap();
    assert_eq!(update.as_array().unwrap().len(), 2);

    h.sent.clear();
    h.registry.stream_remove(bob);
    h.pump();
    let (_, _, update) = h.sent.iter().rev().find(|(s, op, _)| *s == alice && op == "peers").unwrap();
    assert_eq!(update.as_array().unwrap().len(), 1);

    assert!(h.registry.observer_remove(alice, EngineKind::Peer));
    assert!(h.registry.observers(alice).is_empty());
    assert!(!h.registry.observer_add(alice, EngineKind::Conquest));
}

#[test]
fn close_all_blocks_new_engines() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");
    h.registry.close_all();
    h.pump();

    assert_eq!(h.closed, vec![alice]);
    assert!(h.registry.is_shutting_down());

    let reply = h.command(alice, EngineKind::Conquest, create_payload());
    assert_eq!(reply["error"], "internal error");
}

#[test]
fn forced_reconnect_of_the_last_player_keeps_the_match() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, bob) = start_match(&mut h, "grid");

    h.registry.stream_remove(bob);
    h.pump();

    let alice_again = h.login(9, "alice");
    let reply = h.command(
        alice_again,
        EngineKind::Conquest,
        json!({"cmd": "connect", "engine": 1, "forced": true}),
    );
    assert_eq!(reply["engine"], 1);

    let engine = h.conquest(1);
    assert_eq!(engine.config().game_state, GameState::Play);
    assert_eq!(engine.host(), Some(alice_again));
    assert_eq!(engine.player_by_username("alice").unwrap().stream, Some(alice_again));
    assert!(engine.player_by_username("alice").unwrap().online);
    assert!(h.registry.stream_engine(alice, EngineKind::Conquest, None).is_none());
    assert!(h.directory.records.lock().unwrap().is_empty());
}

#[test]
fn out_of_range_engine_ids_are_invalid() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    let exam = h.command(alice, EngineKind::Exam, json!({"cmd": "connect"}));
    assert_eq!(exam["engine"], 1);

    let reply = h.command(alice, EngineKind::Exam, json!({"cmd": "state", "engine": 4_294_967_297u64}));
    assert_eq!(reply["error"], "invalid engine");

    let reply = h.command(
        alice,
        EngineKind::Conquest,
        json!({"cmd": "connect", "engine": 4_294_967_297u64}),
    );
    assert_eq!(reply["error"], "invalid engine");
    assert!(h.registry.engines_of(EngineKind::Conquest).is_empty());
}

/// Length of the first answer window opened for `question`.
fn answer_window_for(question: Value) -> i64 {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let (alice, _bob) = start_match(&mut h, "grid");

    h.command(alice, EngineKind::Conquest, json!({"cmd": "questionRequest", "list": [question]}));
    h.tick(Duration::from_secs(3));

    let turn = h.turn();
    assert_eq!(turn.sub_stage, SubStage::UserAnswer);
    turn.sub_stage_end - turn.sub_stage_start
}

#[test]
fn question_duration_is_in_milliseconds_and_capped() {
    assert_eq!(answer_window_for(json!({"q": 1})), 15_000);
    assert_eq!(answer_window_for(json!({"q": 1, "duration": 5_000})), 15_000);
    assert_eq!(answer_window_for(json!({"q": 1, "duration": 20_000})), 20_000);
    assert_eq!(answer_window_for(json!({"q": 1, "duration": -1})), 15_000);
    assert_eq!(answer_window_for(json!({"q": 1, "duration": i64::MAX})), 600_000);
}

#[test]
fn create_accepts_a_start_hp() {
    let mut h = Harness::new(ConnectPolicy::SingleInstance);
    let alice = h.login(1, "alice");

    let mut payload = create_payload();
    payload["startHp"] = json!(5);
    h.command(alice, EngineKind::Conquest, payload);
    assert_eq!(h.conquest(1).config().start_hp, 5);
}

/// Three lands in a row: `A - B - C`.
fn duel_settings() -> RegistrySettings {
    let mut adjacency = BTreeMap::new();
    adjacency.insert("A".to_string(), vec!["B".to_string()]);
    adjacency.insert("B".to_string(), vec!["C".to_string()]);

    let duel = WorldTemplate {
        name: "duel".to_string(),
        description: String::new(),
        player_count: 2,
        lands: vec!["A".to_string(), "B".to_string(), "C".to_string()],
        adjacency,
    };

    RegistrySettings {
        seed: Some(7),
        conquest: Arc::new(ConquestSettings {
            worlds: WorldCatalog::new(vec![duel]),
            ..ConquestSettings::default()
        }),
        ..RegistrySettings::default()
    }
}

struct Duel {
    /// First in the player order; wins the only free land.
    first: PlayerId,
    second: PlayerId,
    first_stream: StreamId,
    second_stream: StreamId,
    contested: String,
}

/// Start a duel and play its pick stage: both answer the shared question,
/// the first player takes the free land, then battle begins.
fn duel_through_pick_stage(h: &mut Harness) -> Duel {
    let (alice, bob) = start_match(h, "duel");
    let stream = move |id: PlayerId| if id == 1 { alice } else { bob };

    let questions: Vec<Value> = (1..=10).map(|q| json!({"q": q})).collect();
    h.command(alice, EngineKind::Conquest, json!({"cmd": "questionRequest", "list": questions}));

    h.tick(Duration::from_secs(3));
    assert_eq!(h.conquest(1).config().current_stage, Stage::Pick);

    let order = h.conquest(1).config().order.clone();
    let (first, second) = (order[0], order[1]);

    let free: Vec<String> = h
        .conquest(1)
        .config()
        .world
        .land_list
        .iter()
        .filter(|l| l.proprietor.is_none())
        .map(|l| l.id.clone())
        .collect();
    assert_eq!(free.len(), 1);
    let contested = free[0].clone();

    for id in [first, second] {
        h.command(stream(id), EngineKind::Conquest, json!({"cmd": "answer", "answer": 1, "success": true}));
    }
    assert_eq!(h.turn().sub_stage, SubStage::Wait);

    h.tick(Duration::from_secs(3));
    let turn = h.turn();
    assert_eq!(turn.player, Some(first));
    assert_eq!(turn.can_pick, vec![contested.clone()]);

    h.command(stream(first), EngineKind::Conquest, json!({"cmd": "pick", "id": contested}));
    assert_eq!(h.player(first).xp, 100);
    assert_eq!(h.conquest(1).config().current_stage, Stage::Battle);

    Duel {
        first,
        second,
        first_stream: stream(first),
        second_stream: stream(second),
        contested,
    }
}

impl Duel {
    /// One battle question: the second player (attacker) answers right,
    /// the first (defender) wrong.
    fn attacker_wins(&self, h: &mut Harness) {
        assert_eq!(h.turn().sub_stage, SubStage::UserAnswer);
        let reply = h.command(self.second_stream, EngineKind::Conquest, json!({"cmd": "answer", "success": true}));
        assert_eq!(reply["status"], "ok");
        h.command(self.first_stream, EngineKind::Conquest, json!({"cmd": "answer", "success": false}));

        let turn = h.turn();
        assert_eq!(turn.sub_stage, SubStage::Wait);
        assert_eq!(turn.answer_state, AnswerState::PlayerWin);
    }
}

#[test]
fn battle_takes_the_free_land_then_storms_the_fortress() {
    let mut h = Harness::with_settings(duel_settings());
    let d = duel_through_pick_stage(&mut h);

    // Fortresses are spared in the first battle round, so the first
    // player has nothing to attack and loses the turn.
    let config = h.conquest(1).config();
    assert_eq!(config.turn_list[0].player, None);
    let turn = h.turn();
    assert_eq!(turn.player, Some(d.second));
    assert_eq!(turn.can_pick, vec![d.contested.clone()]);

    let reply = h.command(d.first_stream, EngineKind::Conquest, json!({"cmd": "pick", "id": d.contested}));
    assert_eq!(reply["error"], "permission denied");

    h.command(d.second_stream, EngineKind::Conquest, json!({"cmd": "pick", "id": d.contested}));
    d.attacker_wins(&mut h);

    let land = h.conquest(1).config().world.land(&d.contested).unwrap().clone();
    assert_eq!(land.proprietor, Some(d.second));
    assert_eq!(land.xp_once, 0);
    assert_eq!(h.player(d.second).xp, 300);
    assert_eq!(h.player(d.first).hp, 1);

    // Next turn: the only target left is the first player's fortress.
    h.tick(Duration::from_secs(3));
    let fortress = h
        .conquest(1)
        .config()
        .world
        .land_list
        .iter()
        .find(|l| l.proprietor == Some(d.first))
        .map(|l| l.id.clone())
        .unwrap();
    let turn = h.turn();
    assert_eq!(turn.player, Some(d.second));
    assert_eq!(turn.can_pick, vec![fortress.clone()]);

    h.command(d.second_stream, EngineKind::Conquest, json!({"cmd": "pick", "id": fortress}));
    d.attacker_wins(&mut h);
    assert_eq!(h.conquest(1).config().world.land(&fortress).unwrap().fortress, Some(2));

    // A won siege asks again on the same turn.
    let siege_turn = h.conquest(1).config().current_turn;
    h.tick(Duration::from_secs(3));
    let turn = h.turn();
    assert_eq!(h.conquest(1).config().current_turn, siege_turn);
    assert_eq!(turn.sub_stage, SubStage::UserAnswer);
    assert!(turn.answer_list.is_empty());

    d.attacker_wins(&mut h);
    assert_eq!(h.conquest(1).config().world.land(&fortress).unwrap().fortress, Some(1));

    h.tick(Duration::from_secs(3));
    d.attacker_wins(&mut h);

    // The fortress fell and every land changed hands.
    let config = h.conquest(1).config();
    assert_eq!(config.world.land(&fortress).unwrap().fortress, None);
    assert!(config.world.land_list.iter().all(|l| l.proprietor == Some(d.second)));
    assert!(config.turn_list.iter().skip(siege_turn.unwrap() + 1).all(|t| t.player != Some(d.first)));
    assert_eq!(h.player(d.second).xp, 600);

    // Four right answers in a row restore one life; misses stop at zero.
    assert_eq!(h.player(d.second).streak, 4);
    assert_eq!(h.player(d.second).hp, 3);
    assert_eq!(h.player(d.first).hp, 0);
    assert_eq!(h.player(d.first).streak, 0);

    let state = h.command(d.first_stream, EngineKind::Conquest, json!({"cmd": "state"}));
    let users = state["users"].as_array().unwrap();
    assert!(users.iter().all(|u| u["hp"].is_u64() && u["streak"].is_u64()));

    // One proprietor left: the match ends.
    h.tick(Duration::from_secs(3));
    assert_eq!(h.conquest(1).config().game_state, GameState::Finished);
    assert!(h.player(d.second).success);
    assert!(!h.player(d.first).success);

    let records = h.directory.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.success == (r.xp == 600)));
}

#[test]
fn idle_battle_costs_hp_and_runs_into_the_last_round() {
    let mut h = Harness::with_settings(duel_settings());
    let d = duel_through_pick_stage(&mut h);

    let mut ticks = 0;
    while h.conquest(1).config().current_stage == Stage::Battle {
        h.tick(Duration::from_secs(16));
        ticks += 1;
        assert!(ticks < 20, "battle stage never ended");
    }

    // Every missed select cost a life.
    assert_eq!(h.player(d.first).hp, 0);
    assert_eq!(h.player(d.second).hp, 0);

    // The last round runs highest xp first.
    let config = h.conquest(1).config();
    assert_eq!(config.current_stage, Stage::LastRound);
    let players: Vec<Option<PlayerId>> = config.turn_list.iter().map(|t| t.player).collect();
    assert_eq!(players, vec![Some(d.first), Some(d.second)]);
    assert_eq!(h.turn().player, Some(d.first));

    // Fortresses are fair game in the last round.
    let target = h
        .conquest(1)
        .config()
        .world
        .land_list
        .iter()
        .find(|l| l.proprietor == Some(d.second))
        .map(|l| l.id.clone())
        .unwrap();
    assert!(h.turn().can_pick.contains(&target));

    while h.conquest(1).config().game_state == GameState::Play {
        h.tick(Duration::from_secs(16));
        ticks += 1;
        assert!(ticks < 30, "last round never ended");
    }

    assert_eq!(h.conquest(1).config().game_state, GameState::Finished);
    assert!(h.player(d.first).success);
    assert!(!h.player(d.second).success);
}
