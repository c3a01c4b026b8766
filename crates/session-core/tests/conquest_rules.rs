// crates/session-core/tests/conquest_rules.rs
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use session_core::conquest::{
    default_start_hp, ConquestAnswer, ConquestConfig, ConquestLand, ConquestPlayer, ConquestTurn, ConquestWorld,
    QuestionQueue, Stage, SubStage, WorldCatalog, LAND_XP, LAND_XP_ONCE, QUEUE_TARGET, STREAK_SIZE,
};
use session_core::CommandError;

fn grid_config() -> ConquestConfig {
    let catalog = WorldCatalog::builtin();
    let mut config = ConquestConfig::new("europe", "m1", 1);
    config.world = ConquestWorld::from_template(catalog.find(None, 2).unwrap());
    config
}

fn select_turn(config: &mut ConquestConfig, player: u32, can_pick: &[&str]) {
    let mut turn = ConquestTurn::new(player, SubStage::UserSelect);
    turn.can_pick = can_pick.iter().map(|s| s.to_string()).collect();
    config.turn_list.push(turn);
    config.current_turn = Some(config.turn_list.len() - 1);
}

fn answer(player: u32, success: bool, elapsed: i64) -> ConquestAnswer {
    ConquestAnswer {
        player,
        answer: Value::Null,
        success,
        elapsed,
    }
}

#[test]
fn pick_stage_claims_a_free_land() {
    let mut config = grid_config();
    config.current_stage = Stage::Pick;
    select_turn(&mut config, 1, &["L1", "L2"]);

    let mut alice = ConquestPlayer::new(1, "alice", None);
    config.land_pick("L1", &mut alice).unwrap();

    let land = config.world.land("L1").unwrap();
    assert_eq!(land.proprietor, Some(1));
    assert_eq!(alice.xp, LAND_XP);
    assert_eq!(config.current().unwrap().picked_id, "L1");
}

#[test]
fn pick_out_of_turn_changes_nothing() {
    let mut config = grid_config();
    config.current_stage = Stage::Pick;
    select_turn(&mut config, 1, &["L1"]);

    let mut bob = ConquestPlayer::new(2, "bob", None);
    assert_eq!(config.land_pick("L1", &mut bob), Err(CommandError::PermissionDenied));
    assert_eq!(config.world.land("L1").unwrap().proprietor, None);
    assert_eq!(bob.xp, 0);

    let mut alice = ConquestPlayer::new(1, "alice", None);
    assert_eq!(config.land_pick("L7", &mut alice), Err(CommandError::InvalidLand));

    config.current_mut().unwrap().sub_stage = SubStage::UserAnswer;
    assert_eq!(config.land_pick("L1", &mut alice), Err(CommandError::InvalidState));
}

#[test]
fn battle_pick_only_targets_the_land() {
    let mut config = grid_config();
    config.current_stage = Stage::Battle;
    config.world.land_mut("L1").unwrap().proprietor = Some(1);
    select_turn(&mut config, 2, &["L1"]);

    let mut bob = ConquestPlayer::new(2, "bob", None);
    config.land_pick("L1", &mut bob).unwrap();

    assert_eq!(config.world.land("L1").unwrap().proprietor, Some(1));
    assert_eq!(config.picked_land_proprietor(), Some(1));
    assert_eq!(bob.xp, 0);
}

#[test]
fn answers_are_recorded_once_and_only_while_open() {
    let mut config = grid_config();
    config.current_stage = Stage::Pick;
    select_turn(&mut config, 1, &[]);

    assert_eq!(config.player_answer(answer(1, true, 10)), Err(CommandError::InvalidState));

    config.current_mut().unwrap().sub_stage = SubStage::UserAnswer;
    config.player_answer(answer(1, true, 10)).unwrap();
    assert_eq!(config.player_answer(answer(1, false, 20)), Err(CommandError::AlreadyAnswered));
    assert_eq!(config.current().unwrap().answer_list.len(), 1);
}

#[test]
fn only_the_fastest_success_counts() {
    let mut turn = ConquestTurn::new(1, SubStage::UserAnswer);
    turn.answer_list.push(answer(1, true, 500));
    turn.answer_list.push(answer(2, true, 300));
    turn.answer_list.push(answer(3, false, 100));

    assert!(turn.answer_get_success(1).is_none());
    assert_eq!(turn.answer_get_success(2).unwrap().elapsed, 300);
    assert!(turn.answer_get_success(3).is_none());

    // A slower success is still a success, just not the winning one.
    assert!(turn.answer_is_success(1, false));
    assert!(!turn.answer_is_success(1, true));
}

#[test]
fn equal_elapsed_goes_to_the_first_recorded() {
    let mut turn = ConquestTurn::new(1, SubStage::UserAnswer);
    turn.answer_list.push(answer(2, true, 400));
    turn.answer_list.push(answer(1, true, 400));

    assert!(turn.answer_is_success(2, true));
    assert!(!turn.answer_is_success(1, true));
}

#[test]
fn conquest_spends_the_one_time_bonus() {
    let mut config = grid_config();
    config.current_stage = Stage::Battle;
    config.world.land_mut("L2").unwrap().proprietor = Some(2);
    select_turn(&mut config, 1, &["L2"]);
    config.current_mut().unwrap().sub_stage = SubStage::UserAnswer;

    let mut bob = ConquestPlayer::new(2, "bob", None);
    assert_eq!(config.land_swap_player("L2", &mut bob), Err(CommandError::PermissionDenied));

    let mut alice = ConquestPlayer::new(1, "alice", None);
    config.land_swap_player("L2", &mut alice).unwrap();

    let land = config.world.land("L2").unwrap();
    assert_eq!(land.proprietor, Some(1));
    assert_eq!(land.xp_once, 0);
    assert_eq!(alice.xp, LAND_XP + LAND_XP_ONCE);
}

#[test]
fn fallen_fortress_hands_over_every_land() {
    let mut config = grid_config();
    for (id, owner) in [("L1", 2), ("L2", 2), ("L3", 1)] {
        config.world.land_mut(id).unwrap().proprietor = Some(owner);
    }
    config.world.land_mut("L1").unwrap().fortress = Some(0);

    let mut alice = ConquestPlayer::new(1, "alice", None);
    assert_eq!(config.all_land_swap_player(&mut alice, 2), 2);

    assert!(!config.check_player_lands(2));
    assert!(!config.has_opponents());
    assert_eq!(config.world.land("L1").unwrap().fortress, None);
    assert!(config.has_free_land());
}

#[test]
fn eliminated_player_loses_later_turns() {
    let mut config = grid_config();
    for player in [1, 2, 1, 2] {
        config.turn_list.push(ConquestTurn::new(player, SubStage::UserSelect));
    }
    config.current_turn = Some(0);

    config.remove_player_from_next_turns(2);

    let players: Vec<Option<u32>> = config.turn_list.iter().map(|t| t.player).collect();
    assert_eq!(players, vec![Some(1), None, Some(1), None]);
    assert_eq!(config.turn_list[1].sub_stage, SubStage::Finished);
}

#[test]
fn successful_defence_credits_the_owner() {
    let mut config = grid_config();
    config.world.land_mut("L4").unwrap().proprietor = Some(2);

    let mut bob = ConquestPlayer::new(2, "bob", None);
    assert!(config.land_defended("L4", &mut bob));
    assert_eq!(bob.xp, LAND_XP);

    let mut alice = ConquestPlayer::new(1, "alice", None);
    assert!(!config.land_defended("L4", &mut alice));
}

#[test]
fn absent_ids_travel_as_minus_one() {
    let land = ConquestLand::new("L1");
    let v = serde_json::to_value(&land).unwrap();
    assert_eq!(v["proprietor"], -1);
    assert_eq!(v["fortress"], -1);
    assert_eq!(v["xpOnce"], LAND_XP_ONCE);

    let parsed: ConquestLand =
        serde_json::from_value(json!({"id": "L9", "proprietor": 3, "xp": 1, "xpOnce": 0, "fortress": -1})).unwrap();
    assert_eq!(parsed.proprietor, Some(3));
    assert_eq!(parsed.fortress, None);
}

#[test]
fn builtin_grid_is_symmetric() {
    let catalog = WorldCatalog::builtin();
    let world = ConquestWorld::from_template(catalog.find(Some("grid"), 4).unwrap());

    assert_eq!(world.land_list.len(), 12);
    assert_eq!(world.neighbours("L1"), ["L2".to_string(), "L5".to_string()]);
    assert!(world.neighbours("L6").contains(&"L2".to_string()));
    assert_eq!(world.neighbours("L6").len(), 4);

    // A world needs more lands than players.
    assert!(catalog.find(None, 12).is_none());
    assert!(catalog.find(Some("moon"), 2).is_none());
}

#[test]
fn catalog_file_is_normalized() {
    let text = r#"{"worlds": [{
        "name": "duel",
        "playerCount": 2,
        "lands": ["A", "B", "C"],
        "adjacency": {"A": ["B", "Z"], "C": ["B"]}
    }]}"#;

    let catalog = WorldCatalog::from_json(text).unwrap();
    let world = ConquestWorld::from_template(catalog.find(None, 2).unwrap());

    assert_eq!(world.neighbours("B"), ["A".to_string(), "C".to_string()]);
    assert_eq!(world.neighbours("A"), ["B".to_string()]);
    assert!(catalog.find(None, 3).is_none());
}

#[test]
fn question_requests_are_throttled() {
    let mut queue = QuestionQueue::new();
    let t0 = Instant::now();

    assert!(queue.request_due(t0));
    assert!(!queue.request_due(t0 + Duration::from_secs(1)));
    assert!(queue.request_due(t0 + Duration::from_secs(6)));

    let full: Vec<Value> = (0..QUEUE_TARGET).map(|i| json!({ "q": i })).collect();
    queue.upload(&full);
    assert!(!queue.request_due(t0 + Duration::from_secs(60)));

    assert_eq!(queue.next(), Some(json!({"q": 0})));
    assert_eq!(queue.len(), QUEUE_TARGET - 1);
}

#[test]
fn start_hp_grows_with_the_mission_level() {
    assert_eq!(default_start_hp(1), 2);
    assert_eq!(default_start_hp(2), 3);
    assert_eq!(default_start_hp(3), 4);
    assert_eq!(default_start_hp(7), 4);
    assert_eq!(ConquestConfig::new("europe", "m1", 2).start_hp, 3);
}

#[test]
fn answer_streak_restores_hp() {
    let mut alice = ConquestPlayer::new(1, "alice", None);
    alice.hp = 1;

    for _ in 0..STREAK_SIZE - 1 {
        alice.answered(true);
    }
    assert_eq!(alice.hp, 1);

    alice.answered(true);
    assert_eq!(alice.hp, 2);
    assert_eq!(alice.streak, STREAK_SIZE);

    alice.answered(false);
    alice.answered(false);
    alice.answered(false);
    assert_eq!(alice.hp, 0);
    assert_eq!(alice.streak, 0);
}
