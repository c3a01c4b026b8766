//! Authoritative state of one match.
//!
//! `ConquestConfig` is exchanged wholesale with clients on every state
//! push. The land rules live here so they can be exercised without an
//! engine:
//! - `land_pick` (pick stage ownership, battle target selection),
//! - `player_answer` (one answer per player per turn),
//! - `land_swap_player` / `all_land_swap_player` (battle conquest),
//! - `land_defended` (successful defence).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::player::ConquestPlayer;
use super::turn::{ConquestAnswer, ConquestTurn, Stage, SubStage};
use super::world::ConquestWorld;
use crate::error::CommandError;
use crate::types::{minus_one, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameState {
    #[default]
    Invalid,
    Connect,
    Prepare,
    Play,
    Finished,
    Error,
}

impl GameState {
    /// States in which the engine may be reaped once nothing holds it.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            GameState::Invalid | GameState::Connect | GameState::Finished | GameState::Error
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GameState::Finished | GameState::Error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestConfig {
    pub map: String,
    pub mission: String,
    pub level: u32,

    /// Lives every player begins play with.
    pub start_hp: u32,

    pub game_state: GameState,
    pub world: ConquestWorld,

    /// Randomized player order the turn templates index into.
    pub order: Vec<PlayerId>,

    pub turn_list: Vec<ConquestTurn>,

    #[serde(with = "minus_one")]
    pub current_turn: Option<usize>,

    pub current_stage: Stage,

    /// Opaque quiz payload of the open answer window; `null` otherwise.
    pub current_question: Value,
}

/// Lives by mission level when the match does not set its own.
pub fn default_start_hp(level: u32) -> u32 {
    match level {
        0 | 1 => 2,
        2 => 3,
        _ => 4,
    }
}

impl ConquestConfig {
    pub fn new(map: impl Into<String>, mission: impl Into<String>, level: u32) -> Self {
        ConquestConfig {
            map: map.into(),
            mission: mission.into(),
            level,
            start_hp: default_start_hp(level),
            game_state: GameState::Connect,
            ..ConquestConfig::default()
        }
    }

    /// Back to the lobby, keeping map, mission and level.
    pub fn reset(&mut self) {
        self.game_state = GameState::Connect;
        self.world.clear();
        self.order.clear();
        self.turn_list.clear();
        self.current_turn = None;
        self.current_stage = Stage::Invalid;
        self.current_question = Value::Null;
    }

    pub fn current(&self) -> Option<&ConquestTurn> {
        self.current_turn.and_then(|i| self.turn_list.get(i))
    }

    pub fn current_mut(&mut self) -> Option<&mut ConquestTurn> {
        self.current_turn.and_then(|i| self.turn_list.get_mut(i))
    }

    /// Claim or target a land during the acting player's select window.
    ///
    /// In the pick stage the land must be free; it passes to `player` at
    /// once and its `xp` is credited. In battle stages the land only
    /// becomes the turn's target; ownership changes later through
    /// [`ConquestConfig::land_swap_player`].
    pub fn land_pick(&mut self, land_id: &str, player: &mut ConquestPlayer) -> Result<(), CommandError> {
        let stage = self.current_stage;

        let turn = self
            .current_turn
            .and_then(|i| self.turn_list.get(i))
            .ok_or(CommandError::InvalidState)?;

        if turn.sub_stage != SubStage::UserSelect {
            return Err(CommandError::InvalidState);
        }

        if turn.player != Some(player.player_id) {
            return Err(CommandError::PermissionDenied);
        }

        if !turn.can_pick.iter().any(|id| id == land_id) {
            return Err(CommandError::InvalidLand);
        }

        let land = self.world.land_mut(land_id).ok_or(CommandError::InvalidLand)?;

        match stage {
            Stage::Pick => {
                if land.proprietor.is_some() {
                    return Err(CommandError::InvalidLand);
                }
                land.proprietor = Some(player.player_id);
                player.xp += land.xp;
            }
            Stage::Battle | Stage::LastRound => {
                if land.proprietor == Some(player.player_id) {
                    return Err(CommandError::InvalidLand);
                }
            }
            _ => return Err(CommandError::InvalidState),
        }

        if let Some(turn) = self.current_mut() {
            turn.picked_id = land_id.to_string();
        }

        Ok(())
    }

    /// Record an answer in the open answer window.
    pub fn player_answer(&mut self, answer: ConquestAnswer) -> Result<(), CommandError> {
        let turn = self.current_mut().ok_or(CommandError::InvalidState)?;

        if turn.sub_stage != SubStage::UserAnswer {
            return Err(CommandError::InvalidState);
        }

        if turn.answer_get(answer.player).is_some() {
            return Err(CommandError::AlreadyAnswered);
        }

        turn.answer_list.push(answer);
        Ok(())
    }

    /// Owner of the land targeted by the current turn.
    pub fn picked_land_proprietor(&self) -> Option<PlayerId> {
        let turn = self.current()?;
        self.world.land(&turn.picked_id)?.proprietor
    }

    /// Hand a conquered land to the attacker of the current turn.
    ///
    /// The attacker gains the land's `xp` plus its one-time bonus, which
    /// is then spent.
    pub fn land_swap_player(&mut self, land_id: &str, attacker: &mut ConquestPlayer) -> Result<(), CommandError> {
        let turn = self.current().ok_or(CommandError::InvalidState)?;

        if turn.sub_stage != SubStage::UserAnswer {
            return Err(CommandError::InvalidState);
        }

        if turn.player != Some(attacker.player_id) {
            return Err(CommandError::PermissionDenied);
        }

        let land = self.world.land_mut(land_id).ok_or(CommandError::InvalidLand)?;

        land.proprietor = Some(attacker.player_id);
        attacker.xp += land.xp + land.xp_once;
        land.xp_once = 0;
        Ok(())
    }

    /// Every land of `defender` passes to `attacker` (fortress fallen).
    pub fn all_land_swap_player(&mut self, attacker: &mut ConquestPlayer, defender: PlayerId) -> usize {
        let mut count = 0;

        for land in &mut self.world.land_list {
            if land.proprietor != Some(defender) {
                continue;
            }
            land.proprietor = Some(attacker.player_id);
            land.fortress = None;
            attacker.xp += land.xp + land.xp_once;
            land.xp_once = 0;
            count += 1;
        }

        count
    }

    /// Credit a successful defence.
    pub fn land_defended(&mut self, land_id: &str, defender: &mut ConquestPlayer) -> bool {
        match self.world.land(land_id) {
            Some(land) if land.proprietor == Some(defender.player_id) => {
                defender.xp += land.xp;
                true
            }
            _ => false,
        }
    }

    /// Whether `player` still owns any land.
    pub fn check_player_lands(&self, player: PlayerId) -> bool {
        self.world.land_list.iter().any(|l| l.proprietor == Some(player))
    }

    /// Void every turn of `player` after the current one.
    pub fn remove_player_from_next_turns(&mut self, player: PlayerId) {
        let from = self.current_turn.map(|i| i + 1).unwrap_or(0);

        for turn in self.turn_list.iter_mut().skip(from) {
            if turn.player == Some(player) {
                turn.player = None;
                turn.close();
            }
        }
    }

    pub fn has_free_land(&self) -> bool {
        self.world.land_list.iter().any(|l| l.proprietor.is_none())
    }

    /// Whether at least two different players still own land.
    pub fn has_opponents(&self) -> bool {
        let mut owners = self.world.land_list.iter().filter_map(|l| l.proprietor);
        match owners.next() {
            Some(first) => owners.any(|p| p != first),
            None => false,
        }
    }
}
