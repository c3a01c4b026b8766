//! Turns, sub-stages and answers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{minus_one, PlayerId};

/// Phase of a running match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    #[default]
    Invalid,

    /// Countdown before the first pick.
    Prepare,

    /// Free lands are distributed.
    Pick,

    /// Players attack each other's lands.
    Battle,

    /// One final attack per player, highest xp first.
    LastRound,
}

/// Phase of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubStage {
    #[default]
    Invalid,
    UserSelect,
    UserAnswer,

    /// Pause between a resolution and the next step.
    Wait,
    Finished,
}

/// Outcome of the last battle question of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnswerState {
    #[default]
    Pending,
    PlayerWin,
    PlayerLost,
}

/// One player's answer within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestAnswer {
    pub player: PlayerId,

    #[serde(default)]
    pub answer: Value,

    pub success: bool,

    /// Milliseconds between the answer window opening and the answer
    /// reaching the server.
    pub elapsed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestTurn {
    /// Acting player; `None` once the turn is void.
    #[serde(with = "minus_one")]
    pub player: Option<PlayerId>,

    pub sub_stage: SubStage,

    /// Match tick (ms) when the current sub-stage opened.
    pub sub_stage_start: i64,

    /// Deadline tick of the current sub-stage; 0 means none.
    pub sub_stage_end: i64,

    /// Land chosen this turn; empty when nothing is picked.
    pub picked_id: String,

    pub can_pick: Vec<String>,
    pub answer_list: Vec<ConquestAnswer>,
    pub answer_state: AnswerState,
}

impl ConquestTurn {
    pub fn new(player: PlayerId, sub_stage: SubStage) -> Self {
        ConquestTurn {
            player: Some(player),
            sub_stage,
            ..ConquestTurn::default()
        }
    }

    pub fn open(&mut self, sub_stage: SubStage, start: i64, end: i64) {
        self.sub_stage = sub_stage;
        self.sub_stage_start = start;
        self.sub_stage_end = end;
    }

    pub fn close(&mut self) {
        self.open(SubStage::Finished, 0, 0);
    }

    /// Forget candidates and answers; the picked land stays for display.
    pub fn clear(&mut self) {
        self.can_pick.clear();
        self.answer_list.clear();
        self.answer_state = AnswerState::Pending;
    }

    /// Answer recorded for `player`, successful or not.
    pub fn answer_get(&self, player: PlayerId) -> Option<&ConquestAnswer> {
        self.answer_list.iter().find(|a| a.player == player)
    }

    /// The winning answer of this turn if it belongs to `player`.
    ///
    /// Among successful answers only the fastest counts; on equal
    /// `elapsed` the one recorded first wins. Any other success is void.
    pub fn answer_get_success(&self, player: PlayerId) -> Option<&ConquestAnswer> {
        self.answer_list
            .iter()
            .filter(|a| a.success)
            .min_by_key(|a| a.elapsed)
            .filter(|a| a.player == player)
    }

    /// Whether `player` answered correctly; with `fastest_only` the answer
    /// must also be the winning one.
    pub fn answer_is_success(&self, player: PlayerId, fastest_only: bool) -> bool {
        if fastest_only {
            self.answer_get_success(player).is_some()
        } else {
            self.answer_get(player).map(|a| a.success).unwrap_or(false)
        }
    }
}
