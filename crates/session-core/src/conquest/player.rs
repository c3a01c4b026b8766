use serde::{Deserialize, Serialize};

use crate::types::{PlayerId, StreamId};

/// Every this many correct battle answers in a row earn one hp.
pub const STREAK_SIZE: u32 = 4;

/// One enrolled player of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestPlayer {
    pub player_id: PlayerId,
    pub username: String,

    /// Display name; the username until the directory lookup returns.
    pub full_nick_name: String,

    #[serde(default)]
    pub character: String,

    pub xp: i64,

    /// Lives left; set to the match's `start_hp` when play begins.
    pub hp: u32,

    /// Correct battle answers in a row.
    pub streak: u32,

    pub online: bool,
    pub prepared: bool,
    pub success: bool,

    #[serde(skip)]
    pub stream: Option<StreamId>,
}

impl ConquestPlayer {
    pub fn new(player_id: PlayerId, username: impl Into<String>, stream: Option<StreamId>) -> Self {
        let username = username.into();
        ConquestPlayer {
            player_id,
            full_nick_name: username.clone(),
            username,
            character: String::new(),
            xp: 0,
            hp: 0,
            streak: 0,
            online: stream.is_some(),
            prepared: false,
            success: false,
            stream,
        }
    }

    /// Clear per-match results before a new game.
    pub fn reset(&mut self) {
        self.xp = 0;
        self.hp = 0;
        self.streak = 0;
        self.prepared = false;
        self.success = false;
    }

    /// Score one battle answer: a miss costs one hp and breaks the
    /// streak, every `STREAK_SIZE`th correct answer in a row restores one.
    pub fn answered(&mut self, correct: bool) {
        if correct {
            self.streak = self.streak.saturating_add(1);
            if self.streak % STREAK_SIZE == 0 {
                self.hp = self.hp.saturating_add(1);
            }
        } else {
            self.hp = self.hp.saturating_sub(1);
            self.streak = 0;
        }
    }

    pub fn attach(&mut self, stream: StreamId) {
        self.stream = Some(stream);
        self.online = true;
    }

    pub fn detach(&mut self) {
        self.stream = None;
        self.online = false;
    }
}
