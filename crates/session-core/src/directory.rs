//! Off-worker jobs and the user directory they run against.
//!
//! Engines never block on storage. They describe the work as an
//! [`EngineJob`] through their context; the server runs it on a blocking
//! thread against a [`UserDirectory`] and feeds the [`JobResult`] back to
//! the same engine on the worker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one finished match, for one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub username: String,
    pub map: String,
    pub mission: String,
    pub level: u32,
    pub success: bool,
    pub xp: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Read/write access to user data outside the engine runtime.
pub trait UserDirectory: Send + Sync {
    /// Display name for `username`, if the user is known.
    fn nickname(&self, username: &str) -> Option<String>;

    /// Persist a finished game.
    fn record_game(&self, record: &GameRecord) -> Result<(), DirectoryError>;
}

/// Blocking work requested by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineJob {
    LookupNickname { username: String },
    RecordResult(GameRecord),
}

/// Result delivered back to the requesting engine.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Nickname {
        username: String,
        nickname: Option<String>,
    },
    ResultRecorded {
        username: String,
        ok: bool,
    },
}

impl EngineJob {
    /// Execute the job. Blocking; never call this on the worker.
    pub fn run(self, directory: &dyn UserDirectory) -> JobResult {
        match self {
            EngineJob::LookupNickname { username } => {
                let nickname = directory.nickname(&username);
                JobResult::Nickname { username, nickname }
            }
            EngineJob::RecordResult(record) => {
                let ok = match directory.record_game(&record) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(user = %record.username, error = %err, "game record failed");
                        false
                    }
                };
                JobResult::ResultRecorded {
                    username: record.username,
                    ok,
                }
            }
        }
    }
}
