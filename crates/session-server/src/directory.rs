//! In-memory user directory.
//!
//! Serves nicknames from an optional JSON file and keeps finished game
//! records for the lifetime of the process:
//!
//! ```text
//! {"users": {"alice": {"nickname": "Alice"}}}
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use serde::Deserialize;
use session_core::{DirectoryError, GameRecord, UserDirectory};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserEntry {
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<String, UserEntry>>,
    records: Mutex<Vec<GameRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        MemoryDirectory::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading user file {}", path.display()))?;
        let file: DirectoryFile = serde_json::from_str(&text).context("parsing user file")?;
        info!(users = file.users.len(), path = %path.display(), "user directory loaded");

        Ok(MemoryDirectory {
            users: RwLock::new(file.users),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn set_nickname(&self, username: &str, nickname: &str) {
        if let Ok(mut users) = self.users.write() {
            users.entry(username.to_string()).or_default().nickname = Some(nickname.to_string());
        }
    }

    /// Recorded games, oldest first.
    pub fn records(&self) -> Vec<GameRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl UserDirectory for MemoryDirectory {
    fn nickname(&self, username: &str) -> Option<String> {
        let users = self.users.read().ok()?;
        users.get(username).and_then(|u| u.nickname.clone())
    }

    fn record_game(&self, record: &GameRecord) -> Result<(), DirectoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DirectoryError::Storage("record store poisoned".to_string()))?;

        debug!(user = %record.username, success = record.success, xp = record.xp, "game recorded");
        records.push(record.clone());
        Ok(())
    }
}
