//! Token table: the server's `CredentialVerifier`.
//!
//! Tokens are issued by an external login service. The server only maps
//! a presented token to the credential it was issued for. File format:
//!
//! ```text
//! {"tokens": {"<token>": {"username": "alice", "roles": ["student"]}}}
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use session_core::Credential;
use session_protocol::CredentialVerifier;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct TokenTable {
    tokens: HashMap<String, Credential>,
}

impl TokenTable {
    pub fn new() -> Self {
        TokenTable::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, credential: Credential) {
        self.tokens.insert(token.into(), credential);
    }

    pub fn with_token(mut self, token: impl Into<String>, credential: Credential) -> Self {
        self.insert(token, credential);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let table: TokenTable = serde_json::from_str(text).context("parsing token table")?;
        Ok(table)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading token file {}", path.display()))?;
        let table = TokenTable::from_json(&text)?;
        info!(tokens = table.len(), path = %path.display(), "token table loaded");
        Ok(table)
    }
}

impl CredentialVerifier for TokenTable {
    fn verify(&self, token: &str) -> Option<Credential> {
        self.tokens.get(token).filter(|c| c.is_valid()).cloned()
    }
}
