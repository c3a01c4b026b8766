//! Identity attached to a stream once it authenticates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Role flags carried by a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Panel,
    Admin,
}

/// Authenticated identity of one connection.
///
/// Issued by the authentication layer and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,

    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

impl Credential {
    pub fn new(username: impl Into<String>) -> Self {
        Credential {
            username: username.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// A credential without a username is never accepted.
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty()
    }
}
