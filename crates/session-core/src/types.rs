//! Identifiers shared by every layer.
//!
//! - [`EngineKind`]: the type tag of an engine (`conquest`, `peer`, `exam`).
//! - [`EngineKey`]: the `(kind, id)` pair, unique within one registry.
//! - [`StreamId`]: opaque handle for one connection.
//! - [`PlayerId`]: per-match player number.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Engine type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Presence list of connected users.
    Peer,

    /// Turn-based land-grab quiz battle.
    Conquest,

    /// Exam session (stub).
    Exam,
}

impl EngineKind {
    /// Wire operation name used for commands and pushes of this kind.
    pub fn op(self) -> &'static str {
        match self {
            EngineKind::Peer => "peers",
            EngineKind::Conquest => "conquest",
            EngineKind::Exam => "exam",
        }
    }

    /// Parse an engine command operation (`"conquest"`, `"exam"`).
    ///
    /// Presence has no command table, so `"peers"` is not accepted here;
    /// use [`EngineKind::from_observer`] for subscriptions.
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "conquest" => Some(EngineKind::Conquest),
            "exam" => Some(EngineKind::Exam),
            _ => None,
        }
    }

    /// Parse an observer subscription type (`{"type": "peers"}`).
    pub fn from_observer(name: &str) -> Option<Self> {
        match name {
            "peers" => Some(EngineKind::Peer),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op())
    }
}

/// Numeric engine id, allocated by the registry.
pub type EngineId = u32;

/// Identity of one engine inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineKey {
    pub kind: EngineKind,
    pub id: EngineId,
}

impl EngineKey {
    pub fn new(kind: EngineKind, id: EngineId) -> Self {
        EngineKey { kind, id }
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Identifier for a connected stream.
///
/// Opaque; unique over the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Player number inside one match (starts at 1).
pub type PlayerId = u32;

/// Serde adapter for optional ids and counters: `None` travels as `-1`.
///
/// Clients compare `proprietor`, `player`, `fortress` and `currentTurn`
/// against `-1`, so the absent case keeps that shape on the wire.
pub mod minus_one {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Copy + TryInto<i64>,
        S: Serializer,
    {
        let raw = value.and_then(|v| v.try_into().ok()).unwrap_or(-1);
        serializer.serialize_i64(raw)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: TryFrom<i64>,
        D: Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        Ok(T::try_from(raw).ok())
    }
}
