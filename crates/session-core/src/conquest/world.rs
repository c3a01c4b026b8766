//! Conquest map: lands, adjacency and the world catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{minus_one, PlayerId};

/// Recurring value of a land.
pub const LAND_XP: i64 = 100;

/// One-time bonus for the first conquest of a land.
pub const LAND_XP_ONCE: i64 = 200;

/// Fortress level on every player's starting land.
pub const INITIAL_FORTRESS: u32 = 3;

/// One land of a live match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestLand {
    pub id: String,

    #[serde(with = "minus_one")]
    pub proprietor: Option<PlayerId>,

    pub xp: i64,
    pub xp_once: i64,

    /// Remaining fortress levels; `None` when the land is unfortified.
    #[serde(with = "minus_one")]
    pub fortress: Option<u32>,
}

impl ConquestLand {
    pub fn new(id: impl Into<String>) -> Self {
        ConquestLand {
            id: id.into(),
            proprietor: None,
            xp: LAND_XP,
            xp_once: LAND_XP_ONCE,
            fortress: None,
        }
    }

    pub fn is_fortified(&self) -> bool {
        self.fortress.map(|f| f > 0).unwrap_or(false)
    }
}

/// Playable map of one match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestWorld {
    pub name: String,
    pub land_list: Vec<ConquestLand>,
    pub adjacency: BTreeMap<String, Vec<String>>,
}

impl ConquestWorld {
    pub fn from_template(template: &WorldTemplate) -> Self {
        ConquestWorld {
            name: template.name.clone(),
            land_list: template.lands.iter().map(ConquestLand::new).collect(),
            adjacency: template.adjacency.clone(),
        }
    }

    pub fn land(&self, id: &str) -> Option<&ConquestLand> {
        self.land_list.iter().find(|l| l.id == id)
    }

    pub fn land_mut(&mut self, id: &str) -> Option<&mut ConquestLand> {
        self.land_list.iter_mut().find(|l| l.id == id)
    }

    pub fn neighbours(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear(&mut self) {
        self.name.clear();
        self.land_list.clear();
        self.adjacency.clear();
    }
}

/// Catalog entry a match world is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldTemplate {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Exact player count this world is made for; 0 fits any count.
    #[serde(default)]
    pub player_count: usize,

    pub lands: Vec<String>,

    /// Undirected adjacency; [`WorldCatalog::new`] mirrors every edge.
    #[serde(default)]
    pub adjacency: BTreeMap<String, Vec<String>>,
}

impl WorldTemplate {
    pub fn fits(&self, players: usize) -> bool {
        self.player_count == 0 || self.player_count == players
    }

    /// Make adjacency symmetric and drop edges to unknown lands.
    fn normalize(&mut self) {
        let mut full: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (from, list) in &self.adjacency {
            for to in list {
                if from == to || !self.lands.contains(from) || !self.lands.contains(to) {
                    continue;
                }
                full.entry(from.clone()).or_default().push(to.clone());
                full.entry(to.clone()).or_default().push(from.clone());
            }
        }

        for list in full.values_mut() {
            list.sort();
            list.dedup();
        }

        self.adjacency = full;
    }
}

/// Worlds available to new matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldCatalog {
    pub worlds: Vec<WorldTemplate>,
}

impl WorldCatalog {
    pub fn new(mut worlds: Vec<WorldTemplate>) -> Self {
        for w in &mut worlds {
            w.normalize();
        }
        WorldCatalog { worlds }
    }

    /// Parse a catalog file: `{"worlds": [{"name", "lands", "adjacency"}]}`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: WorldCatalog = serde_json::from_str(text)?;
        Ok(WorldCatalog::new(raw.worlds))
    }

    /// The built-in 3 x 4 grid, `L1` .. `L12`, for any player count.
    pub fn builtin() -> Self {
        const COLS: usize = 4;
        const ROWS: usize = 3;

        let name = |r: usize, c: usize| format!("L{}", r * COLS + c + 1);

        let mut lands = Vec::new();
        let mut adjacency = BTreeMap::new();

        for r in 0..ROWS {
            for c in 0..COLS {
                lands.push(name(r, c));

                let mut next = Vec::new();
                if c + 1 < COLS {
                    next.push(name(r, c + 1));
                }
                if r + 1 < ROWS {
                    next.push(name(r + 1, c));
                }
                adjacency.insert(name(r, c), next);
            }
        }

        WorldCatalog::new(vec![WorldTemplate {
            name: "grid".to_string(),
            description: "Twelve lands on a grid".to_string(),
            player_count: 0,
            lands,
            adjacency,
        }])
    }

    /// World named `name` (or the first fitting one) for `players`.
    ///
    /// A world needs strictly more lands than players.
    pub fn find(&self, name: Option<&str>, players: usize) -> Option<&WorldTemplate> {
        self.worlds.iter().find(|w| {
            w.fits(players) && w.lands.len() > players && name.map(|n| w.name == n).unwrap_or(true)
        })
    }
}

impl Default for WorldCatalog {
    fn default() -> Self {
        WorldCatalog::builtin()
    }
}
