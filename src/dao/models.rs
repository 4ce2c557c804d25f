use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    clock::TimestampMs,
    state::{
        game::{Game, GameId, Scores},
        state_machine::Phase,
    },
};

/// Lightweight list entry kept next to the full game records so listings do not load them.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameSummaryEntity {
    /// Primary key of the game.
    pub id: GameId,
    /// Short human-facing code.
    pub short_id: String,
    /// Home team name.
    pub team_a: String,
    /// Away team name.
    pub team_b: String,
    /// Running totals at the time of the last save.
    pub scores: Scores,
    /// Phase at the time of the last save.
    pub phase: Phase,
    /// Public visibility flag.
    #[serde(default)]
    pub share_public: bool,
    /// Version of the record the summary was taken from.
    #[serde(default)]
    pub version: u64,
    /// Creation timestamp.
    pub created_at: Option<TimestampMs>,
    /// Last mutation timestamp.
    pub updated_at: Option<TimestampMs>,
}

impl From<&Game> for GameSummaryEntity {
    fn from(game: &Game) -> Self {
        Self {
            id: game.id.clone(),
            short_id: game.short_id.clone(),
            team_a: game.team_a.name.clone(),
            team_b: game.team_b.name.clone(),
            scores: game.state.scores,
            phase: game.state.phase,
            share_public: game.share_public,
            version: game.version,
            created_at: game.created_at,
            updated_at: game.updated_at,
        }
    }
}
