use serde::Serialize;
use serde_with::skip_serializing_none;
use utoipa::ToSchema;

use crate::{
    clock::TimestampMs,
    state::{
        game::{Game, Scores, TeamSide},
        state_machine::Phase,
    },
};

/// Goal tally for both teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct ScoreLine {
    /// Goals of team A.
    #[serde(rename = "A")]
    pub a: u32,
    /// Goals of team B.
    #[serde(rename = "B")]
    pub b: u32,
}

impl From<Scores> for ScoreLine {
    fn from(scores: Scores) -> Self {
        Self {
            a: scores.a,
            b: scores.b,
        }
    }
}

/// Goals of one quarter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct QuarterScoreLine {
    /// 1-based quarter index.
    pub quarter: u8,
    /// Goals scored during that quarter.
    #[serde(flatten)]
    pub scores: ScoreLine,
}

/// Kind of phase shown to spectators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PublicPhaseKind {
    /// Play is on.
    Quarter,
    /// Interval between quarters.
    Break,
    /// The match is over.
    Fulltime,
}

/// Phase shown to spectators.
#[skip_serializing_none]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct PublicPhase {
    /// Phase kind.
    #[serde(rename = "type")]
    pub kind: PublicPhaseKind,
    /// 1-based index for quarters and breaks.
    pub index: Option<u8>,
}

impl From<Phase> for PublicPhase {
    fn from(phase: Phase) -> Self {
        let kind = match phase {
            Phase::Quarter { .. } => PublicPhaseKind::Quarter,
            Phase::Break { .. } => PublicPhaseKind::Break,
            Phase::Fulltime => PublicPhaseKind::Fulltime,
        };
        Self {
            kind,
            index: phase.index(),
        }
    }
}

/// Read-only projection of a shared game.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicGameResponse {
    /// Game id.
    pub id: String,
    /// Short code.
    pub short_id: String,
    /// Home team name.
    pub team_a: String,
    /// Away team name.
    pub team_b: String,
    /// Running totals.
    pub scores: ScoreLine,
    /// Goals per quarter, in quarter order.
    pub quarter_scores: Vec<QuarterScoreLine>,
    /// Current phase.
    pub phase: PublicPhase,
    /// Number of quarters in the match.
    pub num_quarters: u8,
    /// Whether the clock is counting.
    pub is_running: bool,
    /// Time left in the current phase when the projection was built.
    pub remaining_ms: u64,
    /// Team taking the next centre pass (`A` or `B`).
    #[schema(value_type = String)]
    pub centre_pass: TeamSide,
    /// Mutation counter of the snapshot.
    pub version: u64,
    /// Last mutation time.
    pub updated_at: Option<TimestampMs>,
}

impl PublicGameResponse {
    /// Project `game` as seen at `now`.
    pub fn from_game(game: &Game, now: TimestampMs) -> Self {
        let mut quarter_scores: Vec<_> = game
            .state
            .quarter_scores
            .iter()
            .map(|(quarter, scores)| QuarterScoreLine {
                quarter: *quarter,
                scores: (*scores).into(),
            })
            .collect();
        quarter_scores.sort_by_key(|line| line.quarter);

        Self {
            id: game.id.clone(),
            short_id: game.short_id.clone(),
            team_a: game.team_a.name.clone(),
            team_b: game.team_b.name.clone(),
            scores: game.state.scores.into(),
            quarter_scores,
            phase: game.state.phase.into(),
            num_quarters: game.settings.num_quarters,
            is_running: game.state.is_running,
            remaining_ms: game.remaining_ms(now),
            centre_pass: game.state.centre_pass,
            version: game.version,
            updated_at: game.updated_at,
        }
    }
}
