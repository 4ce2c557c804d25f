use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use thiserror::Error;

use crate::{
    clock::TimestampMs,
    dto::setup::GameSetup,
    state::state_machine::{self, AdvanceDecision, Phase},
};

/// Opaque, time-ordered game identifier.
pub type GameId = String;

const SHORT_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const SHORT_ID_LENGTH: usize = 6;
const ID_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LENGTH: usize = 4;

/// One of the two teams on court.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamSide {
    /// Home side, `teamA`.
    A,
    /// Away side, `teamB`.
    B,
}

impl TeamSide {
    /// The opposing side.
    pub fn other(self) -> Self {
        match self {
            TeamSide::A => TeamSide::B,
            TeamSide::B => TeamSide::A,
        }
    }
}

/// Goal tally for both teams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    /// Goals scored by team A.
    #[serde(rename = "A")]
    pub a: u32,
    /// Goals scored by team B.
    #[serde(rename = "B")]
    pub b: u32,
}

impl Scores {
    /// Build a tally from explicit values.
    pub fn new(a: u32, b: u32) -> Self {
        Self { a, b }
    }

    /// Goals for `side`.
    pub fn get(&self, side: TeamSide) -> u32 {
        match side {
            TeamSide::A => self.a,
            TeamSide::B => self.b,
        }
    }

    fn slot(&mut self, side: TeamSide) -> &mut u32 {
        match side {
            TeamSide::A => &mut self.a,
            TeamSide::B => &mut self.b,
        }
    }
}

/// Display information for a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Name shown on the scoreboard.
    pub name: String,
}

/// Match configuration fixed at setup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSettings {
    /// Number of quarters (2 or 4).
    pub num_quarters: u8,
    /// Length of every quarter in seconds.
    pub quarter_duration_sec: u32,
    /// Length of each break in seconds, one fewer entry than quarters.
    pub break_durations_sec: Vec<u32>,
    /// Free-form match type tag (e.g. "standard", "junior").
    pub match_type: String,
}

/// Record of the most recent goal, enough to undo it once.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastGoal {
    /// Team that scored.
    pub team: TeamSide,
    /// Centre pass holder before the goal was recorded.
    pub previous_centre_pass: TeamSide,
    /// When the goal was recorded.
    pub timestamp: TimestampMs,
    /// Quarter the goal was credited to.
    #[serde(default)]
    pub quarter: Option<u8>,
}

/// Mutable match state.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Current phase.
    pub phase: Phase,
    /// Whether the phase clock is counting.
    pub is_running: bool,
    /// Start of the current running interval.
    pub phase_started_at: Option<TimestampMs>,
    /// Time carried across pauses within the current phase, excluding the running interval.
    pub elapsed_ms: u64,
    /// Running totals.
    pub scores: Scores,
    /// Goals per quarter, keyed by 1-based quarter index.
    #[serde(default)]
    pub quarter_scores: IndexMap<u8, Scores>,
    /// Team taking the next centre pass.
    pub centre_pass: TeamSide,
    /// Goal that can be undone.
    pub last_goal: Option<LastGoal>,
}

impl GameState {
    /// State of a match that has not started yet.
    pub fn opening(centre_pass: TeamSide) -> Self {
        let mut quarter_scores = IndexMap::new();
        quarter_scores.insert(1, Scores::default());
        Self {
            phase: Phase::OPENING,
            is_running: false,
            phase_started_at: None,
            elapsed_ms: 0,
            scores: Scores::default(),
            quarter_scores,
            centre_pass,
            last_goal: None,
        }
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::opening(TeamSide::A)
    }
}

/// Who a game belongs to.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Owner {
    /// Anonymous game bound to the device it was created on.
    Device {
        /// Device identity tag of the creating device.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Anonymous session uid, present once the game has been mirrored remotely.
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
    },
    /// Game owned by a registered account.
    Registered {
        /// Account uid.
        #[serde(rename = "userId")]
        user_id: String,
        /// Contact label of the owner.
        email: String,
    },
}

impl Owner {
    /// Uid the remote store uses for ownership checks.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Owner::Device { user_id, .. } => user_id.as_deref(),
            Owner::Registered { user_id, .. } => Some(user_id),
        }
    }

    /// Device tag for anonymous games.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Owner::Device { device_id, .. } => Some(device_id),
            Owner::Registered { .. } => None,
        }
    }
}

/// Errors raised by match operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    /// Nothing but a reset is allowed once full time is reached.
    #[error("match is already over")]
    Finished,
    /// Goals are only credited during quarters.
    #[error("goals can only be recorded during a quarter (current phase: {0:?})")]
    NotInQuarter(Phase),
    /// No goal is available to undo.
    #[error("no goal to undo")]
    NothingToUndo,
}

/// Errors raised when a stored or remote document cannot be turned into a [`Game`].
#[derive(Debug, Error)]
pub enum RecordError {
    /// A required sub-document is absent (typically a partial/summary write).
    #[error("record is missing `{0}`")]
    Missing(&'static str),
    /// The document does not match the game schema.
    #[error("record could not be decoded")]
    Decode(#[from] serde_json::Error),
}

/// The central aggregate: one netball match.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Unique, time-based identifier.
    pub id: GameId,
    /// Short human-facing code.
    pub short_id: String,
    /// Ownership.
    pub owner: Owner,
    /// Whether spectators may read the game by id.
    #[serde(default)]
    pub share_public: bool,
    /// Home team.
    pub team_a: Team,
    /// Away team.
    pub team_b: Team,
    /// Configuration fixed at setup.
    pub settings: MatchSettings,
    /// Live match state.
    pub state: GameState,
    /// Monotonic mutation counter.
    #[serde(default)]
    pub version: u64,
    /// Last confirmed remote write.
    pub last_synced_at: Option<TimestampMs>,
    /// Creation time.
    pub created_at: Option<TimestampMs>,
    /// Last local mutation.
    pub updated_at: Option<TimestampMs>,
}

impl Game {
    /// Build a fresh game at quarter 1, clock stopped, no goals.
    pub fn new(setup: GameSetup, owner: Owner, now: TimestampMs) -> Self {
        Self {
            id: new_game_id(now),
            short_id: new_short_id(),
            owner,
            share_public: setup.share_public,
            team_a: Team {
                name: setup.team_a.trim().to_string(),
            },
            team_b: Team {
                name: setup.team_b.trim().to_string(),
            },
            settings: MatchSettings {
                num_quarters: setup.num_quarters,
                quarter_duration_sec: setup.quarter_duration_sec,
                break_durations_sec: setup.break_durations_sec,
                match_type: setup.match_type,
            },
            state: GameState::opening(setup.first_centre_pass),
            version: 1,
            last_synced_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Decode a JSON document, rejecting snapshots without `state` or `state.phase`.
    pub fn from_document(document: Value) -> Result<Self, RecordError> {
        let state = document.get("state").ok_or(RecordError::Missing("state"))?;
        if state.get("phase").is_none() {
            return Err(RecordError::Missing("state.phase"));
        }
        Ok(serde_json::from_value(document)?)
    }

    /// Encode as a JSON document.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Whether the match has reached full time.
    pub fn is_finished(&self) -> bool {
        self.state.phase.is_fulltime()
    }

    /// Milliseconds left in the current phase.
    pub fn remaining_ms(&self, now: TimestampMs) -> u64 {
        state_machine::remaining_ms(&self.state, &self.settings, now)
    }

    /// Record a goal for `team` and hand the centre pass over.
    pub fn score(&mut self, team: TeamSide, now: TimestampMs) -> Result<(), MatchError> {
        self.ensure_open()?;
        let Phase::Quarter { index } = self.state.phase else {
            return Err(MatchError::NotInQuarter(self.state.phase));
        };

        *self.state.scores.slot(team) += 1;
        *self.state.quarter_scores.entry(index).or_default().slot(team) += 1;
        self.state.last_goal = Some(LastGoal {
            team,
            previous_centre_pass: self.state.centre_pass,
            timestamp: now,
            quarter: Some(index),
        });
        self.state.centre_pass = self.state.centre_pass.other();
        self.touch(now);
        Ok(())
    }

    /// Revert the most recent goal. Only a single step is kept.
    pub fn undo_last_goal(&mut self, now: TimestampMs) -> Result<(), MatchError> {
        self.ensure_open()?;
        let goal = self
            .state
            .last_goal
            .take()
            .ok_or(MatchError::NothingToUndo)?;

        let scores = self.state.scores.slot(goal.team);
        *scores = scores.saturating_sub(1);

        let quarter = goal.quarter.or(self.state.phase.index());
        if let Some(entry) = quarter.and_then(|q| self.state.quarter_scores.get_mut(&q)) {
            let slot = entry.slot(goal.team);
            *slot = slot.saturating_sub(1);
        }

        self.state.centre_pass = goal.previous_centre_pass;
        self.touch(now);
        Ok(())
    }

    /// Stop the phase clock, folding the running interval into the carried time.
    pub fn pause(&mut self, now: TimestampMs) -> Result<(), MatchError> {
        self.ensure_open()?;
        if !self.state.is_running {
            return Ok(());
        }

        let elapsed = state_machine::elapsed_ms(&self.state, now);
        let duration = state_machine::phase_duration_ms(&self.state.phase, &self.settings);
        self.state.elapsed_ms = if duration > 0 {
            elapsed.min(duration)
        } else {
            elapsed
        };
        self.state.is_running = false;
        self.state.phase_started_at = None;
        self.touch(now);
        Ok(())
    }

    /// Start or resume the phase clock.
    pub fn resume(&mut self, now: TimestampMs) -> Result<(), MatchError> {
        self.ensure_open()?;
        if self.state.is_running {
            return Ok(());
        }

        self.state.is_running = true;
        self.state.phase_started_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Move to the next phase. Quarters and breaks start running straight away; full time
    /// stops the clock.
    pub fn advance_phase(&mut self, now: TimestampMs) -> Result<Phase, MatchError> {
        self.ensure_open()?;
        let next = state_machine::next_phase(&self.state.phase, &self.settings);
        self.enter_phase(next, now);
        Ok(next)
    }

    /// Apply an automatic phase change when the clock has overrun its grace window.
    ///
    /// Returns the new phase when a transition happened.
    pub fn tick(&mut self, now: TimestampMs, grace_ms: u64) -> Option<Phase> {
        match state_machine::advance_decision(&self.state, &self.settings, now, grace_ms) {
            AdvanceDecision::Hold => None,
            AdvanceDecision::Advance(next) => {
                self.enter_phase(next, now);
                Some(next)
            }
        }
    }

    /// Return to quarter 1 with zero scores. Allowed from any phase, including full time.
    pub fn reset(&mut self, now: TimestampMs) {
        self.state = GameState::opening(self.state.centre_pass);
        self.touch(now);
    }

    /// Overwrite the totals by hand.
    ///
    /// Quarter tallies are adjusted so they still sum to the new totals: the difference lands
    /// on the current (or most recently played) quarter first, then earlier ones.
    pub fn edit_scores(&mut self, scores: Scores, now: TimestampMs) -> Result<(), MatchError> {
        self.ensure_open()?;
        let anchor = self.state.phase.index().unwrap_or(1);
        for side in [TeamSide::A, TeamSide::B] {
            let target = i64::from(scores.get(side));
            let current: i64 = self
                .state
                .quarter_scores
                .values()
                .map(|q| i64::from(q.get(side)))
                .sum();
            reconcile_quarters(&mut self.state.quarter_scores, side, anchor, target - current);
        }

        self.state.scores = scores;
        self.state.last_goal = None;
        self.touch(now);
        Ok(())
    }

    /// Change public visibility.
    pub fn set_share_public(&mut self, share_public: bool, now: TimestampMs) {
        if self.share_public != share_public {
            self.share_public = share_public;
            self.touch(now);
        }
    }

    fn enter_phase(&mut self, next: Phase, now: TimestampMs) {
        let running = !next.is_fulltime();
        if let Phase::Quarter { index } = next {
            self.state.quarter_scores.entry(index).or_default();
        }
        self.state.phase = next;
        self.state.is_running = running;
        self.state.phase_started_at = running.then_some(now);
        self.state.elapsed_ms = 0;
        self.state.last_goal = None;
        self.touch(now);
    }

    fn ensure_open(&self) -> Result<(), MatchError> {
        if self.is_finished() {
            Err(MatchError::Finished)
        } else {
            Ok(())
        }
    }

    fn touch(&mut self, now: TimestampMs) {
        self.version += 1;
        self.updated_at = Some(now);
    }
}

fn reconcile_quarters(
    quarters: &mut IndexMap<u8, Scores>,
    side: TeamSide,
    anchor: u8,
    delta: i64,
) {
    if delta == 0 {
        return;
    }

    if delta > 0 {
        *quarters.entry(anchor).or_default().slot(side) += delta as u32;
        return;
    }

    let mut order: Vec<u8> = quarters.keys().copied().filter(|q| *q <= anchor).collect();
    order.sort_unstable_by(|a, b| b.cmp(a));
    let later = quarters.keys().copied().filter(|q| *q > anchor);
    order.extend(later.collect::<Vec<_>>());

    let mut owed = delta.unsigned_abs();
    for quarter in order {
        if owed == 0 {
            break;
        }
        if let Some(entry) = quarters.get_mut(&quarter) {
            let slot = entry.slot(side);
            let taken = u64::from(*slot).min(owed);
            *slot -= taken as u32;
            owed -= taken;
        }
    }
}

/// Time-ordered identifier: base-36 milliseconds followed by a short random suffix.
pub fn new_game_id(now: TimestampMs) -> GameId {
    let mut id = to_base36(now.max(0) as u64);
    id.push_str(&random_string(ID_SUFFIX_ALPHABET, ID_SUFFIX_LENGTH));
    id
}

/// Six-character code that avoids easily confused glyphs.
pub fn new_short_id() -> String {
    random_string(SHORT_ID_ALPHABET, SHORT_ID_LENGTH)
}

fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

pub(crate) fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_setup() -> GameSetup {
        GameSetup {
            team_a: "Falcons".into(),
            team_b: "Comets".into(),
            num_quarters: 4,
            quarter_duration_sec: 600,
            break_durations_sec: vec![180, 300, 180],
            match_type: "standard".into(),
            share_public: false,
            first_centre_pass: TeamSide::A,
        }
    }

    pub(crate) fn sample_game() -> Game {
        Game::new(
            sample_setup(),
            Owner::Device {
                device_id: "device_test".into(),
                user_id: None,
            },
            1_000,
        )
    }

    fn quarter_sum(game: &Game) -> Scores {
        game.state
            .quarter_scores
            .values()
            .fold(Scores::default(), |acc, q| Scores::new(acc.a + q.a, acc.b + q.b))
    }

    #[test]
    fn new_game_starts_in_first_quarter_stopped() {
        let game = sample_game();
        assert_eq!(game.state.phase, Phase::Quarter { index: 1 });
        assert!(!game.state.is_running);
        assert_eq!(game.state.scores, Scores::default());
        assert_eq!(game.version, 1);
        assert_eq!(game.short_id.len(), SHORT_ID_LENGTH);
        assert!(game.id.len() > ID_SUFFIX_LENGTH);
    }

    #[test]
    fn three_goals_toggle_centre_pass() {
        let mut game = sample_game();
        for n in 0..3 {
            game.score(TeamSide::A, 2_000 + n).unwrap();
        }

        assert_eq!(game.state.scores, Scores::new(3, 0));
        assert_eq!(game.state.quarter_scores[&1], Scores::new(3, 0));
        assert_eq!(game.state.centre_pass, TeamSide::B);
        assert_eq!(game.state.last_goal.as_ref().unwrap().team, TeamSide::A);
        assert_eq!(game.version, 4);
    }

    #[test]
    fn undo_reverts_single_goal() {
        let mut game = sample_game();
        for n in 0..3 {
            game.score(TeamSide::A, 2_000 + n).unwrap();
        }
        let previous = game.state.last_goal.as_ref().unwrap().previous_centre_pass;

        game.undo_last_goal(3_000).unwrap();
        assert_eq!(game.state.scores, Scores::new(2, 0));
        assert_eq!(game.state.quarter_scores[&1], Scores::new(2, 0));
        assert_eq!(game.state.centre_pass, previous);
        assert_eq!(
            game.undo_last_goal(3_001),
            Err(MatchError::NothingToUndo)
        );
    }

    #[test]
    fn goals_are_rejected_outside_quarters() {
        let mut game = sample_game();
        game.advance_phase(5_000).unwrap();
        assert_eq!(
            game.score(TeamSide::B, 5_001),
            Err(MatchError::NotInQuarter(Phase::Break { index: 1 }))
        );
    }

    #[test]
    fn pause_and_resume_carry_elapsed_time() {
        let mut game = sample_game();
        game.resume(10_000).unwrap();
        game.pause(70_000).unwrap();
        assert_eq!(game.state.elapsed_ms, 60_000);
        assert!(game.state.phase_started_at.is_none());

        game.resume(100_000).unwrap();
        assert_eq!(game.remaining_ms(130_000), 600_000 - 90_000);
    }

    #[test]
    fn advancing_keeps_clock_running_until_fulltime() {
        let mut game = sample_game();
        game.settings.num_quarters = 2;
        game.settings.break_durations_sec = vec![300];

        assert_eq!(game.advance_phase(1).unwrap(), Phase::Break { index: 1 });
        assert!(game.state.is_running);
        assert_eq!(game.advance_phase(2).unwrap(), Phase::Quarter { index: 2 });
        assert!(game.state.quarter_scores.contains_key(&2));
        assert_eq!(game.advance_phase(3).unwrap(), Phase::Fulltime);
        assert!(!game.state.is_running);
        assert_eq!(game.advance_phase(4), Err(MatchError::Finished));
        assert_eq!(game.score(TeamSide::A, 5), Err(MatchError::Finished));
    }

    #[test]
    fn tick_applies_grace_before_advancing() {
        let mut game = sample_game();
        let start = 1_000_000;
        game.resume(start).unwrap();
        let version = game.version;

        assert_eq!(game.tick(start + 605_000, 5_000), None);
        assert_eq!(game.version, version);
        assert_eq!(
            game.tick(start + 606_000, 5_000),
            Some(Phase::Break { index: 1 })
        );
        assert!(game.state.is_running);
        assert_eq!(game.state.phase_started_at, Some(start + 606_000));
        assert_eq!(game.version, version + 1);
    }

    #[test]
    fn reset_returns_to_opening_state() {
        let mut game = sample_game();
        game.score(TeamSide::A, 2).unwrap();
        for step in 0..7 {
            game.advance_phase(10 + step).unwrap();
        }
        assert!(game.is_finished());

        game.reset(100);
        assert_eq!(game.state.phase, Phase::OPENING);
        assert_eq!(game.state.scores, Scores::default());
        assert!(!game.is_finished());
    }

    #[test]
    fn manual_edit_keeps_quarter_totals_consistent() {
        let mut game = sample_game();
        game.score(TeamSide::A, 1).unwrap();
        game.score(TeamSide::A, 2).unwrap();
        game.advance_phase(3).unwrap();
        game.advance_phase(4).unwrap();
        game.score(TeamSide::A, 5).unwrap();
        game.advance_phase(6).unwrap();

        game.edit_scores(Scores::new(1, 4), 7).unwrap();
        assert_eq!(game.state.scores, Scores::new(1, 4));
        assert_eq!(quarter_sum(&game), Scores::new(1, 4));
        assert_eq!(game.state.quarter_scores[&2], Scores::new(0, 4));
        assert!(game.state.last_goal.is_none());
    }

    #[test]
    fn documents_without_phase_are_rejected() {
        let mut document = sample_game().to_document().unwrap();
        document["state"].as_object_mut().unwrap().remove("phase");
        assert!(matches!(
            Game::from_document(document),
            Err(RecordError::Missing("state.phase"))
        ));

        let summary = serde_json::json!({"id": "abc", "shortId": "XYZ123"});
        assert!(matches!(
            Game::from_document(summary),
            Err(RecordError::Missing("state"))
        ));
    }

    #[test]
    fn document_round_trip_uses_camel_case() {
        let game = sample_game();
        let document = game.to_document().unwrap();
        assert!(document.get("sharePublic").is_some());
        assert!(document["state"].get("centrePass").is_some());
        assert_eq!(document["state"]["quarterScores"]["1"], serde_json::json!({"A": 0, "B": 0}));
        assert_eq!(Game::from_document(document).unwrap(), game);
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
