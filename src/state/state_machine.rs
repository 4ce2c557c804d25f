use serde::{Deserialize, Serialize};

use crate::{
    clock::TimestampMs,
    state::game::{GameState, MatchSettings},
};

/// Stage of a match: a quarter, the break that follows it, or the terminal full-time state.
///
/// Indices are 1-based. `Break { index: i }` is the break between quarter `i` and `i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Phase {
    /// Playing time of quarter `index`.
    Quarter {
        /// 1-based quarter number.
        index: u8,
    },
    /// Break following quarter `index`.
    Break {
        /// 1-based number of the quarter that just ended.
        index: u8,
    },
    /// Match is over.
    Fulltime,
}

impl Phase {
    /// Phase every new or reset match starts in.
    pub const OPENING: Phase = Phase::Quarter { index: 1 };

    /// Whether this is a quarter (goals can only be scored during quarters).
    pub fn is_quarter(&self) -> bool {
        matches!(self, Phase::Quarter { .. })
    }

    /// Whether this is the terminal state.
    pub fn is_fulltime(&self) -> bool {
        matches!(self, Phase::Fulltime)
    }

    /// Quarter index carried by the phase, if any.
    pub fn index(&self) -> Option<u8> {
        match self {
            Phase::Quarter { index } | Phase::Break { index } => Some(*index),
            Phase::Fulltime => None,
        }
    }
}

/// Outcome of polling the match clock for an automatic phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceDecision {
    /// Keep the current phase.
    Hold,
    /// Move on to the given phase.
    Advance(Phase),
}

/// Configured length of `phase` in milliseconds.
///
/// Malformed input (index 0, a quarter past the configured count, a break without a
/// configured duration) yields 0 rather than an error so a half-loaded record never
/// stops the clock; callers log it as a data-integrity warning.
pub fn phase_duration_ms(phase: &Phase, settings: &MatchSettings) -> u64 {
    match *phase {
        Phase::Quarter { index } if index >= 1 && index <= settings.num_quarters => {
            u64::from(settings.quarter_duration_sec) * 1000
        }
        Phase::Break { index } if index >= 1 => settings
            .break_durations_sec
            .get(usize::from(index - 1))
            .map(|secs| u64::from(*secs) * 1000)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Phase that follows `phase`. Full time is a fixed point.
pub fn next_phase(phase: &Phase, settings: &MatchSettings) -> Phase {
    match *phase {
        Phase::Quarter { index } if index < settings.num_quarters => Phase::Break { index },
        Phase::Quarter { .. } => Phase::Fulltime,
        Phase::Break { index } => Phase::Quarter {
            index: index.saturating_add(1),
        },
        Phase::Fulltime => Phase::Fulltime,
    }
}

/// Whether `phase` is the last quarter of the match.
pub fn is_final_quarter(phase: &Phase, settings: &MatchSettings) -> bool {
    matches!(*phase, Phase::Quarter { index } if index >= settings.num_quarters)
}

/// Time spent in the current phase, including the running interval when the clock is live.
///
/// A running clock without a start stamp contributes nothing beyond the carried time.
pub fn elapsed_ms(state: &GameState, now: TimestampMs) -> u64 {
    let running = if state.is_running {
        state
            .phase_started_at
            .map(|started| now.saturating_sub(started).max(0) as u64)
            .unwrap_or(0)
    } else {
        0
    };
    state.elapsed_ms.saturating_add(running)
}

/// Milliseconds left in the current phase, never negative.
pub fn remaining_ms(state: &GameState, settings: &MatchSettings, now: TimestampMs) -> u64 {
    phase_duration_ms(&state.phase, settings).saturating_sub(elapsed_ms(state, now))
}

/// Grace window applied once the phase clock hits zero before forcing the next phase.
///
/// The final quarter ends the match immediately.
pub fn grace_for(phase: &Phase, settings: &MatchSettings, grace_ms: u64) -> u64 {
    if is_final_quarter(phase, settings) {
        0
    } else {
        grace_ms
    }
}

/// Decide whether a running phase has overrun far enough to be advanced automatically.
pub fn advance_decision(
    state: &GameState,
    settings: &MatchSettings,
    now: TimestampMs,
    grace_ms: u64,
) -> AdvanceDecision {
    if !state.is_running || state.phase.is_fulltime() {
        return AdvanceDecision::Hold;
    }

    let duration = phase_duration_ms(&state.phase, settings);
    let elapsed = elapsed_ms(state, now);
    if elapsed < duration {
        return AdvanceDecision::Hold;
    }

    let overshoot = elapsed - duration;
    let grace = grace_for(&state.phase, settings, grace_ms);
    if grace == 0 || overshoot > grace {
        AdvanceDecision::Advance(next_phase(&state.phase, settings))
    } else {
        AdvanceDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(quarters: u8) -> MatchSettings {
        MatchSettings {
            num_quarters: quarters,
            quarter_duration_sec: 600,
            break_durations_sec: match quarters {
                2 => vec![300],
                _ => vec![180, 300, 180],
            },
            match_type: "standard".into(),
        }
    }

    fn running_state(phase: Phase, started_at: TimestampMs) -> GameState {
        GameState {
            phase,
            is_running: true,
            phase_started_at: Some(started_at),
            ..GameState::default()
        }
    }

    #[test]
    fn durations_follow_settings() {
        let s = settings(4);
        assert_eq!(phase_duration_ms(&Phase::Quarter { index: 3 }, &s), 600_000);
        assert_eq!(phase_duration_ms(&Phase::Break { index: 1 }, &s), 180_000);
        assert_eq!(phase_duration_ms(&Phase::Break { index: 2 }, &s), 300_000);
        assert_eq!(phase_duration_ms(&Phase::Fulltime, &s), 0);
    }

    #[test]
    fn malformed_phases_have_zero_duration() {
        let s = settings(2);
        assert_eq!(phase_duration_ms(&Phase::Quarter { index: 0 }, &s), 0);
        assert_eq!(phase_duration_ms(&Phase::Quarter { index: 3 }, &s), 0);
        assert_eq!(phase_duration_ms(&Phase::Break { index: 0 }, &s), 0);
        assert_eq!(phase_duration_ms(&Phase::Break { index: 2 }, &s), 0);
    }

    #[test]
    fn full_walk_through_four_quarters() {
        let s = settings(4);
        let mut phase = Phase::OPENING;
        let mut seen = vec![phase];
        while !phase.is_fulltime() {
            phase = next_phase(&phase, &s);
            seen.push(phase);
        }

        assert_eq!(
            seen,
            vec![
                Phase::Quarter { index: 1 },
                Phase::Break { index: 1 },
                Phase::Quarter { index: 2 },
                Phase::Break { index: 2 },
                Phase::Quarter { index: 3 },
                Phase::Break { index: 3 },
                Phase::Quarter { index: 4 },
                Phase::Fulltime,
            ]
        );
    }

    #[test]
    fn last_quarter_leads_to_fulltime_which_is_terminal() {
        let s = settings(2);
        assert_eq!(next_phase(&Phase::Quarter { index: 2 }, &s), Phase::Fulltime);
        assert_eq!(next_phase(&Phase::Fulltime, &s), Phase::Fulltime);
    }

    #[test]
    fn remaining_accounts_for_carried_and_running_time() {
        let s = settings(4);
        let mut state = running_state(Phase::OPENING, 10_000);
        state.elapsed_ms = 60_000;
        assert_eq!(remaining_ms(&state, &s, 40_000), 600_000 - 90_000);

        state.is_running = false;
        assert_eq!(remaining_ms(&state, &s, 40_000), 600_000 - 60_000);
    }

    #[test]
    fn remaining_clamps_at_zero_and_tolerates_missing_start() {
        let s = settings(4);
        let state = running_state(Phase::OPENING, 0);
        assert_eq!(remaining_ms(&state, &s, 700_000), 0);

        let mut stray = running_state(Phase::OPENING, 0);
        stray.phase_started_at = None;
        stray.elapsed_ms = 1_000;
        assert_eq!(remaining_ms(&stray, &s, 700_000), 599_000);

        let future = running_state(Phase::OPENING, 50_000);
        assert_eq!(remaining_ms(&future, &s, 10_000), 600_000);
    }

    #[test]
    fn overrun_within_grace_holds_then_advances() {
        let s = settings(4);
        let now = 1_000_000;
        let state = running_state(Phase::Quarter { index: 2 }, now - 605_000);
        assert_eq!(advance_decision(&state, &s, now, 5_000), AdvanceDecision::Hold);

        let state = running_state(Phase::Quarter { index: 2 }, now - 606_000);
        assert_eq!(
            advance_decision(&state, &s, now, 5_000),
            AdvanceDecision::Advance(Phase::Break { index: 2 })
        );
    }

    #[test]
    fn final_quarter_ends_without_grace() {
        let s = settings(4);
        let now = 1_000_000;
        let state = running_state(Phase::Quarter { index: 4 }, now - 600_000);
        assert_eq!(
            advance_decision(&state, &s, now, 5_000),
            AdvanceDecision::Advance(Phase::Fulltime)
        );
    }

    #[test]
    fn paused_phases_never_advance() {
        let s = settings(4);
        let mut paused = running_state(Phase::OPENING, 0);
        paused.is_running = false;
        paused.elapsed_ms = 600_000;
        assert_eq!(advance_decision(&paused, &s, 900_000, 0), AdvanceDecision::Hold);
    }

    #[test]
    fn zero_length_phases_count_as_elapsed() {
        let mut s = settings(4);
        s.break_durations_sec = vec![0, 300, 180];
        let now = 1_000_000;

        let state = running_state(Phase::Break { index: 1 }, now - 4_000);
        assert_eq!(remaining_ms(&state, &s, now), 0);
        assert_eq!(advance_decision(&state, &s, now, 5_000), AdvanceDecision::Hold);

        let state = running_state(Phase::Break { index: 1 }, now - 5_001);
        assert_eq!(
            advance_decision(&state, &s, now, 5_000),
            AdvanceDecision::Advance(Phase::Quarter { index: 2 })
        );

        let broken = running_state(Phase::Break { index: 7 }, 0);
        assert_eq!(
            advance_decision(&broken, &s, 900_000, 0),
            AdvanceDecision::Advance(Phase::Quarter { index: 8 })
        );
    }

    #[test]
    fn phase_serializes_with_type_tag() {
        let json = serde_json::to_value(Phase::Break { index: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "break", "index": 2}));
        let back: Phase = serde_json::from_value(serde_json::json!({"type": "fulltime"})).unwrap();
        assert_eq!(back, Phase::Fulltime);
    }
}
