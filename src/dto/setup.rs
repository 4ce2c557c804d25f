use serde::Deserialize;
use validator::Validate;

use crate::{
    dto::validation::{validate_break_plan, validate_quarter_count},
    state::game::TeamSide,
};

fn default_match_type() -> String {
    "standard".into()
}

fn default_centre_pass() -> TeamSide {
    TeamSide::A
}

/// Input collected on the setup screen before a match is created.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_break_plan"))]
pub struct GameSetup {
    /// Home team name.
    #[validate(length(min = 1, max = 40))]
    pub team_a: String,
    /// Away team name.
    #[validate(length(min = 1, max = 40))]
    pub team_b: String,
    /// 2 or 4.
    #[validate(custom(function = "validate_quarter_count"))]
    pub num_quarters: u8,
    /// Quarter length in seconds.
    #[validate(range(min = 60, max = 3_600))]
    pub quarter_duration_sec: u32,
    /// Break lengths in seconds, one per gap between quarters.
    pub break_durations_sec: Vec<u32>,
    /// Match type tag.
    #[serde(default = "default_match_type")]
    pub match_type: String,
    /// Make the game readable by spectators through its id.
    #[serde(default)]
    pub share_public: bool,
    /// Team taking the first centre pass.
    #[serde(default = "default_centre_pass")]
    pub first_centre_pass: TeamSide,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::game::tests::sample_setup;

    #[test]
    fn sample_setup_is_valid() {
        assert!(sample_setup().validate().is_ok());
    }

    #[test]
    fn rejects_blank_names_and_odd_quarter_counts() {
        let mut setup = sample_setup();
        setup.team_a.clear();
        assert!(setup.validate().is_err());

        let mut setup = sample_setup();
        setup.num_quarters = 3;
        setup.break_durations_sec = vec![120, 120];
        assert!(setup.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let setup: GameSetup = serde_json::from_value(serde_json::json!({
            "teamA": "Falcons",
            "teamB": "Comets",
            "numQuarters": 2,
            "quarterDurationSec": 900,
            "breakDurationsSec": [300]
        }))
        .unwrap();
        assert_eq!(setup.match_type, "standard");
        assert!(!setup.share_public);
        assert_eq!(setup.first_centre_pass, TeamSide::A);
        assert!(setup.validate().is_ok());
    }
}
