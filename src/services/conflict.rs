//! Whole-record, version-based reconciliation of a local and a remote copy.

use serde_json::Value;

use crate::{dao::document, state::game::Game};

/// Anything carrying a monotonic version counter.
pub trait Versioned {
    /// Current version.
    fn version(&self) -> u64;
}

impl Versioned for Game {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Value {
    fn version(&self) -> u64 {
        document::version_of(self)
    }
}

/// Which copy holds the authoritative data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The device copy.
    Local,
    /// The remote copy.
    Remote,
    /// Both are equal, or neither exists.
    Neither,
}

/// What the caller must do to converge both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Replace the device copy with the remote one.
    OverwriteLocal,
    /// Send the device copy to the remote store.
    PushLocal,
    /// Already consistent.
    Nothing,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Authoritative side.
    pub winner: Winner,
    /// Follow-up action.
    pub action: ConflictAction,
}

impl Resolution {
    const LOCAL: Resolution = Resolution {
        winner: Winner::Local,
        action: ConflictAction::PushLocal,
    };
    const REMOTE: Resolution = Resolution {
        winner: Winner::Remote,
        action: ConflictAction::OverwriteLocal,
    };
    const SETTLED: Resolution = Resolution {
        winner: Winner::Neither,
        action: ConflictAction::Nothing,
    };
}

/// Last-writer-wins by version.
///
/// A strictly higher version wins; equal versions need no action. A copy that exists only on
/// one side wins against the missing one.
pub fn resolve<L, R>(local: Option<&L>, remote: Option<&R>) -> Resolution
where
    L: Versioned + ?Sized,
    R: Versioned + ?Sized,
{
    match (local, remote) {
        (None, None) => Resolution::SETTLED,
        (Some(_), None) => Resolution::LOCAL,
        (None, Some(_)) => Resolution::REMOTE,
        (Some(local), Some(remote)) => match local.version().cmp(&remote.version()) {
            std::cmp::Ordering::Greater => Resolution::LOCAL,
            std::cmp::Ordering::Less => Resolution::REMOTE,
            std::cmp::Ordering::Equal => Resolution::SETTLED,
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn higher_version_wins() {
        let local = json!({"version": 5});
        let remote = json!({"version": 7});
        assert_eq!(resolve(Some(&local), Some(&remote)), Resolution::REMOTE);
        assert_eq!(resolve(Some(&remote), Some(&local)), Resolution::LOCAL);
    }

    #[test]
    fn equal_versions_are_settled() {
        let copy = json!({"version": 3});
        let resolution = resolve(Some(&copy), Some(&copy));
        assert_eq!(resolution.winner, Winner::Neither);
        assert_eq!(resolution.action, ConflictAction::Nothing);
    }

    #[test]
    fn lone_copies_win() {
        let copy = json!({"version": 1});
        assert_eq!(resolve::<Value, Value>(Some(&copy), None), Resolution::LOCAL);
        assert_eq!(resolve::<Value, Value>(None, Some(&copy)), Resolution::REMOTE);
        assert_eq!(resolve::<Value, Value>(None, None), Resolution::SETTLED);
    }

    #[test]
    fn games_compare_against_documents() {
        let mut game = crate::state::game::tests::sample_game();
        game.version = 4;
        let remote = json!({"version": 4});
        assert_eq!(resolve(Some(&game), Some(&remote)).action, ConflictAction::Nothing);
    }
}
