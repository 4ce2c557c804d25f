//! Validation helpers for DTOs.

use std::borrow::Borrow;

use validator::ValidationError;

use crate::dto::setup::GameSetup;

/// Quarter counts a match can be configured with.
pub const ALLOWED_QUARTER_COUNTS: [u8; 2] = [2, 4];

/// Validates that a match is played over 2 or 4 quarters.
///
/// # Examples
///
/// ```ignore
/// validate_quarter_count(&4) // Ok
/// validate_quarter_count(&3) // Err
/// ```
pub fn validate_quarter_count<T: Borrow<u8>>(count: T) -> Result<(), ValidationError> {
    let count = count.borrow();
    if ALLOWED_QUARTER_COUNTS.contains(count) {
        return Ok(());
    }

    let mut err = ValidationError::new("quarter_count");
    err.message = Some(format!("A match has 2 or 4 quarters (got {count})").into());
    Err(err)
}

/// Validates that there is exactly one break between each pair of quarters and that every
/// break lasts at most an hour.
pub fn validate_break_plan(setup: &GameSetup) -> Result<(), ValidationError> {
    let expected = usize::from(setup.num_quarters.saturating_sub(1));
    if setup.break_durations_sec.len() != expected {
        let mut err = ValidationError::new("break_count");
        err.message = Some(
            format!(
                "Expected {expected} break durations for {} quarters (got {})",
                setup.num_quarters,
                setup.break_durations_sec.len()
            )
            .into(),
        );
        return Err(err);
    }

    if setup.break_durations_sec.iter().any(|secs| *secs > 3_600) {
        let mut err = ValidationError::new("break_duration");
        err.message = Some("Breaks cannot be longer than one hour".into());
        return Err(err);
    }

    Ok(())
}
