//! Intent lifecycle transitions.
//!
//! ```text
//! STAGED -> SENT -> CONFIRMED -> COMMITTED
//!             \
//!              -> REJECTED  -> ROLLED_BACK
//! ```
//!
//! A staged intent that never reaches SENT is discarded rather than rolled
//! back, so it leaves no record.

use super::{IntentState, TradeError};

/// Validates intent state transitions.
pub struct IntentLifecycle;

impl IntentLifecycle {
    /// Check if a transition is valid.
    #[must_use]
    pub const fn is_valid_transition(from: IntentState, to: IntentState) -> bool {
        matches!(
            (from, to),
            (IntentState::Staged, IntentState::Sent)
                | (IntentState::Sent, IntentState::Confirmed | IntentState::Rejected)
                | (IntentState::Confirmed, IntentState::Committed)
                // A local commit failure after remote success is rolled back for audit.
                | (IntentState::Confirmed | IntentState::Rejected, IntentState::RolledBack)
        )
    }

    /// Validate a transition.
    ///
    /// # Errors
    ///
    /// Returns [`TradeError::InvalidTransition`] if `from -> to` is not allowed.
    pub fn validate_transition(from: IntentState, to: IntentState) -> Result<(), TradeError> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(TradeError::InvalidTransition { from, to })
        }
    }

    /// States reachable from `from`.
    #[must_use]
    pub fn valid_next_states(from: IntentState) -> Vec<IntentState> {
        match from {
            IntentState::Staged => vec![IntentState::Sent],
            IntentState::Sent => vec![IntentState::Confirmed, IntentState::Rejected],
            IntentState::Confirmed => vec![IntentState::Committed, IntentState::RolledBack],
            IntentState::Rejected => vec![IntentState::RolledBack],
            IntentState::Committed | IntentState::RolledBack => vec![],
        }
    }

    /// Whether a state can be discarded without leaving a record.
    #[must_use]
    pub const fn is_discardable(state: IntentState) -> bool {
        matches!(state, IntentState::Staged | IntentState::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_valid() {
        assert!(IntentLifecycle::is_valid_transition(IntentState::Staged, IntentState::Sent));
        assert!(IntentLifecycle::is_valid_transition(IntentState::Sent, IntentState::Confirmed));
        assert!(IntentLifecycle::is_valid_transition(
            IntentState::Confirmed,
            IntentState::Committed
        ));
    }

    #[test]
    fn failure_path_is_valid() {
        assert!(IntentLifecycle::is_valid_transition(IntentState::Sent, IntentState::Rejected));
        assert!(IntentLifecycle::is_valid_transition(
            IntentState::Rejected,
            IntentState::RolledBack
        ));
    }

    #[test]
    fn cannot_skip_sent() {
        assert!(IntentLifecycle::validate_transition(IntentState::Staged, IntentState::Confirmed).is_err());
        assert!(IntentLifecycle::validate_transition(IntentState::Staged, IntentState::Committed).is_err());
    }

    #[test]
    fn final_states_are_terminal() {
        for state in [IntentState::Committed, IntentState::RolledBack] {
            assert!(IntentLifecycle::valid_next_states(state).is_empty());
            assert!(state.is_final());
        }
    }

    #[test]
    fn next_states_agree_with_validation() {
        let all = [
            IntentState::Staged,
            IntentState::Sent,
            IntentState::Confirmed,
            IntentState::Rejected,
            IntentState::Committed,
            IntentState::RolledBack,
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    IntentLifecycle::is_valid_transition(from, to),
                    IntentLifecycle::valid_next_states(from).contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }
}
