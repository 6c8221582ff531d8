//! One-shot lifecycle states behind a single CAS primitive.
//!
//! Channels, peer clients, and the container all gate their lifecycle on a
//! small monotonic state lattice. `StateCell` is the one place the
//! compare-and-swap lives; call sites name their states as constants and
//! ask for a transition, so a duplicate start/close is a typed error
//! rather than a silent overwrite.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// A transition was requested from a state the cell is not in.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid state transition {from} -> {to}: current state is {actual}")]
pub struct StateError {
    pub from: u32,
    pub to: u32,
    pub actual: u32,
}

/// Atomic state holder with compare-and-swap transitions.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU32,
}

impl StateCell {
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            state: AtomicU32::new(initial),
        }
    }

    /// Moves `from -> to` atomically.
    ///
    /// # Errors
    ///
    /// Returns `StateError` carrying the actual state when the cell is not
    /// in `from`; repeated transitions therefore fail deterministically.
    pub fn transition(&self, from: u32, to: u32) -> Result<(), StateError> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| StateError { from, to, actual })
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is(&self, state: u32) -> bool {
        self.get() == state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_succeeds_once() {
        let cell = StateCell::new(0);
        assert!(cell.transition(0, 1).is_ok());
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn duplicate_transition_fails_with_actual_state() {
        let cell = StateCell::new(0);
        cell.transition(0, 1).unwrap();

        let err = cell.transition(0, 1).unwrap_err();
        assert_eq!(err.actual, 1);
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn skipping_a_state_fails() {
        let cell = StateCell::new(0);
        assert!(cell.transition(1, 2).is_err());
        assert_eq!(cell.get(), 0);
    }
}
