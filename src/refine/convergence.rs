//! Mask agreement and per-iteration termination decision

use std::fmt;

use crate::error::Result;
use crate::volume::BrainMask;

/// Dice overlap `2|A∩B| / (|A|+|B|)`
///
/// Two empty masks agree perfectly and give 1.0.
pub fn dice(a: &BrainMask, b: &BrainMask) -> Result<f64> {
    let common = a.intersection_count(b)?;
    let total = a.count() + b.count();
    if total == 0 {
        return Ok(1.0);
    }
    Ok(2.0 * common as f64 / total as f64)
}

/// Outcome of a refinement run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Running,
    ConvergedByDice,
    ConvergedByMaxIter,
    RolledBackDiverged,
}

impl ConvergenceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConvergenceStatus::Running)
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConvergenceStatus::Running => "running",
            ConvergenceStatus::ConvergedByDice => "converged (Dice threshold)",
            ConvergenceStatus::ConvergedByMaxIter => "stopped (iteration limit)",
            ConvergenceStatus::RolledBackDiverged => "rolled back (mask diverged)",
        };
        f.write_str(s)
    }
}

/// What to do with the iteration that has just been computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep it and stop: iteration budget spent
    AcceptMaxIter,
    /// Keep it and stop: masks agree
    AcceptDice,
    /// Discard it and restore the previous iteration
    RollBack,
    /// Keep it and iterate again
    Continue,
}

/// Iteration counter, previous Dice and status
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceState {
    pub iteration_index: usize,
    pub previous_dice: Option<f64>,
    pub status: ConvergenceStatus,
}

impl Default for ConvergenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceState {
    pub fn new() -> Self {
        Self {
            iteration_index: 1,
            previous_dice: None,
            status: ConvergenceStatus::Running,
        }
    }

    /// Classify the current iteration's Dice.
    ///
    /// Checked in order: iteration budget (`max_iters == 0` never fires),
    /// strict Dice threshold, then regression against the previous Dice.
    pub fn classify(&self, dice: f64, max_iters: usize, dice_threshold: f64) -> Decision {
        if max_iters > 0 && self.iteration_index == max_iters {
            Decision::AcceptMaxIter
        } else if dice > dice_threshold {
            Decision::AcceptDice
        } else if matches!(self.previous_dice, Some(prev) if dice < prev) {
            Decision::RollBack
        } else {
            Decision::Continue
        }
    }

    /// Apply `decision` for an iteration with the given Dice
    pub fn advance(&mut self, decision: Decision, dice: f64) {
        match decision {
            Decision::AcceptMaxIter => self.status = ConvergenceStatus::ConvergedByMaxIter,
            Decision::AcceptDice => self.status = ConvergenceStatus::ConvergedByDice,
            Decision::RollBack => self.status = ConvergenceStatus::RolledBackDiverged,
            Decision::Continue => {
                self.previous_dice = Some(dice);
                self.iteration_index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use approx::assert_relative_eq;

    fn range_mask(range: std::ops::Range<usize>) -> BrainMask {
        let mut data = vec![0u8; 1000];
        for i in range {
            data[i] = 1;
        }
        BrainMask::new(data, (10, 10, 10)).unwrap()
    }

    #[test]
    fn test_dice_values() {
        let a = range_mask(0..100);
        assert_relative_eq!(dice(&a, &a).unwrap(), 1.0);
        assert_relative_eq!(dice(&a, &range_mask(20..120)).unwrap(), 0.8);
        assert_relative_eq!(dice(&a, &range_mask(100..200)).unwrap(), 0.0);
    }

    #[test]
    fn test_dice_is_symmetric() {
        let a = range_mask(0..100);
        let b = range_mask(30..90);
        assert_eq!(dice(&a, &b).unwrap(), dice(&b, &a).unwrap());
    }

    #[test]
    fn test_dice_empty_masks() {
        let empty = range_mask(0..0);
        assert_eq!(dice(&empty, &empty).unwrap(), 1.0);
        assert_eq!(dice(&empty, &range_mask(0..10)).unwrap(), 0.0);
    }

    #[test]
    fn test_dice_grid_mismatch() {
        let a = range_mask(0..10);
        let b = BrainMask::new(vec![1u8; 8], (2, 2, 2)).unwrap();
        assert!(matches!(dice(&a, &b), Err(Error::GridMismatch { .. })));
    }

    #[test]
    fn test_no_rollback_at_first_iteration() {
        let state = ConvergenceState::new();
        assert_eq!(state.classify(0.0, 5, 0.999), Decision::Continue);
    }

    #[test]
    fn test_max_iter_wins_tie() {
        let mut state = ConvergenceState::new();
        state.advance(Decision::Continue, 0.9);
        // dice above threshold and at the budget: the budget branch is checked first
        assert_eq!(state.classify(0.9995, 2, 0.999), Decision::AcceptMaxIter);
        // regression at the budget is accepted too
        assert_eq!(state.classify(0.5, 2, 0.999), Decision::AcceptMaxIter);
    }

    #[test]
    fn test_threshold_is_strict() {
        let state = ConvergenceState::new();
        assert_eq!(state.classify(0.99, 5, 0.99), Decision::Continue);
        assert_eq!(state.classify(0.9901, 5, 0.99), Decision::AcceptDice);
    }

    #[test]
    fn test_regression_rolls_back() {
        let mut state = ConvergenceState::new();
        state.advance(Decision::Continue, 0.90);
        assert_eq!(state.iteration_index, 2);
        assert_eq!(state.classify(0.85, 5, 0.999), Decision::RollBack);
        // equal Dice is not a regression
        assert_eq!(state.classify(0.90, 5, 0.999), Decision::Continue);
    }

    #[test]
    fn test_unbounded_budget() {
        let mut state = ConvergenceState::new();
        for _ in 0..50 {
            assert_eq!(state.classify(0.5, 0, 0.999), Decision::Continue);
            state.advance(Decision::Continue, 0.5);
        }
        assert_eq!(state.iteration_index, 51);
        assert!(!state.status.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        let mut state = ConvergenceState::new();
        state.advance(Decision::RollBack, 0.1);
        assert_eq!(state.status, ConvergenceStatus::RolledBackDiverged);
        assert!(state.status.is_terminal());
        assert_eq!(state.iteration_index, 1);
    }
}
