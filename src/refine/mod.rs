//! Iterative bias-field, intensity-normalisation and brain-mask refinement
//!
//! - `controller`: the iteration loop with rollback
//! - `convergence`: Dice overlap and termination decision
//! - `mask_revision`: per-algorithm mask re-derivation
//! - `scale`: CSF-anchored intensity scale

pub mod controller;
pub mod convergence;
pub mod mask_revision;
pub mod scale;

pub use controller::{IterationController, IterationSnapshot, RefinementOutput, RunSummary};
pub use convergence::{dice, ConvergenceState, ConvergenceStatus, Decision};
pub use mask_revision::{strategy_for, MaskRevisionStrategy, RevisionInput};
pub use scale::compute_scale;
