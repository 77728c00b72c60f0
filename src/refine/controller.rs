//! Alternating bias-field / intensity / mask refinement loop
//!
//! Each iteration estimates tissue responses and FODs within the current
//! mask, jointly normalises the FODs within the eroded mask, corrects and
//! rescales the DWI, re-derives the mask from the corrected data and compares
//! it with the previous one. The loop stops when the iteration budget is
//! spent, when the masks agree (Dice above threshold) or when the agreement
//! regresses, in which case the previous iteration is restored.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::convergence::{dice, ConvergenceState, ConvergenceStatus, Decision};
use super::mask_revision::{strategy_for, RevisionInput};
use super::scale::compute_scale;
use crate::config::{IterationConfig, RunContext};
use crate::error::{Error, Result};
use crate::ops::ExternalOperations;
use crate::volume::{BiasField, BrainMask, DwiVolume, FodVolume, ScalarVolume, Tissue, TissueSumImage};

/// Outputs of one completed iteration
///
/// Images are shared so that restoring a snapshot hands back the same
/// allocations.
#[derive(Debug, Clone)]
pub struct IterationSnapshot {
    pub iteration: usize,
    pub dwi: Arc<DwiVolume>,
    pub mask: Arc<BrainMask>,
    /// Product of all bias fields estimated so far
    pub bias_field: Arc<BiasField>,
    pub tissue_sum: Arc<TissueSumImage>,
    /// Product of all intensity multipliers applied so far
    pub total_scale: f64,
    /// Agreement between this iteration's input and output masks
    pub dice: f64,
}

/// How the run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: ConvergenceStatus,
    /// Iterations computed, including one discarded by a rollback
    pub iterations: usize,
    /// Iteration whose results were kept
    pub accepted_iteration: usize,
    pub final_dice: f64,
    pub dice_history: Vec<f64>,
    pub total_scale: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            ConvergenceStatus::RolledBackDiverged => write!(
                f,
                "{} at iteration {}, kept iteration {}",
                self.status, self.iterations, self.accepted_iteration
            )?,
            _ => write!(f, "{} after {} iteration(s)", self.status, self.iterations)?,
        }
        write!(f, "; final Dice {:.6}, total scale {:.6}", self.final_dice, self.total_scale)
    }
}

/// Final images and summary of a refinement run
#[derive(Debug, Clone)]
pub struct RefinementOutput {
    pub dwi: Arc<DwiVolume>,
    pub mask: Arc<BrainMask>,
    pub bias_field: Arc<BiasField>,
    pub tissue_sum: Arc<TissueSumImage>,
    pub total_scale: f64,
    pub summary: RunSummary,
}

pub struct IterationController {
    config: IterationConfig,
}

impl IterationController {
    pub fn new(config: IterationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IterationConfig {
        &self.config
    }

    /// Run the refinement loop to termination
    ///
    /// If `init_mask` is `None` the initial mask comes from `dwi2mask` with
    /// the configured algorithm, applied to the uncorrected DWI.
    pub fn run(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        dwi: DwiVolume,
        init_mask: Option<BrainMask>,
    ) -> Result<RefinementOutput> {
        self.run_with_progress(ops, ctx, dwi, init_mask, |_| {})
    }

    /// Same as `run` but calls `progress_callback` with every computed
    /// iteration, before the termination decision
    pub fn run_with_progress<F>(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        dwi: DwiVolume,
        init_mask: Option<BrainMask>,
        mut progress_callback: F,
    ) -> Result<RefinementOutput>
    where
        F: FnMut(&IterationSnapshot),
    {
        let config = &self.config;
        let lmax = config.validate(dwi.gradients())?;
        if let Some(mask) = &init_mask {
            if mask.dims() != dwi.dims() {
                return Err(Error::InitMaskMismatch { mask: mask.dims(), dwi: dwi.dims() });
            }
        }
        let strategy = strategy_for(&config.mask, &config.dwi2mask_algorithm);

        info!(
            max_iters = config.max_iters,
            dice_threshold = config.dice_threshold,
            lmax = %lmax,
            mask_algorithm = %strategy.algorithm(),
            "starting bias field and mask refinement"
        );

        let positive_signal = dwi.positive_signal_mask();
        let init_mask = match init_mask {
            Some(mask) => mask,
            None => ops.dwi2mask(ctx, &dwi, &config.dwi2mask_algorithm)?,
        };

        let mut dwi = Arc::new(dwi);
        let mut mask = Arc::new(init_mask);
        let mut bias_field: Option<Arc<BiasField>> = None;
        let mut total_scale = 1.0;
        let mut previous: Option<IterationSnapshot> = None;
        let mut dice_history = Vec::new();
        let mut state = ConvergenceState::new();

        let kept = loop {
            let iteration = state.iteration_index;

            let responses = ops.estimate_responses(ctx, &dwi, &mask)?;
            let fods = ops.estimate_fods(ctx, &dwi, &mask, &responses, &lmax)?;
            let normalisation = ops.joint_normalise(ctx, &fods, &mask.eroded(1))?;

            let csf_response = responses
                .iter()
                .find(|r| r.tissue == Tissue::Csf)
                .and_then(|r| r.b0_l0())
                .ok_or(Error::MissingTissue(Tissue::Csf))?;
            let csf_balance = normalisation
                .balance
                .get(Tissue::Csf)
                .ok_or(Error::MissingTissue(Tissue::Csf))?;
            let scale = compute_scale(config.reference_intensity, csf_response, csf_balance)?;

            let corrected = Arc::new(dwi.corrected(&normalisation.bias_field, scale)?);
            let tissue_sum = Arc::new(sum_l0(&normalisation.normalised)?);

            let revised = strategy.revise(
                ops,
                ctx,
                &RevisionInput {
                    dwi: &corrected,
                    tissue_sum: &tissue_sum,
                    positive_signal: &positive_signal,
                    reference_intensity: config.reference_intensity,
                },
            )?;
            let dice = dice(&mask, &revised)?;
            dice_history.push(dice);

            let field = match &bias_field {
                Some(previous_field) => previous_field.multiply(&normalisation.bias_field)?,
                None => normalisation.bias_field,
            };
            let snapshot = IterationSnapshot {
                iteration,
                dwi: corrected,
                mask: Arc::new(revised),
                bias_field: Arc::new(field),
                tissue_sum,
                total_scale: total_scale * scale,
                dice,
            };
            progress_callback(&snapshot);

            let decision = state.classify(dice, config.max_iters, config.dice_threshold);
            info!(iteration, dice, scale, voxels = snapshot.mask.count(), ?decision, "iteration complete");
            state.advance(decision, dice);

            match decision {
                Decision::AcceptMaxIter | Decision::AcceptDice => break snapshot,
                Decision::RollBack => {
                    warn!(
                        iteration,
                        dice,
                        previous_dice = ?state.previous_dice,
                        "mask agreement decreased, reverting to previous iteration"
                    );
                    // a rollback requires a previous Dice, which is only
                    // recorded together with its snapshot
                    break previous.take().unwrap_or(snapshot);
                }
                Decision::Continue => {
                    dwi = Arc::clone(&snapshot.dwi);
                    mask = Arc::clone(&snapshot.mask);
                    bias_field = Some(Arc::clone(&snapshot.bias_field));
                    total_scale = snapshot.total_scale;
                    previous = Some(snapshot);
                }
            }
        };

        let summary = RunSummary {
            status: state.status,
            iterations: state.iteration_index,
            accepted_iteration: kept.iteration,
            final_dice: kept.dice,
            dice_history,
            total_scale: kept.total_scale,
        };
        info!("{}", summary);

        Ok(RefinementOutput {
            dwi: kept.dwi,
            mask: kept.mask,
            bias_field: kept.bias_field,
            tissue_sum: kept.tissue_sum,
            total_scale: kept.total_scale,
            summary,
        })
    }
}

/// Voxelwise sum of the l=0 coefficients of all tissues
fn sum_l0(fods: &[FodVolume]) -> Result<TissueSumImage> {
    let (first, rest) = fods.split_first().ok_or(Error::MissingTissue(Tissue::Csf))?;
    let dims = first.dims();
    let mut sum = first.l0().data().to_vec();
    for fod in rest {
        if fod.dims() != dims {
            return Err(Error::GridMismatch { left: dims, right: fod.dims() });
        }
        for (s, v) in sum.iter_mut().zip(fod.l0().data()) {
            *s += v;
        }
    }
    Ok(ScalarVolume::from_parts(sum, dims, *first.geometry()))
}
