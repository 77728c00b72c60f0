//! External operations
//!
//! The heavy numerical work of a refinement run (response estimation,
//! multi-tissue deconvolution, joint bias/intensity normalisation and the
//! brain-extraction tools) is delegated to collaborators behind
//! [`ExternalOperations`]. Every call is blocking and receives the run's
//! [`RunContext`]. Failures are reported as [`ToolError`].
//!
//! - `mrtrix`: implementation that drives the MRtrix3, FSL, HD-BET and
//!   SynthStrip command-line tools

pub mod mrtrix;

pub use mrtrix::MrtrixOperations;

use crate::config::{BetOptions, LmaxSchedule, RunContext, SynthStripOptions};
use crate::error::ToolError;
use crate::volume::{
    BalanceFactors, BiasField, BrainMask, DwiVolume, FodVolume, ScalarVolume, TissueResponse,
};

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Output of the joint bias-field / intensity optimiser
#[derive(Debug, Clone)]
pub struct JointNormalisation {
    pub bias_field: BiasField,
    pub balance: BalanceFactors,
    /// Input FODs after field correction and balancing, in input order
    pub normalised: Vec<FodVolume>,
}

/// Execution mode of HD-BET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdBetDevice {
    /// Full-accuracy GPU run
    Gpu,
    /// CPU run with reduced accuracy (fast mode, no test-time augmentation)
    CpuFast,
}

pub trait ExternalOperations {
    /// `dwi2mask <algorithm>` on a DWI series
    fn dwi2mask(&mut self, ctx: &RunContext, dwi: &DwiVolume, algorithm: &str) -> ToolResult<BrainMask>;

    /// Tissue response functions (WM, GM, CSF) estimated within `mask`
    fn estimate_responses(
        &mut self,
        ctx: &RunContext,
        dwi: &DwiVolume,
        mask: &BrainMask,
    ) -> ToolResult<Vec<TissueResponse>>;

    /// Multi-tissue constrained deconvolution, one FOD per scheduled tissue
    fn estimate_fods(
        &mut self,
        ctx: &RunContext,
        dwi: &DwiVolume,
        mask: &BrainMask,
        responses: &[TissueResponse],
        lmax: &LmaxSchedule,
    ) -> ToolResult<Vec<FodVolume>>;

    /// Joint bias field and per-tissue balance factor estimation
    fn joint_normalise(
        &mut self,
        ctx: &RunContext,
        fods: &[FodVolume],
        mask: &BrainMask,
    ) -> ToolResult<JointNormalisation>;

    /// FSL BET on a T2-weighted-like image
    fn bet(&mut self, ctx: &RunContext, image: &ScalarVolume, options: &BetOptions) -> ToolResult<BrainMask>;

    /// HD-BET on a T2-weighted-like image
    fn hdbet(&mut self, ctx: &RunContext, image: &ScalarVolume, device: HdBetDevice) -> ToolResult<BrainMask>;

    /// SynthStrip on a T2-weighted-like image
    fn synthstrip(
        &mut self,
        ctx: &RunContext,
        image: &ScalarVolume,
        options: &SynthStripOptions,
    ) -> ToolResult<BrainMask>;

    /// Automatic threshold selection (`mrthreshold` without explicit level)
    fn mrthreshold(&mut self, ctx: &RunContext, image: &ScalarVolume) -> ToolResult<BrainMask>;
}
