//! Brain mask revision
//!
//! Each iteration re-derives the brain mask from the freshly corrected data.
//! One strategy per [`MaskAlgorithm`], chosen once per run by
//! [`strategy_for`]:
//!
//! - `dwi2mask`: `dwi2mask <algorithm>` on the corrected DWI
//! - `fslbet`, `hdbet`, `synthstrip`: brain extraction on a T2-weighted-like
//!   image synthesised from the tissue sum
//! - `mrthreshold`: automatic threshold of the tissue sum, then clean-up
//! - `threshold`: fixed threshold of the tissue sum, then clean-up
//!
//! Every revised mask is restricted to voxels with positive DWI signal.

use std::f64::consts::PI;

use tracing::warn;

use crate::config::{BetOptions, MaskAlgorithm, MaskOptions, RunContext, SynthStripOptions, ThresholdOptions};
use crate::error::Result;
use crate::ops::{ExternalOperations, HdBetDevice};
use crate::utils::mask::threshold_above;
use crate::volume::{BrainMask, DwiVolume, ScalarVolume, TissueSumImage};

/// Data available to a mask revision
#[derive(Debug, Clone, Copy)]
pub struct RevisionInput<'a> {
    /// DWI after this iteration's bias correction and scaling
    pub dwi: &'a DwiVolume,
    pub tissue_sum: &'a TissueSumImage,
    /// Voxels where the uncorrected DWI has positive signal in some volume
    pub positive_signal: &'a BrainMask,
    pub reference_intensity: f64,
}

impl RevisionInput<'_> {
    /// Tissue sum expressed as b=0 intensity: a voxel of pure unit-density
    /// tissue maps to the reference intensity, giving T2-weighted contrast.
    pub fn t2_like(&self) -> ScalarVolume {
        self.tissue_sum.scaled((4.0 * PI).sqrt() * self.reference_intensity)
    }
}

pub trait MaskRevisionStrategy {
    fn algorithm(&self) -> MaskAlgorithm;

    /// Mask produced by the algorithm, before the positive-signal restriction
    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask>;

    /// Revised mask for the next iteration
    fn revise(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        self.extract(ops, ctx, input)?.intersect(input.positive_signal)
    }
}

/// Build the strategy selected in `options`
pub fn strategy_for(options: &MaskOptions, dwi2mask_algorithm: &str) -> Box<dyn MaskRevisionStrategy> {
    match options.algorithm {
        MaskAlgorithm::Dwi2mask => Box::new(Dwi2MaskRevision {
            algorithm: dwi2mask_algorithm.to_string(),
        }),
        MaskAlgorithm::Fslbet => Box::new(BetRevision {
            options: options.bet.clone(),
        }),
        MaskAlgorithm::Hdbet => Box::new(HdBetRevision),
        MaskAlgorithm::Mrthreshold => Box::new(MrThresholdRevision),
        MaskAlgorithm::Synthstrip => Box::new(SynthStripRevision {
            options: options.synthstrip.clone(),
        }),
        MaskAlgorithm::Threshold => Box::new(ThresholdRevision {
            options: options.threshold.clone(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct Dwi2MaskRevision {
    pub algorithm: String,
}

impl MaskRevisionStrategy for Dwi2MaskRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Dwi2mask
    }

    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        Ok(ops.dwi2mask(ctx, input.dwi, &self.algorithm)?)
    }
}

#[derive(Debug, Clone)]
pub struct BetRevision {
    pub options: BetOptions,
}

impl MaskRevisionStrategy for BetRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Fslbet
    }

    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        Ok(ops.bet(ctx, &input.t2_like(), &self.options)?)
    }
}

/// HD-BET on the GPU, retried once on the CPU in fast mode
#[derive(Debug, Clone, Copy, Default)]
pub struct HdBetRevision;

impl MaskRevisionStrategy for HdBetRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Hdbet
    }

    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        let image = input.t2_like();
        match ops.hdbet(ctx, &image, HdBetDevice::Gpu) {
            Ok(mask) => Ok(mask),
            Err(e) => {
                warn!(error = %e, "HD-BET GPU run failed, retrying on CPU in fast mode");
                Ok(ops.hdbet(ctx, &image, HdBetDevice::CpuFast)?)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MrThresholdRevision;

impl MaskRevisionStrategy for MrThresholdRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Mrthreshold
    }

    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        Ok(ops.mrthreshold(ctx, input.tissue_sum)?.cleaned())
    }
}

#[derive(Debug, Clone)]
pub struct SynthStripRevision {
    pub options: SynthStripOptions,
}

impl MaskRevisionStrategy for SynthStripRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Synthstrip
    }

    fn extract(
        &self,
        ops: &mut dyn ExternalOperations,
        ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        Ok(ops.synthstrip(ctx, &input.t2_like(), &self.options)?)
    }
}

/// Fixed tissue-sum threshold computed in-process
#[derive(Debug, Clone)]
pub struct ThresholdRevision {
    pub options: ThresholdOptions,
}

impl MaskRevisionStrategy for ThresholdRevision {
    fn algorithm(&self) -> MaskAlgorithm {
        MaskAlgorithm::Threshold
    }

    fn extract(
        &self,
        _ops: &mut dyn ExternalOperations,
        _ctx: &RunContext,
        input: &RevisionInput<'_>,
    ) -> Result<BrainMask> {
        let sum = input.tissue_sum;
        let raw = threshold_above(sum.data(), self.options.tissue_sum_threshold);
        Ok(BrainMask::from_parts(raw, sum.dims(), *sum.geometry()).cleaned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LmaxSchedule;
    use crate::error::{Error, ToolError};
    use crate::ops::{JointNormalisation, ToolResult};
    use crate::volume::{FodVolume, GradientTable, TissueResponse};

    const DIMS: (usize, usize, usize) = (6, 6, 6);

    /// Records brain-extraction calls; fails HD-BET on the devices listed
    #[derive(Default)]
    struct RecordingOps {
        calls: Vec<String>,
        failing_devices: Vec<HdBetDevice>,
        last_image_max: f64,
        mask: Option<BrainMask>,
    }

    impl RecordingOps {
        fn answer(&mut self, call: &str, image: &ScalarVolume) -> ToolResult<BrainMask> {
            self.calls.push(call.to_string());
            self.last_image_max = image.data().iter().cloned().fold(f64::MIN, f64::max);
            Ok(self.mask.clone().unwrap_or_else(|| BrainMask::new(vec![1; 216], DIMS).unwrap()))
        }
    }

    impl ExternalOperations for RecordingOps {
        fn dwi2mask(&mut self, _ctx: &RunContext, _dwi: &DwiVolume, algorithm: &str) -> ToolResult<BrainMask> {
            self.calls.push(format!("dwi2mask {}", algorithm));
            Ok(BrainMask::new(vec![1; 216], DIMS).unwrap())
        }
        fn estimate_responses(&mut self, _: &RunContext, _: &DwiVolume, _: &BrainMask) -> ToolResult<Vec<TissueResponse>> {
            unreachable!()
        }
        fn estimate_fods(
            &mut self,
            _: &RunContext,
            _: &DwiVolume,
            _: &BrainMask,
            _: &[TissueResponse],
            _: &LmaxSchedule,
        ) -> ToolResult<Vec<FodVolume>> {
            unreachable!()
        }
        fn joint_normalise(&mut self, _: &RunContext, _: &[FodVolume], _: &BrainMask) -> ToolResult<JointNormalisation> {
            unreachable!()
        }
        fn bet(&mut self, _ctx: &RunContext, image: &ScalarVolume, options: &BetOptions) -> ToolResult<BrainMask> {
            self.answer(&format!("bet -f {}", options.fractional_intensity), image)
        }
        fn hdbet(&mut self, _ctx: &RunContext, image: &ScalarVolume, device: HdBetDevice) -> ToolResult<BrainMask> {
            let call = format!("hdbet {:?}", device);
            if self.failing_devices.contains(&device) {
                self.calls.push(call);
                return Err(ToolError::new("hd-bet", "CUDA unavailable"));
            }
            self.answer(&call, image)
        }
        fn synthstrip(&mut self, _ctx: &RunContext, image: &ScalarVolume, _: &SynthStripOptions) -> ToolResult<BrainMask> {
            self.answer("synthstrip", image)
        }
        fn mrthreshold(&mut self, _ctx: &RunContext, image: &ScalarVolume) -> ToolResult<BrainMask> {
            self.answer("mrthreshold", image)
        }
    }

    struct Fixture {
        dwi: DwiVolume,
        tissue_sum: ScalarVolume,
        positive: BrainMask,
    }

    impl Fixture {
        fn new() -> Self {
            let grad = GradientTable::new(vec![[0.0, 0.0, 0.0, 0.0]]);
            let dwi = DwiVolume::new(vec![100.0; 216], DIMS, 1, grad).unwrap();
            // unit-density cube in the centre, 2..4 along every axis
            let mut sum = vec![0.0; 216];
            for z in 2..4 {
                for y in 2..4 {
                    for x in 2..4 {
                        sum[x + y * 6 + z * 36] = 1.0 / (4.0 * PI).sqrt();
                    }
                }
            }
            // isolated bright voxel that cleaning must drop
            sum[0] = 1.0;
            let mut positive = vec![1u8; 216];
            positive[2 + 2 * 6 + 2 * 36] = 0;
            Self {
                dwi,
                tissue_sum: ScalarVolume::new(sum, DIMS).unwrap(),
                positive: BrainMask::new(positive, DIMS).unwrap(),
            }
        }

        fn input(&self) -> RevisionInput<'_> {
            RevisionInput {
                dwi: &self.dwi,
                tissue_sum: &self.tissue_sum,
                positive_signal: &self.positive,
                reference_intensity: 1000.0,
            }
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(std::env::temp_dir())
    }

    #[test]
    fn test_strategy_selection() {
        for algorithm in MaskAlgorithm::ALL {
            let options = MaskOptions { algorithm, ..Default::default() };
            assert_eq!(strategy_for(&options, "legacy").algorithm(), algorithm);
        }
    }

    #[test]
    fn test_t2_like_maps_unit_density_to_reference() {
        let fx = Fixture::new();
        let t2 = fx.input().t2_like();
        let centre = 2 + 2 * 6 + 2 * 36;
        assert!((t2.data()[centre] - 1000.0).abs() < 1e-9);
        assert_eq!(t2.data()[1], 0.0);
    }

    #[test]
    fn test_threshold_revision_cleans_and_restricts() {
        let fx = Fixture::new();
        let mut ops = RecordingOps::default();
        let strategy = strategy_for(&MaskOptions::default(), "legacy");
        let mask = strategy.revise(&mut ops, &ctx(), &fx.input()).unwrap();

        assert!(ops.calls.is_empty());
        assert_eq!(mask.data()[0], 0, "isolated voxel survived");
        // 8-voxel cube minus the voxel without positive signal
        assert_eq!(mask.count(), 7);
    }

    #[test]
    fn test_dwi2mask_revision_uses_algorithm() {
        let fx = Fixture::new();
        let mut ops = RecordingOps::default();
        let options = MaskOptions { algorithm: MaskAlgorithm::Dwi2mask, ..Default::default() };
        let mask = strategy_for(&options, "fslbet").revise(&mut ops, &ctx(), &fx.input()).unwrap();
        assert_eq!(ops.calls, vec!["dwi2mask fslbet"]);
        assert_eq!(mask.count(), 215);
    }

    #[test]
    fn test_bet_receives_t2_like_image() {
        let fx = Fixture::new();
        let mut ops = RecordingOps::default();
        let options = MaskOptions { algorithm: MaskAlgorithm::Fslbet, ..Default::default() };
        strategy_for(&options, "legacy").revise(&mut ops, &ctx(), &fx.input()).unwrap();
        assert_eq!(ops.calls, vec!["bet -f 0.5"]);
        let expected_max = (4.0 * PI).sqrt() * 1000.0;
        assert!((ops.last_image_max - expected_max).abs() < 1e-6);
    }

    #[test]
    fn test_hdbet_falls_back_to_cpu() {
        let fx = Fixture::new();
        let mut ops = RecordingOps {
            failing_devices: vec![HdBetDevice::Gpu],
            ..Default::default()
        };
        let mask = HdBetRevision.revise(&mut ops, &ctx(), &fx.input()).unwrap();
        assert_eq!(ops.calls, vec!["hdbet Gpu", "hdbet CpuFast"]);
        assert_eq!(mask.count(), 215);
    }

    #[test]
    fn test_hdbet_failure_after_fallback() {
        let fx = Fixture::new();
        let mut ops = RecordingOps {
            failing_devices: vec![HdBetDevice::Gpu, HdBetDevice::CpuFast],
            ..Default::default()
        };
        let err = HdBetRevision.revise(&mut ops, &ctx(), &fx.input()).unwrap_err();
        assert!(matches!(err, Error::ExternalTool(ToolError { ref tool, .. }) if tool == "hd-bet"));
        assert_eq!(ops.calls.len(), 2);
    }

    #[test]
    fn test_mrthreshold_output_is_cleaned() {
        let fx = Fixture::new();
        let mut raw = vec![0u8; 216];
        raw[0] = 1;
        for z in 2..5 {
            for y in 2..5 {
                for x in 2..5 {
                    raw[x + y * 6 + z * 36] = 1;
                }
            }
        }
        // interior hole
        raw[3 + 3 * 6 + 3 * 36] = 0;
        let mut ops = RecordingOps {
            mask: Some(BrainMask::new(raw, DIMS).unwrap()),
            ..Default::default()
        };
        let mask = MrThresholdRevision.revise(&mut ops, &ctx(), &fx.input()).unwrap();
        assert_eq!(ops.calls, vec!["mrthreshold"]);
        assert_eq!(mask.data()[0], 0);
        assert_eq!(mask.data()[3 + 3 * 6 + 3 * 36], 1);
        // 27-voxel cube minus the voxel without positive signal
        assert_eq!(mask.count(), 26);
    }

    #[test]
    fn test_synthstrip_grid_mismatch_is_error() {
        let fx = Fixture::new();
        let mut ops = RecordingOps {
            mask: Some(BrainMask::new(vec![1; 8], (2, 2, 2)).unwrap()),
            ..Default::default()
        };
        let options = MaskOptions { algorithm: MaskAlgorithm::Synthstrip, ..Default::default() };
        let err = strategy_for(&options, "legacy").revise(&mut ops, &ctx(), &fx.input()).unwrap_err();
        assert!(matches!(err, Error::GridMismatch { .. }));
    }
}
