//! Common test utilities for dwi-biasnorm integration tests

#![allow(dead_code)]

use std::collections::VecDeque;

use dwi_biasnorm::config::{BetOptions, LmaxSchedule, RunContext, SynthStripOptions};
use dwi_biasnorm::error::ToolError;
use dwi_biasnorm::ops::{ExternalOperations, HdBetDevice, JointNormalisation, ToolResult};
use dwi_biasnorm::volume::{
    BalanceFactors, BrainMask, Dims3, DwiVolume, FodVolume, GradientTable, ScalarVolume, Tissue,
    TissueResponse,
};

pub const DIMS: Dims3 = (10, 10, 10);
pub const N_VOXELS: usize = 1000;

/// Mask holding the voxels with flat index in `range`
pub fn range_mask(range: std::ops::Range<usize>) -> BrainMask {
    let mut data = vec![0u8; N_VOXELS];
    for i in range {
        data[i] = 1;
    }
    BrainMask::new(data, DIMS).unwrap()
}

/// Cube of side `hi - lo` on the test grid
pub fn cube_mask(lo: usize, hi: usize) -> BrainMask {
    let mut data = vec![0u8; N_VOXELS];
    for z in lo..hi {
        for y in lo..hi {
            for x in lo..hi {
                data[x + y * 10 + z * 100] = 1;
            }
        }
    }
    BrainMask::new(data, DIMS).unwrap()
}

pub fn single_shell_gradients() -> GradientTable {
    GradientTable::new(vec![
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 1000.0],
        [0.0, 1.0, 0.0, 1000.0],
    ])
}

pub fn multi_shell_gradients() -> GradientTable {
    GradientTable::new(vec![
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 1000.0],
        [0.0, 1.0, 0.0, 2000.0],
    ])
}

/// Three-volume DWI: b=0 at 100, diffusion-weighted volumes at 50
pub fn test_dwi(gradients: GradientTable) -> DwiVolume {
    let mut data = vec![100.0; N_VOXELS];
    data.extend(vec![50.0; 2 * N_VOXELS]);
    DwiVolume::new(data, DIMS, 3, gradients).unwrap()
}

/// In-memory collaborator returning scripted outputs and recording calls
///
/// Every mask-producing call pops the next mask from `masks`. Calls whose
/// description starts with an entry of `failing` return a `ToolError`.
pub struct ScriptedOperations {
    pub masks: VecDeque<BrainMask>,
    pub calls: Vec<String>,
    pub failing: Vec<String>,
    pub csf_b0_l0: f64,
    pub csf_balance: f64,
    pub field_value: f64,
    pub fod_l0: f64,
}

impl ScriptedOperations {
    pub fn new(masks: Vec<BrainMask>) -> Self {
        Self {
            masks: masks.into(),
            calls: Vec::new(),
            failing: Vec::new(),
            csf_b0_l0: 2.0,
            csf_balance: 0.5,
            field_value: 1.0,
            fod_l0: 0.2,
        }
    }

    pub fn failing(mut self, call: &str) -> Self {
        self.failing.push(call.to_string());
        self
    }

    pub fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&mut self, call: String) -> ToolResult<()> {
        let fails = self.failing.iter().any(|f| call.starts_with(f.as_str()));
        self.calls.push(call.clone());
        if fails {
            return Err(ToolError::new(call, "scripted failure"));
        }
        Ok(())
    }

    fn next_mask(&mut self, call: String) -> ToolResult<BrainMask> {
        self.record(call)?;
        self.masks
            .pop_front()
            .ok_or_else(|| ToolError::new("scripted", "no mask left"))
    }
}

impl ExternalOperations for ScriptedOperations {
    fn dwi2mask(&mut self, _ctx: &RunContext, _dwi: &DwiVolume, algorithm: &str) -> ToolResult<BrainMask> {
        self.next_mask(format!("dwi2mask {}", algorithm))
    }

    fn estimate_responses(
        &mut self,
        _ctx: &RunContext,
        _dwi: &DwiVolume,
        _mask: &BrainMask,
    ) -> ToolResult<Vec<TissueResponse>> {
        self.record("dwi2response".to_string())?;
        Ok(vec![
            TissueResponse::new(Tissue::WhiteMatter, vec![vec![3000.0, 0.0, 0.0], vec![1500.0, -600.0, 100.0]]),
            TissueResponse::new(Tissue::GreyMatter, vec![vec![2500.0], vec![900.0]]),
            TissueResponse::new(Tissue::Csf, vec![vec![self.csf_b0_l0], vec![0.1]]),
        ])
    }

    fn estimate_fods(
        &mut self,
        _ctx: &RunContext,
        dwi: &DwiVolume,
        _mask: &BrainMask,
        _responses: &[TissueResponse],
        lmax: &LmaxSchedule,
    ) -> ToolResult<Vec<FodVolume>> {
        self.record(format!("dwi2fod {}", lmax))?;
        Ok(Tissue::for_schedule_len(lmax.len())
            .iter()
            .map(|&t| FodVolume::new(t, vec![1.0; N_VOXELS], dwi.dims(), 1).unwrap())
            .collect())
    }

    fn joint_normalise(
        &mut self,
        _ctx: &RunContext,
        fods: &[FodVolume],
        mask: &BrainMask,
    ) -> ToolResult<JointNormalisation> {
        self.record(format!("mtnormalise mask={}", mask.count()))?;
        let balance = fods
            .iter()
            .map(|f| {
                let factor = if f.tissue() == Tissue::Csf { self.csf_balance } else { 1.0 };
                (f.tissue(), factor)
            })
            .collect();
        let normalised = fods
            .iter()
            .map(|f| FodVolume::new(f.tissue(), vec![self.fod_l0; N_VOXELS], f.dims(), 1).unwrap())
            .collect();
        Ok(JointNormalisation {
            bias_field: ScalarVolume::filled(self.field_value, mask.dims()),
            balance: BalanceFactors::new(balance),
            normalised,
        })
    }

    fn bet(&mut self, _ctx: &RunContext, _image: &ScalarVolume, options: &BetOptions) -> ToolResult<BrainMask> {
        self.next_mask(format!("bet -f {}", options.fractional_intensity))
    }

    fn hdbet(&mut self, _ctx: &RunContext, _image: &ScalarVolume, device: HdBetDevice) -> ToolResult<BrainMask> {
        self.next_mask(format!("hdbet {:?}", device))
    }

    fn synthstrip(
        &mut self,
        _ctx: &RunContext,
        _image: &ScalarVolume,
        _options: &SynthStripOptions,
    ) -> ToolResult<BrainMask> {
        self.next_mask("synthstrip".to_string())
    }

    fn mrthreshold(&mut self, _ctx: &RunContext, _image: &ScalarVolume) -> ToolResult<BrainMask> {
        self.next_mask("mrthreshold".to_string())
    }
}

pub fn scratch() -> RunContext {
    RunContext::new(std::env::temp_dir()).with_threads(1)
}
