//! Run configuration
//!
//! `IterationConfig` carries every tunable of a refinement run. All structs
//! deserialise with per-field defaults, so a partial document fills in the
//! rest. `RunContext` holds the per-run execution environment handed to each
//! external operation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::volume::GradientTable;

pub const DEFAULT_MAX_ITERS: usize = 2;
pub const DEFAULT_DICE_THRESHOLD: f64 = 1.0 - 1e-3;
pub const DEFAULT_REFERENCE_INTENSITY: f64 = 1000.0;
pub const DEFAULT_DWI2MASK_ALGORITHM: &str = "legacy";

pub const LMAX_SINGLE_SHELL: [u32; 2] = [4, 0];
pub const LMAX_MULTI_SHELL: [u32; 3] = [4, 0, 0];

/// Mask-derivation variant used to revise the brain mask each iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskAlgorithm {
    Dwi2mask,
    Fslbet,
    Hdbet,
    Mrthreshold,
    Synthstrip,
    Threshold,
}

impl MaskAlgorithm {
    pub const ALL: [MaskAlgorithm; 6] = [
        MaskAlgorithm::Dwi2mask,
        MaskAlgorithm::Fslbet,
        MaskAlgorithm::Hdbet,
        MaskAlgorithm::Mrthreshold,
        MaskAlgorithm::Synthstrip,
        MaskAlgorithm::Threshold,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MaskAlgorithm::Dwi2mask => "dwi2mask",
            MaskAlgorithm::Fslbet => "fslbet",
            MaskAlgorithm::Hdbet => "hdbet",
            MaskAlgorithm::Mrthreshold => "mrthreshold",
            MaskAlgorithm::Synthstrip => "synthstrip",
            MaskAlgorithm::Threshold => "threshold",
        }
    }
}

impl Default for MaskAlgorithm {
    fn default() -> Self {
        Self::Threshold
    }
}

impl fmt::Display for MaskAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MaskAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name() == key)
            .ok_or_else(|| Error::UnknownMaskAlgorithm(s.to_string()))
    }
}

/// FSL BET options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetOptions {
    #[serde(default = "BetOptions::default_fractional_intensity")]
    pub fractional_intensity: f64,
    #[serde(default = "BetOptions::default_robust")]
    pub robust: bool,
}

impl BetOptions {
    fn default_fractional_intensity() -> f64 {
        0.5
    }
    fn default_robust() -> bool {
        true
    }
}

impl Default for BetOptions {
    fn default() -> Self {
        Self {
            fractional_intensity: Self::default_fractional_intensity(),
            robust: Self::default_robust(),
        }
    }
}

/// SynthStrip options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthStripOptions {
    /// Mask border threshold in mm (tool default when unset)
    #[serde(default)]
    pub border: Option<f64>,
    #[serde(default)]
    pub gpu: bool,
}

/// Options of the in-process `threshold` variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdOptions {
    /// Tissue-sum value above which a voxel is brain: half the l=0 value of
    /// a unit-density voxel
    #[serde(default = "ThresholdOptions::default_tissue_sum_threshold")]
    pub tissue_sum_threshold: f64,
}

impl ThresholdOptions {
    fn default_tissue_sum_threshold() -> f64 {
        0.5 / (4.0 * std::f64::consts::PI).sqrt()
    }
}

impl Default for ThresholdOptions {
    fn default() -> Self {
        Self {
            tissue_sum_threshold: Self::default_tissue_sum_threshold(),
        }
    }
}

/// Mask revision selector with its variant-specific options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskOptions {
    #[serde(default)]
    pub algorithm: MaskAlgorithm,
    #[serde(default)]
    pub bet: BetOptions,
    #[serde(default)]
    pub synthstrip: SynthStripOptions,
    #[serde(default)]
    pub threshold: ThresholdOptions,
}

/// Tunables of one refinement run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    /// Iteration budget; 0 iterates until the Dice or divergence criterion fires
    #[serde(default = "IterationConfig::default_max_iters")]
    pub max_iters: usize,
    #[serde(default = "IterationConfig::default_dice_threshold")]
    pub dice_threshold: f64,
    /// Target b=0 CSF intensity after normalisation
    #[serde(default = "IterationConfig::default_reference_intensity")]
    pub reference_intensity: f64,
    /// Per-tissue maximal SH degree; derived from the shell structure if unset
    #[serde(default)]
    pub lmax: Option<Vec<i64>>,
    #[serde(default)]
    pub mask: MaskOptions,
    /// Algorithm passed to `dwi2mask` for the initial mask and the
    /// `dwi2mask` revision variant
    #[serde(default = "IterationConfig::default_dwi2mask_algorithm")]
    pub dwi2mask_algorithm: String,
}

impl IterationConfig {
    fn default_max_iters() -> usize {
        DEFAULT_MAX_ITERS
    }
    fn default_dice_threshold() -> f64 {
        DEFAULT_DICE_THRESHOLD
    }
    fn default_reference_intensity() -> f64 {
        DEFAULT_REFERENCE_INTENSITY
    }
    fn default_dwi2mask_algorithm() -> String {
        DEFAULT_DWI2MASK_ALGORITHM.to_string()
    }

    /// Check scalar settings and resolve the lmax schedule against the
    /// shell structure of `gradients`.
    pub fn validate(&self, gradients: &GradientTable) -> Result<LmaxSchedule> {
        if !(self.reference_intensity > 0.0) || !self.reference_intensity.is_finite() {
            return Err(Error::InvalidReference(self.reference_intensity));
        }
        if !(self.dice_threshold > 0.0 && self.dice_threshold <= 1.0) {
            return Err(Error::InvalidDiceThreshold(self.dice_threshold));
        }
        LmaxSchedule::resolve(self.lmax.as_deref(), gradients)
    }
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iters: Self::default_max_iters(),
            dice_threshold: Self::default_dice_threshold(),
            reference_intensity: Self::default_reference_intensity(),
            lmax: None,
            mask: MaskOptions::default(),
            dwi2mask_algorithm: Self::default_dwi2mask_algorithm(),
        }
    }
}

/// Validated per-tissue maximal spherical-harmonic degrees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmaxSchedule(Vec<u32>);

impl LmaxSchedule {
    pub fn resolve(requested: Option<&[i64]>, gradients: &GradientTable) -> Result<Self> {
        let multishell = gradients.is_multishell();
        let values = match requested {
            None if multishell => return Ok(Self(LMAX_MULTI_SHELL.to_vec())),
            None => return Ok(Self(LMAX_SINGLE_SHELL.to_vec())),
            Some(values) => values,
        };

        if values.len() != 2 && values.len() != 3 {
            return Err(Error::InvalidLmaxLength(values.len()));
        }
        if let Some(&bad) = values.iter().find(|&&v| v < 0 || v % 2 != 0 || v > u32::MAX as i64) {
            return Err(Error::InvalidLmaxValue(bad));
        }
        if values.len() == 3 && !multishell {
            return Err(Error::LmaxRequiresMultiShell {
                shells: gradients.shell_bvalues().len(),
            });
        }
        Ok(Self(values.iter().map(|&v| v as u32).collect()))
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LmaxSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Execution environment of one run, passed explicitly to the controller
/// and every external operation
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory for intermediate files; owned by the caller
    pub scratch_dir: PathBuf,
    /// Thread count forwarded to external tools (tool default when unset)
    pub nthreads: Option<usize>,
}

impl RunContext {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            nthreads: None,
        }
    }

    pub fn with_threads(mut self, nthreads: usize) -> Self {
        self.nthreads = Some(nthreads);
        self
    }

    pub fn scratch_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.scratch_dir.join(name)
    }
}
