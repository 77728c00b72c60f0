//! DWI-BiasNorm: iterative bias field correction, intensity normalisation
//! and brain mask refinement for diffusion-weighted MRI
//!
//! The refinement loop alternates between multi-tissue modelling within the
//! current brain mask and re-deriving the mask from the corrected data, until
//! the mask stabilises, the iteration budget is spent or the mask agreement
//! regresses.
//!
//! # Modules
//! - `refine`: iteration controller, convergence policy, scale calibration,
//!   mask revision strategies
//! - `ops`: external operations trait and its command-line tool backend
//! - `volume`: DWI, mask, scalar and FOD image containers
//! - `config`: run configuration and lmax schedule validation
//! - `utils`: voxel-level mask helpers
//! - `nifti_io`, `tables`: NIfTI images and text tables on disk

// Data model
pub mod error;
pub mod volume;
pub mod config;

// Algorithm modules
pub mod refine;
pub mod utils;

// External collaborators
pub mod ops;

// I/O modules
pub mod nifti_io;
pub mod tables;

pub use config::{IterationConfig, LmaxSchedule, MaskAlgorithm, MaskOptions, RunContext};
pub use error::{Error, Result, ToolError};
pub use ops::{ExternalOperations, MrtrixOperations};
pub use refine::{IterationController, RefinementOutput, RunSummary};
pub use volume::{BrainMask, DwiVolume, GradientTable, ScalarVolume};
