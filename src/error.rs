//! Error types
//!
//! `Error` covers everything that aborts a refinement run. Failures of the
//! external collaborators are reported at the trait seam as [`ToolError`] so
//! that callers can tell an expected fallback apart from a fatal failure
//! before it is folded into `Error::ExternalTool`.

use std::path::PathBuf;

use crate::volume::{Dims3, Tissue};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lmax schedule must contain 2 or 3 values, got {0}")]
    InvalidLmaxLength(usize),
    #[error("lmax values must be even non-negative integers, got {0}")]
    InvalidLmaxValue(i64),
    #[error("a 3-tissue lmax schedule requires multi-shell data ({shells} shell(s) found)")]
    LmaxRequiresMultiShell { shells: usize },
    #[error("reference intensity must be positive, got {0}")]
    InvalidReference(f64),
    #[error("Dice threshold must lie in (0, 1], got {0}")]
    InvalidDiceThreshold(f64),
    #[error("initial mask grid {mask:?} does not match DWI spatial grid {dwi:?}")]
    InitMaskMismatch { mask: Dims3, dwi: Dims3 },
    #[error("gradient table has {rows} rows but the image has {volumes} volumes")]
    GradientTableMismatch { rows: usize, volumes: usize },
    #[error("unknown mask algorithm '{0}'")]
    UnknownMaskAlgorithm(String),

    #[error("voxel buffer holds {actual} values, grid needs {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("grid mismatch: {left:?} vs {right:?}")]
    GridMismatch { left: Dims3, right: Dims3 },
    #[error("invalid calibration input: {0}")]
    InvalidCalibration(String),
    #[error("external operation returned no {0:?} output")]
    MissingTissue(Tissue),

    #[error(transparent)]
    ExternalTool(#[from] ToolError),
    #[error("NIfTI I/O failed: {0}")]
    Nifti(String),
    #[error("failed to parse table {path:?}: {message}")]
    Table { path: PathBuf, message: String },
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// True for errors raised while checking inputs, before any external call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidLmaxLength(_)
                | Error::InvalidLmaxValue(_)
                | Error::LmaxRequiresMultiShell { .. }
                | Error::InvalidReference(_)
                | Error::InvalidDiceThreshold(_)
                | Error::InitMaskMismatch { .. }
                | Error::GradientTableMismatch { .. }
                | Error::UnknownMaskAlgorithm(_)
        )
    }
}

/// Abnormal termination of an external collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{tool} failed: {message}")]
pub struct ToolError {
    pub tool: String,
    pub message: String,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}
