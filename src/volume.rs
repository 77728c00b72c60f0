//! Image containers exchanged between the refinement loop and the external
//! operations.
//!
//! All voxel buffers are flattened in Fortran order (x varies fastest) to
//! match the NIfTI convention. 4D buffers store one full 3D volume after
//! another: index = x + y*nx + z*nx*ny + t*nx*ny*nz.

use crate::error::{Error, Result};
use crate::utils::mask as mask_utils;

/// Spatial grid dimensions (nx, ny, nz)
pub type Dims3 = (usize, usize, usize);

/// b-values at or below this are treated as b=0
pub const BZERO_THRESHOLD: f64 = 10.0;

/// Maximum b-value spread within one shell
pub const SHELL_TOLERANCE: f64 = 80.0;

/// Tissue compartments of the multi-tissue model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tissue {
    WhiteMatter,
    GreyMatter,
    Csf,
}

impl Tissue {
    pub fn short_name(&self) -> &'static str {
        match self {
            Tissue::WhiteMatter => "wm",
            Tissue::GreyMatter => "gm",
            Tissue::Csf => "csf",
        }
    }

    /// Tissues modelled for an lmax schedule with `n` entries
    pub fn for_schedule_len(n: usize) -> &'static [Tissue] {
        if n >= 3 {
            &[Tissue::WhiteMatter, Tissue::GreyMatter, Tissue::Csf]
        } else {
            &[Tissue::WhiteMatter, Tissue::Csf]
        }
    }
}

/// Voxel size and scanner-space affine shared by every image of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            voxel_size: (1.0, 1.0, 1.0),
            affine: [
                1.0, 0.0, 0.0, 0.0,
                0.0, 1.0, 0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }
}

fn check_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::BufferSize { expected, actual });
    }
    Ok(())
}

fn n_voxels(dims: Dims3) -> usize {
    dims.0 * dims.1 * dims.2
}

//=============================================================================
// Gradient table
//=============================================================================

/// Diffusion gradient table: one `[x, y, z, b]` row per volume
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    rows: Vec<[f64; 4]>,
}

impl GradientTable {
    pub fn new(rows: Vec<[f64; 4]>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[[f64; 4]] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bvalues(&self) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(|r| r[3])
    }

    /// Indices of the b=0 volumes
    pub fn bzero_volumes(&self) -> Vec<usize> {
        self.bvalues()
            .enumerate()
            .filter(|(_, b)| *b <= BZERO_THRESHOLD)
            .map(|(i, _)| i)
            .collect()
    }

    /// Mean b-value of each shell, ascending; b=0 counts as a shell
    pub fn shell_bvalues(&self) -> Vec<f64> {
        let mut bvals: Vec<f64> = self
            .bvalues()
            .map(|b| if b <= BZERO_THRESHOLD { 0.0 } else { b })
            .collect();
        bvals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut shells: Vec<Vec<f64>> = Vec::new();
        for b in bvals {
            match shells.last_mut() {
                Some(shell) if b - shell[0] <= SHELL_TOLERANCE => shell.push(b),
                _ => shells.push(vec![b]),
            }
        }

        shells
            .iter()
            .map(|s| s.iter().sum::<f64>() / s.len() as f64)
            .collect()
    }

    /// More than one non-zero shell
    pub fn is_multishell(&self) -> bool {
        self.shell_bvalues().len() > 2
    }
}

//=============================================================================
// Images
//=============================================================================

/// 4D diffusion-weighted series with its gradient table
#[derive(Debug, Clone, PartialEq)]
pub struct DwiVolume {
    data: Vec<f64>,
    dims: Dims3,
    n_volumes: usize,
    geometry: Geometry,
    gradients: GradientTable,
}

impl DwiVolume {
    pub fn new(
        data: Vec<f64>,
        dims: Dims3,
        n_volumes: usize,
        gradients: GradientTable,
    ) -> Result<Self> {
        check_len(data.len(), n_voxels(dims) * n_volumes)?;
        if gradients.len() != n_volumes {
            return Err(Error::GradientTableMismatch {
                rows: gradients.len(),
                volumes: n_volumes,
            });
        }
        Ok(Self {
            data,
            dims,
            n_volumes,
            geometry: Geometry::default(),
            gradients,
        })
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn n_volumes(&self) -> usize {
        self.n_volumes
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn gradients(&self) -> &GradientTable {
        &self.gradients
    }

    /// Borrow volume `t`
    pub fn volume(&self, t: usize) -> &[f64] {
        let n = n_voxels(self.dims);
        &self.data[t * n..(t + 1) * n]
    }

    /// Voxelwise maximum across volumes
    pub fn max_over_volumes(&self) -> ScalarVolume {
        let n = n_voxels(self.dims);
        let mut out = vec![f64::NEG_INFINITY; n];
        for t in 0..self.n_volumes {
            for (o, &v) in out.iter_mut().zip(self.volume(t)) {
                if v > *o {
                    *o = v;
                }
            }
        }
        if self.n_volumes == 0 {
            out.fill(0.0);
        }
        ScalarVolume::from_parts(out, self.dims, self.geometry)
    }

    /// Mask of voxels whose maximum signal across volumes is positive
    pub fn positive_signal_mask(&self) -> BrainMask {
        let max = self.max_over_volumes();
        BrainMask::from_parts(mask_utils::threshold_above(max.data(), 0.0), self.dims, self.geometry)
    }

    /// Mean of the b=0 volumes (all volumes if none are b=0)
    pub fn mean_bzero(&self) -> ScalarVolume {
        let mut selected = self.gradients.bzero_volumes();
        if selected.is_empty() {
            selected = (0..self.n_volumes).collect();
        }
        let n = n_voxels(self.dims);
        let mut out = vec![0.0; n];
        for &t in &selected {
            for (o, &v) in out.iter_mut().zip(self.volume(t)) {
                *o += v;
            }
        }
        if !selected.is_empty() {
            let norm = selected.len() as f64;
            out.iter_mut().for_each(|v| *v /= norm);
        }
        ScalarVolume::from_parts(out, self.dims, self.geometry)
    }

    /// Divide every volume by `field` and multiply by `scale`
    ///
    /// Voxels where the field is not strictly positive are zeroed.
    pub fn corrected(&self, field: &ScalarVolume, scale: f64) -> Result<DwiVolume> {
        if field.dims() != self.dims {
            return Err(Error::GridMismatch { left: self.dims, right: field.dims() });
        }
        let n = n_voxels(self.dims);
        let f = field.data();
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let b = f[i % n];
                if b > 0.0 && b.is_finite() { v / b * scale } else { 0.0 }
            })
            .collect();
        Ok(DwiVolume {
            data,
            dims: self.dims,
            n_volumes: self.n_volumes,
            geometry: self.geometry,
            gradients: self.gradients.clone(),
        })
    }
}

/// Binary brain mask on the DWI spatial grid
#[derive(Debug, Clone, PartialEq)]
pub struct BrainMask {
    data: Vec<u8>,
    dims: Dims3,
    geometry: Geometry,
}

impl BrainMask {
    /// Any non-zero input value marks a voxel as inside
    pub fn new(data: Vec<u8>, dims: Dims3) -> Result<Self> {
        check_len(data.len(), n_voxels(dims))?;
        Ok(Self::from_parts(data, dims, Geometry::default()))
    }

    pub(crate) fn from_parts(data: Vec<u8>, dims: Dims3, geometry: Geometry) -> Self {
        let data = data.into_iter().map(|v| (v != 0) as u8).collect();
        Self { data, dims, geometry }
    }

    /// Binarise a float image: values above 0.5 are inside
    pub fn from_image(image: &ScalarVolume) -> Self {
        Self::from_parts(mask_utils::threshold_above(image.data(), 0.5), image.dims(), image.geometry)
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn count(&self) -> usize {
        mask_utils::count_voxels(&self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn check_grid(&self, other: &BrainMask) -> Result<()> {
        if self.dims != other.dims {
            return Err(Error::GridMismatch { left: self.dims, right: other.dims });
        }
        Ok(())
    }

    pub fn intersection_count(&self, other: &BrainMask) -> Result<usize> {
        self.check_grid(other)?;
        Ok(mask_utils::intersection_count(&self.data, &other.data))
    }

    /// Voxelwise AND
    pub fn intersect(&self, other: &BrainMask) -> Result<BrainMask> {
        self.check_grid(other)?;
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| a & b).collect();
        Ok(BrainMask { data, dims: self.dims, geometry: self.geometry })
    }

    pub fn eroded(&self, npass: usize) -> BrainMask {
        let (nx, ny, nz) = self.dims;
        BrainMask {
            data: mask_utils::erode_mask(&self.data, nx, ny, nz, npass),
            dims: self.dims,
            geometry: self.geometry,
        }
    }

    /// Largest connected component with its interior holes filled
    pub fn cleaned(&self) -> BrainMask {
        let (nx, ny, nz) = self.dims;
        let largest = mask_utils::largest_component(&self.data, nx, ny, nz);
        BrainMask {
            data: mask_utils::fill_holes(&largest, nx, ny, nz, usize::MAX),
            dims: self.dims,
            geometry: self.geometry,
        }
    }

    pub fn to_image(&self) -> ScalarVolume {
        ScalarVolume::from_parts(
            self.data.iter().map(|&v| v as f64).collect(),
            self.dims,
            self.geometry,
        )
    }
}

/// 3D scalar image: bias fields, tissue sums, brain-extraction inputs
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarVolume {
    data: Vec<f64>,
    dims: Dims3,
    geometry: Geometry,
}

/// Smooth multiplicative receive-field estimate
pub type BiasField = ScalarVolume;

/// Per-voxel sum of normalised tissue signal fractions
pub type TissueSumImage = ScalarVolume;

impl ScalarVolume {
    pub fn new(data: Vec<f64>, dims: Dims3) -> Result<Self> {
        check_len(data.len(), n_voxels(dims))?;
        Ok(Self::from_parts(data, dims, Geometry::default()))
    }

    pub(crate) fn from_parts(data: Vec<f64>, dims: Dims3, geometry: Geometry) -> Self {
        Self { data, dims, geometry }
    }

    pub fn filled(value: f64, dims: Dims3) -> Self {
        Self::from_parts(vec![value; n_voxels(dims)], dims, Geometry::default())
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Voxelwise product
    pub fn multiply(&self, other: &ScalarVolume) -> Result<ScalarVolume> {
        if self.dims != other.dims {
            return Err(Error::GridMismatch { left: self.dims, right: other.dims });
        }
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a * b).collect();
        Ok(Self::from_parts(data, self.dims, self.geometry))
    }

    pub fn scaled(&self, factor: f64) -> ScalarVolume {
        Self::from_parts(self.data.iter().map(|v| v * factor).collect(), self.dims, self.geometry)
    }
}

//=============================================================================
// Model outputs
//=============================================================================

/// Response function of one tissue: rows = shells, columns = zonal SH
/// coefficients (l = 0, 2, 4, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct TissueResponse {
    pub tissue: Tissue,
    pub coefficients: Vec<Vec<f64>>,
}

impl TissueResponse {
    pub fn new(tissue: Tissue, coefficients: Vec<Vec<f64>>) -> Self {
        Self { tissue, coefficients }
    }

    /// First shell, l=0 coefficient
    pub fn b0_l0(&self) -> Option<f64> {
        self.coefficients.first().and_then(|row| row.first()).copied()
    }
}

/// Per-voxel SH coefficients of one tissue's orientation distribution
#[derive(Debug, Clone, PartialEq)]
pub struct FodVolume {
    tissue: Tissue,
    data: Vec<f64>,
    dims: Dims3,
    n_coeffs: usize,
    geometry: Geometry,
}

impl FodVolume {
    pub fn new(tissue: Tissue, data: Vec<f64>, dims: Dims3, n_coeffs: usize) -> Result<Self> {
        check_len(data.len(), n_voxels(dims) * n_coeffs)?;
        Ok(Self { tissue, data, dims, n_coeffs, geometry: Geometry::default() })
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn tissue(&self) -> Tissue {
        self.tissue
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn n_coeffs(&self) -> usize {
        self.n_coeffs
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The l=0 coefficient image
    pub fn l0(&self) -> ScalarVolume {
        let n = n_voxels(self.dims);
        let data = if self.n_coeffs == 0 { vec![0.0; n] } else { self.data[..n].to_vec() };
        ScalarVolume::from_parts(data, self.dims, self.geometry)
    }
}

/// Per-tissue balance factors from the joint bias/intensity optimiser
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceFactors {
    factors: Vec<(Tissue, f64)>,
}

impl BalanceFactors {
    pub fn new(factors: Vec<(Tissue, f64)>) -> Self {
        Self { factors }
    }

    pub fn get(&self, tissue: Tissue) -> Option<f64> {
        self.factors.iter().find(|(t, _)| *t == tissue).map(|(_, f)| *f)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Tissue, f64)> {
        self.factors.iter()
    }
}
