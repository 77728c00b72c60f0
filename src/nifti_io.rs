//! NIfTI file I/O
//!
//! Loads and saves 3D and 4D NIfTI-1 images (`.nii` and `.nii.gz`) and
//! converts them to the typed containers of [`crate::volume`]. Images are
//! exchanged with the external tools through these files.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{Error, Result};
use crate::volume::{
    BrainMask, Dims3, DwiVolume, FodVolume, Geometry, GradientTable, ScalarVolume, Tissue,
};

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Volume data as f64, Fortran order, volumes stacked along the 4th axis
    pub data: Vec<f64>,
    /// Spatial dimensions (nx, ny, nz)
    pub dims: Dims3,
    /// Size of the 4th axis (1 for 3D images)
    pub n_volumes: usize,
    /// Voxel size and affine
    pub geometry: Geometry,
    /// Data scaling slope
    pub scl_slope: f64,
    /// Data scaling intercept
    pub scl_inter: f64,
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn read_object(bytes: &[u8]) -> std::result::Result<InMemNiftiObject, String> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decoder = GzDecoder::new(Cursor::new(bytes));
            let mut decompressed = Vec::new();
            let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            format!("Failed to read gzipped NIfTI: {} ({})", e, info)
        })
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| format!("Failed to read NIfTI: {} ({})", e, info))
    }
}

/// Load a 3D or 4D NIfTI image from bytes
///
/// Supports both .nii and .nii.gz files (gzip is auto-detected). Axes
/// beyond the 4th are folded into the 4th.
pub fn load_nifti(bytes: &[u8]) -> std::result::Result<NiftiData, String> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(format!("Expected at least 3D volume, got {}D", ndim));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = get_affine(header);

    let volume = obj.into_volume();
    let array: Array<f64, _> = volume
        .into_ndarray()
        .map_err(|e| format!("Failed to convert to ndarray: {}", e))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(format!("Expected at least 3D array, got {}D", shape.len()));
    }

    let (dim0, dim1, dim2) = (shape[0], shape[1], shape[2]);
    let n_volumes: usize = shape[3..].iter().product();

    // Iterating the transposed view yields Fortran order: x fastest, then
    // y, z, then volume
    let data: Vec<f64> = array.t().iter().copied().collect();

    Ok(NiftiData {
        data,
        dims: (dim0, dim1, dim2),
        n_volumes,
        geometry: Geometry { voxel_size, affine },
        scl_slope,
        scl_inter,
    })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Save data as NIfTI bytes
///
/// Writes an uncompressed single-file NIfTI-1 image with float32 voxels.
/// A 4D header is written when `n_volumes > 1`.
pub fn save_nifti(
    data: &[f64],
    dims: Dims3,
    n_volumes: usize,
    geometry: &Geometry,
) -> std::result::Result<Vec<u8>, String> {
    use std::io::Write;

    let (nx, ny, nz) = dims;
    let expected = nx * ny * nz * n_volumes;
    if data.len() != expected {
        return Err(format!("Data holds {} values, header needs {}", data.len(), expected));
    }
    for &d in &[nx, ny, nz, n_volumes] {
        if d > i16::MAX as usize {
            return Err(format!("Dimension {} exceeds NIfTI-1 limit", d));
        }
    }
    let (vsx, vsy, vsz) = geometry.voxel_size;
    let affine = &geometry.affine;

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim = if n_volumes > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, n_volumes as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header).map_err(|e| format!("Write header failed: {}", e))?;
    buffer.write_all(&[0u8; 4]).map_err(|e| format!("Write extension failed: {}", e))?;
    for &val in data {
        buffer
            .write_all(&(val as f32).to_le_bytes())
            .map_err(|e| format!("Write data failed: {}", e))?;
    }

    Ok(buffer)
}

/// Save data as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: Dims3,
    n_volumes: usize,
    geometry: &Geometry,
) -> std::result::Result<Vec<u8>, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(data, dims, n_volumes, geometry)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| format!("Gzip compression failed: {}", e))?;
    encoder.finish().map_err(|e| format!("Gzip finish failed: {}", e))
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> std::result::Result<NiftiData, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e))?;
    load_nifti(&bytes)
}

/// Save NIfTI data to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    dims: Dims3,
    n_volumes: usize,
    geometry: &Geometry,
) -> std::result::Result<(), String> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(data, dims, n_volumes, geometry)?
    } else {
        save_nifti(data, dims, n_volumes, geometry)?
    };

    std::fs::write(path, &bytes)
        .map_err(|e| format!("Failed to write file '{}': {}", path.display(), e))
}

//=============================================================================
// Typed image files
//=============================================================================

fn read_checked(path: &Path) -> Result<NiftiData> {
    read_nifti_file(path).map_err(Error::Nifti)
}

/// Read a DWI series; the gradient table comes from a separate source
pub fn read_dwi(path: &Path, gradients: GradientTable) -> Result<DwiVolume> {
    let nii = read_checked(path)?;
    Ok(DwiVolume::new(nii.data, nii.dims, nii.n_volumes, gradients)?.with_geometry(nii.geometry))
}

pub fn write_dwi(path: &Path, dwi: &DwiVolume) -> Result<()> {
    save_nifti_to_file(path, dwi.data(), dwi.dims(), dwi.n_volumes(), dwi.geometry())
        .map_err(Error::Nifti)
}

/// Read a 3D image; only the first volume of a 4D file is kept
pub fn read_scalar(path: &Path) -> Result<ScalarVolume> {
    let mut nii = read_checked(path)?;
    let (nx, ny, nz) = nii.dims;
    nii.data.truncate(nx * ny * nz);
    Ok(ScalarVolume::new(nii.data, nii.dims)?.with_geometry(nii.geometry))
}

pub fn write_scalar(path: &Path, image: &ScalarVolume) -> Result<()> {
    save_nifti_to_file(path, image.data(), image.dims(), 1, image.geometry()).map_err(Error::Nifti)
}

/// Read a mask image; values above 0.5 are inside
pub fn read_mask(path: &Path) -> Result<BrainMask> {
    Ok(BrainMask::from_image(&read_scalar(path)?))
}

pub fn write_mask(path: &Path, mask: &BrainMask) -> Result<()> {
    write_scalar(path, &mask.to_image())
}

pub fn read_fod(path: &Path, tissue: Tissue) -> Result<FodVolume> {
    let nii = read_checked(path)?;
    Ok(FodVolume::new(tissue, nii.data, nii.dims, nii.n_volumes)?.with_geometry(nii.geometry))
}

pub fn write_fod(path: &Path, fod: &FodVolume) -> Result<()> {
    save_nifti_to_file(path, fod.data(), fod.dims(), fod.n_coeffs(), fod.geometry())
        .map_err(Error::Nifti)
}
