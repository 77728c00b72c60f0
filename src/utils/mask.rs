//! Binary mask utilities
//!
//! Morphology and connected-component helpers operating on flattened 3D
//! masks in Fortran (column-major) order: index = x + y*nx + z*nx*ny.

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

#[inline(always)]
fn coords(idx: usize, nx: usize, ny: usize) -> (usize, usize, usize) {
    let k = idx / (nx * ny);
    let rem = idx % (nx * ny);
    (rem % nx, rem / nx, k)
}

/// Number of non-zero voxels
pub fn count_voxels(mask: &[u8]) -> usize {
    mask.iter().filter(|&&m| m != 0).count()
}

/// Number of voxels set in both masks
pub fn intersection_count(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).filter(|(&x, &y)| x != 0 && y != 0).count()
}

/// Binary mask of voxels strictly above `threshold`
pub fn threshold_above(data: &[f64], threshold: f64) -> Vec<u8> {
    data.iter().map(|&v| if v > threshold { 1 } else { 0 }).collect()
}

/// Erode mask by `npass` voxels (6-connected)
///
/// Voxels on the volume boundary are always removed.
pub fn erode_mask(mask: &[u8], nx: usize, ny: usize, nz: usize, npass: usize) -> Vec<u8> {
    let mut current = mask.to_vec();

    for _ in 0..npass {
        let mut eroded = vec![0u8; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    if current[idx] == 0 {
                        continue;
                    }
                    if i == 0 || i == nx - 1 || j == 0 || j == ny - 1 || k == 0 || k == nz - 1 {
                        continue;
                    }

                    let all_neighbors = current[idx - 1] != 0
                        && current[idx + 1] != 0
                        && current[idx - nx] != 0
                        && current[idx + nx] != 0
                        && current[idx - nx * ny] != 0
                        && current[idx + nx * ny] != 0;

                    eroded[idx] = if all_neighbors { 1 } else { 0 };
                }
            }
        }
        current = eroded;
    }

    current
}

/// Flood fill the 6-connected component of voxels equal to `foreground`
/// (non-zero when true, zero when false) that contains `start`.
fn flood_fill_component(
    mask: &[u8],
    visited: &mut [bool],
    start: usize,
    foreground: bool,
    nx: usize, ny: usize, nz: usize,
) -> Vec<usize> {
    let matches = |v: u8| (v != 0) == foreground;
    let mut component = Vec::new();
    let mut stack = vec![start];

    while let Some(idx) = stack.pop() {
        if visited[idx] || !matches(mask[idx]) {
            continue;
        }

        visited[idx] = true;
        component.push(idx);

        let (i, j, k) = coords(idx, nx, ny);
        let mut push = |n: usize| {
            if !visited[n] && matches(mask[n]) {
                stack.push(n);
            }
        };
        if i > 0 { push(idx3d(i - 1, j, k, nx, ny)); }
        if i + 1 < nx { push(idx3d(i + 1, j, k, nx, ny)); }
        if j > 0 { push(idx3d(i, j - 1, k, nx, ny)); }
        if j + 1 < ny { push(idx3d(i, j + 1, k, nx, ny)); }
        if k > 0 { push(idx3d(i, j, k - 1, nx, ny)); }
        if k + 1 < nz { push(idx3d(i, j, k + 1, nx, ny)); }
    }

    component
}

/// Keep only the largest 6-connected foreground component
///
/// Ties keep the component found first in memory order.
pub fn largest_component(mask: &[u8], nx: usize, ny: usize, nz: usize) -> Vec<u8> {
    let n_total = nx * ny * nz;
    let mut visited = vec![false; n_total];
    let mut best: Vec<usize> = Vec::new();

    for idx in 0..n_total {
        if mask[idx] != 0 && !visited[idx] {
            let component = flood_fill_component(mask, &mut visited, idx, true, nx, ny, nz);
            if component.len() > best.len() {
                best = component;
            }
        }
    }

    let mut result = vec![0u8; n_total];
    for idx in best {
        result[idx] = 1;
    }
    result
}

/// Fill holes in a binary mask
///
/// Fills connected components of zeros that do not touch the volume
/// boundary and hold at most `max_hole_size` voxels. Uses 6-connectivity.
pub fn fill_holes(mask: &[u8], nx: usize, ny: usize, nz: usize, max_hole_size: usize) -> Vec<u8> {
    let n_total = nx * ny * nz;
    let mut result = mask.to_vec();
    let mut visited = vec![false; n_total];

    for idx in 0..n_total {
        if mask[idx] == 0 && !visited[idx] {
            let component = flood_fill_component(mask, &mut visited, idx, false, nx, ny, nz);

            let touches_boundary = component.iter().any(|&cidx| {
                let (i, j, k) = coords(cidx, nx, ny);
                i == 0 || i == nx - 1 || j == 0 || j == ny - 1 || k == 0 || k == nz - 1
            });

            if !touches_boundary && component.len() <= max_hole_size {
                for cidx in component {
                    result[cidx] = 1;
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_mask(
        nx: usize, ny: usize, nz: usize,
        center_x: f64, center_y: f64, center_z: f64,
        radius: f64,
    ) -> Vec<u8> {
        let mut mask = vec![0u8; nx * ny * nz];
        let r2 = radius * radius;

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let dx = i as f64 - center_x;
                    let dy = j as f64 - center_y;
                    let dz = k as f64 - center_z;
                    if dx * dx + dy * dy + dz * dz <= r2 {
                        mask[idx3d(i, j, k, nx, ny)] = 1;
                    }
                }
            }
        }

        mask
    }

    #[test]
    fn test_erode_single_pass() {
        // 3x3x3 block inside a 5x5x5 volume erodes to its centre voxel
        let mut mask = vec![0u8; 125];
        for k in 1..4 {
            for j in 1..4 {
                for i in 1..4 {
                    mask[idx3d(i, j, k, 5, 5)] = 1;
                }
            }
        }
        let eroded = erode_mask(&mask, 5, 5, 5, 1);
        assert_eq!(count_voxels(&eroded), 1);
        assert_eq!(eroded[idx3d(2, 2, 2, 5, 5)], 1);
    }

    #[test]
    fn test_erode_zero_passes_is_identity() {
        let mask = sphere_mask(8, 8, 8, 4.0, 4.0, 4.0, 2.5);
        assert_eq!(erode_mask(&mask, 8, 8, 8, 0), mask);
    }

    #[test]
    fn test_erode_removes_volume_boundary() {
        let mask = vec![1u8; 27];
        let eroded = erode_mask(&mask, 3, 3, 3, 1);
        assert_eq!(count_voxels(&eroded), 1);
    }

    #[test]
    fn test_largest_component() {
        let nx = 10;
        let mut mask = vec![0u8; nx * nx * nx];
        // big blob: 2x2x2, small blob: single voxel
        for k in 1..3 {
            for j in 1..3 {
                for i in 1..3 {
                    mask[idx3d(i, j, k, nx, nx)] = 1;
                }
            }
        }
        mask[idx3d(7, 7, 7, nx, nx)] = 1;

        let largest = largest_component(&mask, nx, nx, nx);
        assert_eq!(count_voxels(&largest), 8);
        assert_eq!(largest[idx3d(7, 7, 7, nx, nx)], 0);
    }

    #[test]
    fn test_largest_component_empty() {
        let mask = vec![0u8; 64];
        assert_eq!(count_voxels(&largest_component(&mask, 4, 4, 4)), 0);
    }

    #[test]
    fn test_fill_holes_interior_only() {
        let mut mask = sphere_mask(9, 9, 9, 4.0, 4.0, 4.0, 3.5);
        let centre = idx3d(4, 4, 4, 9, 9);
        mask[centre] = 0;
        let before = count_voxels(&mask);

        let filled = fill_holes(&mask, 9, 9, 9, usize::MAX);
        assert_eq!(filled[centre], 1);
        assert_eq!(count_voxels(&filled), before + 1);
        // Background touching the boundary stays empty
        assert_eq!(filled[0], 0);
    }

    #[test]
    fn test_fill_holes_respects_size_limit() {
        let mut mask = sphere_mask(9, 9, 9, 4.0, 4.0, 4.0, 3.5);
        mask[idx3d(4, 4, 4, 9, 9)] = 0;
        mask[idx3d(5, 4, 4, 9, 9)] = 0;
        let filled = fill_holes(&mask, 9, 9, 9, 1);
        assert_eq!(filled, mask);
    }

    #[test]
    fn test_counts_and_threshold() {
        let a = threshold_above(&[0.0, 0.5, 0.6, 1.0], 0.5);
        assert_eq!(a, vec![0, 0, 1, 1]);
        let b = vec![1u8, 0, 1, 0];
        assert_eq!(intersection_count(&a, &b), 1);
        assert_eq!(count_voxels(&b), 2);
    }
}
