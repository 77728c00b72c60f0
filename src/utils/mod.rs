//! Voxel-level helpers shared by the refinement loop

pub mod mask;

pub use mask::{
    count_voxels, erode_mask, fill_holes, intersection_count,
    largest_component, threshold_above,
};
