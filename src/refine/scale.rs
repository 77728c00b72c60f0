//! Intensity scale calibration
//!
//! The joint normaliser balances tissue densities relative to each other but
//! leaves the absolute level arbitrary. The DWI is rescaled so that the b=0
//! signal of pure CSF equals the requested reference intensity:
//!
//! ```text
//! scale = reference * sqrt(4*pi) / (csf_b0_l0 / csf_balance)
//! ```
//!
//! `csf_b0_l0` is the l=0 coefficient of the CSF response at b=0 and
//! `csf_balance` the CSF balance factor reported by the normaliser. The
//! `sqrt(4*pi)` term converts an l=0 SH coefficient into an amplitude.

use std::f64::consts::PI;

use crate::error::{Error, Result};

/// Multiplicative DWI intensity scale for one iteration
pub fn compute_scale(reference_intensity: f64, csf_b0_l0: f64, csf_balance: f64) -> Result<f64> {
    if !(reference_intensity > 0.0) || !reference_intensity.is_finite() {
        return Err(Error::InvalidReference(reference_intensity));
    }
    check_positive("CSF response b=0 l=0 coefficient", csf_b0_l0)?;
    check_positive("CSF balance factor", csf_balance)?;

    let csf_signal = csf_b0_l0 / csf_balance;
    Ok(reference_intensity * (4.0 * PI).sqrt() / csf_signal)
}

fn check_positive(what: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidCalibration(format!("{} must be finite and positive, got {}", what, value)))
    }
}
