//! Error analysis of an elliptical Gaussian fit.
//!
//! Following "Numerical Recipes in C", section 15.5, the second-derivative terms of the
//! least-squares fit are ignored, so the Fisher matrix only depends on the best-fit
//! parameters and the background noise. Its components are calculated analytically.
//!
//! Rows and columns are ordered as amplitude, `ixx`, `iyy`, `ixy`.

use std::f64::consts::PI;

use nalgebra::Matrix4;
use thiserror::Error;

use crate::geometry::Quadrupole;

/// Reasons why no error estimate exists.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FisherError {
    /// The moments are (nearly) singular.
    #[error("determinant {0:.6e} is too small to calculate the Fisher matrix")]
    Degenerate(f64),
    /// The background variance is unknown or not positive.
    #[error("background variance must be positive and finite (saw {0})")]
    InvalidVariance(f64),
    /// The Fisher matrix cannot be inverted.
    #[error("Fisher matrix is singular")]
    Singular,
}

/// Fisher matrix of a Gaussian with amplitude `amplitude` and moments `moments` on a
/// background with per-pixel variance `background_variance`.
pub fn fisher_matrix(
    amplitude: f64,
    moments: &Quadrupole,
    background_variance: f64,
) -> Result<Matrix4<f64>, FisherError> {
    let Quadrupole { ixx, iyy, ixy } = *moments;
    let a = amplitude;

    let d = moments.determinant();
    if d.is_nan() || d <= f64::EPSILON {
        return Err(FisherError::Degenerate(d));
    }
    if !background_variance.is_finite() || background_variance <= 0. {
        return Err(FisherError::InvalidVariance(background_variance));
    }

    // normalization
    let f = PI * d.sqrt() / background_variance;

    let mut fisher = Matrix4::zeros();

    let fac = f * a / (4. * d);
    fisher[(0, 0)] = f;
    fisher[(0, 1)] = fac * iyy;
    fisher[(0, 2)] = fac * ixx;
    fisher[(0, 3)] = -fac * 2. * ixy;

    let fac = 3. * f * a * a / (16. * d * d);
    fisher[(1, 1)] = fac * iyy * iyy;
    fisher[(2, 2)] = fac * ixx * ixx;
    fisher[(3, 3)] = fac * 4. * (ixy * ixy + d / 3.);
    fisher[(1, 2)] = fisher[(3, 3)] / 4.;
    fisher[(1, 3)] = fac * (-2. * iyy * ixy);
    fisher[(2, 3)] = fac * (-2. * ixx * ixy);

    fisher.fill_lower_triangle_with_upper_triangle();
    Ok(fisher)
}

/// Covariance of (amplitude, `ixx`, `iyy`, `ixy`): the inverse of [`fisher_matrix`].
pub fn covariance(
    amplitude: f64,
    moments: &Quadrupole,
    background_variance: f64,
) -> Result<Matrix4<f64>, FisherError> {
    fisher_matrix(amplitude, moments, background_variance)?
        .try_inverse()
        .ok_or(FisherError::Singular)
}
