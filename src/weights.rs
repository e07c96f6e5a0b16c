//! Gaussian weight functions given by their moments.
//!
//! A weight with covariance `Σ` is evaluated as `exp(-0.5 * (w11 x² + 2 w12 xy + w22 y²))`
//! where `w_ij` are the entries of `Σ⁻¹`.

use thiserror::Error;

use crate::geometry::Quadrupole;

/// Second moment of a uniformly illuminated single pixel.
pub const PIXEL_VARIANCE: f64 = 1. / 12.;

/// Coefficient magnitude beyond which a kernel is considered diverged.
const MAX_WEIGHT: f64 = 1e6;

/// Moments below which a weight function is too narrow to be sampled at pixel centers.
const INTERPOLATION_LIMIT: f64 = 0.25;

/// Coefficients of the precision matrix of a Gaussian weight function.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeightKernel {
    /// Coefficient of `x²`.
    pub w11: f64,
    /// Half the coefficient of `xy`.
    pub w12: f64,
    /// Coefficient of `y²`.
    pub w22: f64,
}

impl WeightKernel {
    /// Weights every pixel equally.
    pub const UNIFORM: Self = Self {
        w11: 0.,
        w12: 0.,
        w22: 0.,
    };

    /// Quadratic form `w11 x² + 2 w12 xy + w22 y²` at offset `(x, y)`.
    #[inline]
    pub fn exponent(&self, x: f64, y: f64) -> f64 {
        x * x * self.w11 + 2. * x * y * self.w12 + y * y * self.w22
    }

    /// Whether any coefficient is too large to produce useful weights.
    pub fn is_diverged(&self) -> bool {
        self.w11.abs() > MAX_WEIGHT || self.w12.abs() > MAX_WEIGHT || self.w22.abs() > MAX_WEIGHT
    }

    /// Determinant of the covariance this kernel is the inverse of.
    ///
    /// NaN if the kernel is not a proper Gaussian, e.g. [`UNIFORM`](Self::UNIFORM).
    pub fn covariance_determinant(&self) -> f64 {
        let precision_det = self.w11 * self.w22 - self.w12 * self.w12;
        if precision_det > 0. {
            1. / precision_det
        } else {
            f64::NAN
        }
    }

    /// The precision matrix written as moments, so it can be added and inverted again.
    pub(crate) fn as_quadrupole(&self) -> Quadrupole {
        Quadrupole::new(self.w11, self.w22, self.w12)
    }
}

/// A successfully inverted covariance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Weights {
    /// Determinant of the covariance that was actually inverted.
    pub determinant: f64,
    /// The inverted covariance.
    pub kernel: WeightKernel,
}

/// How to treat a (nearly) singular covariance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Degeneracy {
    /// Broaden both principal axes by a single pixel's variance and invert that.
    #[default]
    Inflate,
    /// Report the covariance as degenerate.
    Reject,
}

/// The covariance could not be inverted.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("degenerate covariance: determinant={determinant:.6e}")]
pub struct DegenerateCovariance {
    /// The offending determinant; NaN if the input contained NaN.
    pub determinant: f64,
}

/// Compute the weight kernel of a Gaussian with covariance `sigma`.
///
/// Covariances with a determinant below `f32::EPSILON` are degenerate, e.g. objects that are
/// only nonzero on a line. With [`Degeneracy::Inflate`] they are broadened by
/// [`PIXEL_VARIANCE`] along both principal axes, which always yields a valid kernel.
pub fn solve_weights(
    sigma: &Quadrupole,
    degeneracy: Degeneracy,
) -> Result<Weights, DegenerateCovariance> {
    if sigma.is_nan() {
        return Err(DegenerateCovariance {
            determinant: f64::NAN,
        });
    }

    let determinant = sigma.determinant();
    if determinant.is_nan() || determinant < f32::EPSILON as f64 {
        return match degeneracy {
            Degeneracy::Reject => Err(DegenerateCovariance { determinant }),
            Degeneracy::Inflate => {
                let inflated = sigma.inflate_axes(PIXEL_VARIANCE);
                Ok(invert(&inflated, inflated.determinant()))
            }
        };
    }

    Ok(invert(sigma, determinant))
}

fn invert(sigma: &Quadrupole, determinant: f64) -> Weights {
    Weights {
        determinant,
        kernel: WeightKernel {
            w11: sigma.iyy / determinant,
            w12: -sigma.ixy / determinant,
            w22: sigma.ixx / determinant,
        },
    }
}

/// Whether a weight function is narrow enough to need sub-pixel sampling.
pub fn should_interpolate(sigma: &Quadrupole, determinant: f64) -> bool {
    sigma.ixx < INTERPOLATION_LIMIT
        || sigma.iyy < INTERPOLATION_LIMIT
        || determinant < INTERPOLATION_LIMIT * INTERPOLATION_LIMIT
}
