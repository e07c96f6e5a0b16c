//! Adaptive moments fitting and main interface.

use std::f64::consts::PI;

use log::{debug, info, trace};
use nalgebra::{Matrix4, Point2};

use crate::accumulate::{AccumulateError, Mode, RawMoments, Scan, accumulate};
use crate::error::MomentsError;
use crate::fisher;
use crate::geometry::{PixelBox, Quadrupole};
use crate::image::{PixelSource, VarianceSource};
use crate::weights::{
    Degeneracy, PIXEL_VARIANCE, WeightKernel, Weights, should_interpolate, solve_weights,
};

/// Moments of the weight function in the first iteration.
const INITIAL_WEIGHT: Quadrupole = Quadrupole::circular(1.5);
/// Range the allowed centroid shift is clamped into.
const SHIFT_RANGE: (f64, f64) = (2., 10.);
/// Previous-iteration placeholder that can never pass the convergence test.
const UNSET: f64 = 1e6;

/// Outcomes of a fit that are stored alongside the measurement.
///
/// Flags are only ever added while fitting; the single exception is `unweighted`, which is
/// replaced by `unweighted_bad` if the unweighted moments are unusable as well.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FitFlags {
    /// General failure flag, set if anything went wrong.
    pub failure: bool,
    /// Both weighted and unweighted moments were invalid.
    pub unweighted_bad: bool,
    /// Weighted moments converged to an invalid value; using unweighted moments.
    pub unweighted: bool,
    /// Centroid shifted by more than the maximum allowed amount.
    pub shift: bool,
    /// Too many iterations.
    pub max_iter: bool,
}

impl FitFlags {
    fn new(outcome: FitOutcome, shift: bool, max_iter: bool, covariance_failed: bool) -> Self {
        Self {
            failure: outcome != FitOutcome::Converged || shift || max_iter || covariance_failed,
            unweighted_bad: outcome == FitOutcome::UnweightedBad,
            unweighted: outcome == FitOutcome::Unweighted,
            shift,
            max_iter,
        }
    }
}

/// Terminal state of the adaptive iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitOutcome {
    /// The shape of the weighted object stopped changing.
    Converged,
    /// The iteration cap was hit; the last weight function is reported.
    MaxIter,
    /// The weighted fit failed and the unweighted moments are reported instead.
    Unweighted,
    /// Neither weighted nor unweighted moments could be measured.
    UnweightedBad,
}

/// Result of [`AdaptiveMoments::measure`].
///
/// Positions are given in the parent frame of the measured image.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeResult {
    /// Centroid column.
    pub x: f64,
    /// Centroid row.
    pub y: f64,
    /// Second moment along x.
    pub xx: f64,
    /// Second moment along y.
    pub yy: f64,
    /// Cross moment.
    pub xy: f64,
    /// Amplitude of the best-fit Gaussian.
    pub i0: f64,
    /// Fourth moment used in some shear estimators.
    pub xy4: f64,
    /// Integral of the best-fit Gaussian.
    pub flux: f64,
    /// Uncertainty of `flux`.
    pub flux_sigma: f64,
    /// Uncertainty of `i0`.
    pub i0_sigma: f64,
    /// Uncertainty of `xx`.
    pub xx_sigma: f64,
    /// Uncertainty of `yy`.
    pub yy_sigma: f64,
    /// Uncertainty of `xy`.
    pub xy_sigma: f64,
    /// Covariance of (`i0`, `xx`, `yy`, `xy`), available for converged fits on images with a
    /// known variance.
    pub covariance: Option<Matrix4<f64>>,
    /// How the fit ended.
    pub outcome: FitOutcome,
    /// Problems encountered while fitting.
    pub flags: FitFlags,
}

impl ShapeResult {
    /// The measured moments.
    pub fn quadrupole(&self) -> Quadrupole {
        Quadrupole::new(self.xx, self.yy, self.xy)
    }

    /// The measured centroid in the parent frame.
    pub fn center(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// Result of [`AdaptiveMoments::fixed_moments_flux`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FluxResult {
    /// Integral of the aperture-matched Gaussian.
    pub flux: f64,
    /// Uncertainty of `flux`; NaN without a known variance.
    pub flux_sigma: f64,
}

impl FluxResult {
    const NAN: Self = Self {
        flux: f64::NAN,
        flux_sigma: f64::NAN,
    };
}

/// State carried from one iteration to the next.
#[derive(Clone, Debug)]
struct IterationState {
    /// Moments of the current weight function.
    sigma_w: Quadrupole,
    /// Kernel used in the previous iteration.
    kernel: Option<WeightKernel>,
    e1_old: f64,
    e2_old: f64,
    sigma11_ow_old: f64,
    /// Sample on a sub-pixel grid. Stays set once switched on.
    interpolate: bool,
    iteration: usize,
}

impl IterationState {
    fn new() -> Self {
        Self {
            sigma_w: INITIAL_WEIGHT,
            kernel: None,
            e1_old: UNSET,
            e2_old: UNSET,
            sigma11_ow_old: UNSET,
            interpolate: false,
            iteration: 0,
        }
    }

    /// Pick the kernel for this iteration.
    ///
    /// When interpolation switches on after the first iteration, the previous kernel is
    /// measured again on the finer grid. Returns whether this iteration is such a repeat,
    /// which does not count against the iteration cap.
    fn choose_kernel(&mut self, weights: &Weights) -> (WeightKernel, bool) {
        let mut kernel = weights.kernel;
        let mut repeat = false;

        if !self.interpolate && should_interpolate(&self.sigma_w, weights.determinant) {
            self.interpolate = true;
            if let Some(previous) = self.kernel.filter(|_| self.iteration > 0) {
                kernel = previous;
                self.sigma11_ow_old = UNSET;
                repeat = true;
            }
        }

        self.kernel = Some(kernel);
        (kernel, repeat)
    }

    fn has_converged(&self, sigma_ow: &Quadrupole, tol1: f64, tol2: f64) -> bool {
        let (e1, e2) = sigma_ow.ellipticity();
        self.iteration > 0
            && (e1 - self.e1_old).abs() < tol1
            && (e2 - self.e2_old).abs() < tol1
            && (sigma_ow.ixx / self.sigma11_ow_old - 1.).abs() < tol2
    }

    fn remember(&mut self, sigma_ow: &Quadrupole) {
        (self.e1_old, self.e2_old) = sigma_ow.ellipticity();
        self.sigma11_ow_old = sigma_ow.ixx;
    }
}

/// Estimate the weight function matching the object.
///
/// The product of two Gaussians is a Gaussian whose inverse covariance is the sum of the
/// factors' inverse covariances. Subtracting the kernel's precision from that of the
/// weighted object therefore estimates the object's own covariance, assuming the object is
/// roughly Gaussian.
fn next_weight_covariance(sigma_ow: &Quadrupole, kernel: &WeightKernel) -> Option<Quadrupole> {
    let object_weighted = match solve_weights(sigma_ow, Degeneracy::Inflate) {
        Ok(weights) => weights.kernel.as_quadrupole(),
        Err(err) => {
            debug!("Weighted object moments are unusable: {err}.");
            return None;
        }
    };
    let precision = Quadrupole::new(
        object_weighted.ixx - kernel.w11,
        object_weighted.iyy - kernel.w22,
        object_weighted.ixy - kernel.w12,
    );

    // a singular difference means the object is not Gaussian-like; do not broaden it
    let next = match solve_weights(&precision, Degeneracy::Reject) {
        Ok(weights) => weights.kernel.as_quadrupole(),
        Err(err) => {
            debug!("Product-of-Gaussians estimate failed: {err}.");
            return None;
        }
    };

    if next.ixx <= 0. || next.iyy <= 0. {
        debug!("Estimated weight function {next:?} is not positive.");
        return None;
    }
    Some(next)
}

/// What the iteration ended with, before any fallback.
enum Terminal {
    Converged,
    MaxIter,
    Fallback,
}

/// Everything the solver determined, in image-local coordinates.
#[derive(Clone, Debug)]
struct Fit {
    outcome: FitOutcome,
    moments: Quadrupole,
    i0: f64,
    xy4: f64,
    centroid: (f64, f64),
    shift: bool,
    max_iter: bool,
    /// Iterations counted against `max_iter`.
    iterations: usize,
    /// Weighted accumulations, including repeats on the finer grid.
    passes: usize,
}

/// The central struct of this library.
///
/// Holds the measurement options; use the `with_*` functions to change them from their
/// defaults. See the crate-level documentation for details.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveMoments {
    /// Subtracted from every pixel.
    background: f64,
    /// Maximum number of iterations.
    max_iter: usize,
    /// Convergence tolerance for the ellipticities.
    tol1: f64,
    /// Relative convergence tolerance for `xx`.
    tol2: f64,
    /// Centroid shift beyond which the `shift` flag is set, clamped into `[2, 10]`.
    max_shift: f64,
    /// Cap on the half-size of the pixel window.
    max_radius: f64,
}

impl Default for AdaptiveMoments {
    fn default() -> Self {
        Self {
            background: 0.,
            max_iter: 100,
            tol1: 1e-5,
            tol2: 1e-4,
            max_shift: 0.,
            max_radius: 1000.,
        }
    }
}

impl AdaptiveMoments {
    /// Create a new instance using default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the background level.
    pub fn with_background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set the ellipticity convergence tolerance.
    pub fn with_tol1(mut self, tol1: f64) -> Self {
        self.tol1 = tol1;
        self
    }

    /// Set the relative `xx` convergence tolerance.
    pub fn with_tol2(mut self, tol2: f64) -> Self {
        self.tol2 = tol2;
        self
    }

    /// Set the centroid shift that triggers the `shift` flag.
    pub fn with_max_shift(mut self, max_shift: f64) -> Self {
        self.max_shift = max_shift;
        self
    }

    /// Set the cap on the half-size of the examined pixel window.
    pub fn with_max_radius(mut self, max_radius: f64) -> Self {
        self.max_radius = max_radius;
        self
    }

    fn validate(&self) -> Result<(), MomentsError> {
        if self.max_iter == 0 {
            return Err(MomentsError::ZeroMaxIter);
        }
        for (name, value) in [("tol1", self.tol1), ("tol2", self.tol2)] {
            if !value.is_finite() || value < 0. {
                return Err(MomentsError::InvalidOption { name, value });
            }
        }
        if !self.background.is_finite() {
            return Err(MomentsError::InvalidOption {
                name: "background",
                value: self.background,
            });
        }
        if self.max_shift.is_nan() {
            return Err(MomentsError::InvalidOption {
                name: "max_shift",
                value: self.max_shift,
            });
        }
        if self.max_radius.is_nan() || self.max_radius <= 0. {
            return Err(MomentsError::InvalidOption {
                name: "max_radius",
                value: self.max_radius,
            });
        }
        Ok(())
    }

    /// Convert a parent-frame center to image-local coordinates.
    fn local_center<S: PixelSource>(
        &self,
        source: &S,
        center: Point2<f64>,
    ) -> Result<(f64, f64), MomentsError> {
        self.validate()?;
        if !center.x.is_finite() || !center.y.is_finite() {
            return Err(MomentsError::NonFiniteCenter {
                x: center.x,
                y: center.y,
            });
        }
        let (x0, y0) = source.origin();
        Ok((center.x - x0 as f64, center.y - y0 as f64))
    }

    /// Measure the adaptive moments of the object near `center`.
    ///
    /// `center` is given in the parent frame of `source`. An `Err` is only returned for
    /// unusable options or a non-finite center; all problems with the object itself are
    /// reported through [`ShapeResult::flags`].
    pub fn measure<S: PixelSource>(
        &self,
        source: &S,
        center: Point2<f64>,
    ) -> Result<ShapeResult, MomentsError> {
        let (xcen, ycen) = self.local_center(source, center)?;
        let fit = self.fit(source, xcen, ycen);
        debug!(
            "Adaptive moments at ({}, {}) finished with {:?} after {} iterations ({} passes).",
            center.x, center.y, fit.outcome, fit.iterations, fit.passes
        );

        let mut covariance_failed = false;
        let mut covariance = None;
        if fit.outcome == FitOutcome::Converged && <S::Variance as VarianceSource>::PROVIDED {
            // N.b. this includes the object's own noise
            let ix = (fit.centroid.0 + 0.5).floor() as i64;
            let iy = (fit.centroid.1 + 0.5).floor() as i64;
            let variance = source.variance_at(ix, iy);
            match fisher::covariance(fit.i0, &fit.moments, variance) {
                Ok(c) => covariance = Some(c),
                Err(err) => {
                    debug!("No covariance at ({ix}, {iy}): {err}.");
                    covariance_failed = true;
                }
            }
        }

        let flags = FitFlags::new(fit.outcome, fit.shift, fit.max_iter, covariance_failed);
        let sigma = |k: usize| covariance.map_or(f64::NAN, |c: Matrix4<f64>| c[(k, k)].sqrt());
        let scale = fit.moments.flux_scale();
        let (x0, y0) = source.origin();

        Ok(ShapeResult {
            x: fit.centroid.0 + x0 as f64,
            y: fit.centroid.1 + y0 as f64,
            xx: fit.moments.ixx,
            yy: fit.moments.iyy,
            xy: fit.moments.ixy,
            i0: fit.i0,
            xy4: fit.xy4,
            flux: fit.i0 * scale,
            flux_sigma: sigma(0) * scale,
            i0_sigma: sigma(0),
            xx_sigma: sigma(1),
            yy_sigma: sigma(2),
            xy_sigma: sigma(3),
            covariance,
            outcome: fit.outcome,
            flags,
        })
    }

    /// Measure several objects of the same image one after another.
    pub fn measure_all<S: PixelSource>(
        &self,
        source: &S,
        centers: &[Point2<f64>],
    ) -> Vec<Result<ShapeResult, MomentsError>> {
        info!("Measuring adaptive moments of {} objects.", centers.len());
        centers.iter().map(|c| self.measure(source, *c)).collect()
    }

    /// Iterate the weight function until the weighted object's shape stops changing.
    fn fit<S: PixelSource>(&self, source: &S, xcen: f64, ycen: f64) -> Fit {
        let (width, height) = (source.width(), source.height());
        let shift_max = self.max_shift.clamp(SHIFT_RANGE.0, SHIFT_RANGE.1);

        let mut state = IterationState::new();
        let mut bbox = PixelBox::around(
            width,
            height,
            xcen,
            ycen,
            &state.sigma_w,
            self.max_radius,
        );
        let mut last: Option<RawMoments> = None;
        let mut centroid = (xcen, ycen);
        let mut shift = false;
        let mut passes = 0;

        let terminal = loop {
            if state.iteration >= self.max_iter {
                break Terminal::MaxIter;
            }

            bbox = PixelBox::around(width, height, xcen, ycen, &state.sigma_w, self.max_radius);
            let weights = match solve_weights(&state.sigma_w, Degeneracy::Inflate) {
                Ok(weights) => weights,
                Err(err) => {
                    debug!("Weight function is unusable: {err}.");
                    break Terminal::Fallback;
                }
            };
            let (kernel, repeat) = state.choose_kernel(&weights);

            let scan = Scan {
                center: (xcen, ycen),
                bbox,
                background: self.background,
                interpolate: state.interpolate,
            };
            let raw = match accumulate(source, &scan, &kernel, Mode::Full) {
                Ok(raw) => raw,
                Err(err) => {
                    debug!("Weighted moments failed: {err}.");
                    break Terminal::Fallback;
                }
            };
            last = Some(raw);
            passes += 1;

            // the weight function stays centered on the input position
            centroid = (raw.sumx / raw.sum, raw.sumy / raw.sum);
            if (centroid.0 - xcen).abs() > shift_max || (centroid.1 - ycen).abs() > shift_max {
                shift = true;
            }

            let sigma_ow = Quadrupole::new(
                raw.sumxx / raw.sum,
                raw.sumyy / raw.sum,
                raw.sumxy / raw.sum,
            );
            if sigma_ow.ixx <= 0. || sigma_ow.iyy <= 0. {
                break Terminal::Fallback;
            }
            trace!(
                "Iteration {}: weight {:?}, weighted object {:?}.",
                state.iteration, state.sigma_w, sigma_ow
            );

            if state.has_converged(&sigma_ow, self.tol1, self.tol2) {
                break Terminal::Converged;
            }
            state.remember(&sigma_ow);

            match next_weight_covariance(&sigma_ow, &kernel) {
                Some(sigma_w) => state.sigma_w = sigma_w,
                None => break Terminal::Fallback,
            }

            if !repeat {
                state.iteration += 1;
            }
        };

        let max_iter = matches!(terminal, Terminal::MaxIter);
        let weighted = match (terminal, last) {
            (Terminal::Fallback, _) => None,
            (_, Some(raw)) if raw.sumxx + raw.sumyy != 0. => Some(raw),
            _ => None,
        };

        match weighted {
            Some(raw) => Fit {
                outcome: if max_iter {
                    FitOutcome::MaxIter
                } else {
                    FitOutcome::Converged
                },
                moments: state.sigma_w,
                i0: raw.i0,
                xy4: raw.sums4 / raw.sum,
                centroid,
                shift,
                max_iter,
                iterations: state.iteration,
                passes,
            },
            None => {
                let scan = Scan {
                    center: (xcen, ycen),
                    bbox,
                    background: self.background,
                    interpolate: state.interpolate,
                };
                let (outcome, moments) = unweighted_moments(source, &scan);
                Fit {
                    outcome,
                    moments,
                    i0: f64::NAN,
                    xy4: f64::NAN,
                    centroid,
                    shift,
                    max_iter,
                    iterations: state.iteration,
                    passes,
                }
            }
        }
    }

    /// Flux inside an elliptical Gaussian aperture of fixed shape `shape` centered on `center`.
    ///
    /// The shape is typically the result of an earlier [`measure`](Self::measure), possibly on
    /// another image. The flux is NaN if the aperture cannot be evaluated, its uncertainty if
    /// the variance at `center` is unknown.
    pub fn fixed_moments_flux<S: PixelSource>(
        &self,
        source: &S,
        center: Point2<f64>,
        shape: &Quadrupole,
    ) -> Result<FluxResult, MomentsError> {
        let (xcen, ycen) = self.local_center(source, center)?;

        let weights = match solve_weights(shape, Degeneracy::Inflate) {
            Ok(weights) => weights,
            Err(err) => {
                debug!("Aperture {shape:?} is unusable: {err}.");
                return Ok(FluxResult::NAN);
            }
        };
        let scan = Scan {
            center: (xcen, ycen),
            bbox: PixelBox::around(
                source.width(),
                source.height(),
                xcen,
                ycen,
                shape,
                self.max_radius,
            ),
            background: self.background,
            interpolate: should_interpolate(shape, weights.determinant),
        };
        let raw = match accumulate(source, &scan, &weights.kernel, Mode::FluxOnly) {
            Ok(raw) => raw,
            Err(err) => {
                debug!("Fixed aperture flux failed: {err}.");
                return Ok(FluxResult::NAN);
            }
        };

        let variance = source.variance_at(xcen as i64, ycen as i64);
        let i0_sigma = match fisher::covariance(raw.i0, shape, variance) {
            Ok(c) => c[(0, 0)].sqrt(),
            Err(err) => {
                debug!("No fixed aperture flux uncertainty: {err}.");
                f64::NAN
            }
        };

        // the aperture may have been inflated
        let scale = 2. * PI * weights.determinant.sqrt();
        Ok(FluxResult {
            flux: raw.i0 * scale,
            flux_sigma: i0_sigma * scale,
        })
    }
}

/// Uniformly weighted moments over the last window, for when the weighted fit failed.
fn unweighted_moments<S: PixelSource>(source: &S, scan: &Scan) -> (FitOutcome, Quadrupole) {
    match accumulate(source, scan, &WeightKernel::UNIFORM, Mode::Full) {
        Ok(raw) => (
            FitOutcome::Unweighted,
            Quadrupole::new(raw.sumxx / raw.sum, raw.sumyy / raw.sum, raw.sumxy / raw.sum),
        ),
        Err(err) => {
            debug!("Unweighted moments failed: {err}.");
            let sum = match err {
                AccumulateError::NonPositive(raw) => raw.sum,
                _ => f64::NAN,
            };
            let moments = if sum > 0. {
                // a single pixel
                Quadrupole::circular(PIXEL_VARIANCE)
            } else {
                Quadrupole::new(0., 0., 0.)
            };
            (FitOutcome::UnweightedBad, moments)
        }
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use rayon::prelude::*;

    impl AdaptiveMoments {
        /// Measure several objects of the same image in parallel.
        ///
        /// Also see [`measure`](AdaptiveMoments::measure()) for more details.
        pub fn measure_all_par<S: PixelSource + Sync>(
            &self,
            source: &S,
            centers: &[Point2<f64>],
        ) -> Vec<Result<ShapeResult, MomentsError>> {
            info!(
                "Measuring adaptive moments of {} objects in parallel.",
                centers.len()
            );
            centers.par_iter().map(|c| self.measure(source, *c)).collect()
        }
    }
}
