#![warn(missing_docs)]

//! Adaptive second moments of astronomical sources. \
//! The shape of an object is estimated by iteratively matching an elliptical Gaussian weight
//! function to it, following Bernstein & Jarvis (2002). The result contains the centroid, the
//! second moments, and the amplitude and flux of the best-fit Gaussian. If the image carries a
//! variance plane, uncertainties are derived from the analytic Fisher matrix.
//!
//! ## Interface
//! The central struct of this library is [`AdaptiveMoments`]. It holds the measurement options,
//! which are set via `AdaptiveMoments::with_*()` functions.
//!
//! Example:
//! ```rust
//! use admom::{AdaptiveMoments, Image};
//! use nalgebra::Point2;
//! use ndarray::Array2;
//!
//! let data = Array2::from_shape_fn((31, 31), |(y, x)| {
//!     let (dx, dy) = (x as f64 - 15., y as f64 - 15.);
//!     100. * (-(dx * dx / 4. + dy * dy / 2.) / 2.).exp()
//! });
//!
//! let result = AdaptiveMoments::new()
//!     .with_max_iter(50)
//!     .measure(&Image::new(data.view()), Point2::new(15., 15.))
//!     .unwrap();
//! assert!(!result.flags.failure);
//! ```
//!
//! After constructing the struct, there are two options:
//! - Measure the adaptive moments of an object with [`AdaptiveMoments::measure()`].
//! - Measure the flux inside a Gaussian aperture of known shape with
//!     [`AdaptiveMoments::fixed_moments_flux()`].
//!
//! Many objects of the same image can also be measured in parallel.
//!
//! Images are read through the [`PixelSource`] trait. [`Image`] wraps a plain array of pixel
//! values, [`MaskedImage`] additionally a variance plane. Both can be placed inside a larger
//! parent frame, in which case all positions are given in parent coordinates.
//!
//! ## Parameters
//! - `background`: Level subtracted from every pixel.
//! - `max_iter`: Maximum number of iterations. Hitting it is reported, but the last weight
//!     function is kept.
//! - `tol1`: Convergence tolerance for the ellipticities `e1` and `e2`.
//! - `tol2`: Relative convergence tolerance for `xx`.
//! - `max_shift`: The `shift` flag is set if the weighted centroid moves further than this from
//!     the initial center. It is clamped into `[2, 10]`.
//! - `max_radius`: Cap on the half-size of the examined pixel window.
//!
//! ## Failures
//! Only invalid options and non-finite centers are returned as [`MomentsError`]. Everything that
//! goes wrong while fitting is recorded in [`FitFlags`]. If the weighted fit fails, unweighted
//! moments are reported instead.

pub mod accumulate;
pub(crate) mod adaptive;
pub(crate) mod error;
pub mod fisher;
pub(crate) mod geometry;
pub(crate) mod image;
#[cfg(test)]
mod test_utils;
pub mod weights;

pub use adaptive::{AdaptiveMoments, FitFlags, FitOutcome, FluxResult, ShapeResult};
pub use error::MomentsError;
pub use geometry::{PixelBox, Quadrupole};
pub use image::{Image, MaskedImage, NoVariance, Pixel, PixelSource, VarianceSource};
pub use weights::{WeightKernel, solve_weights};
