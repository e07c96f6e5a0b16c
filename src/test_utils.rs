//! Synthetic images for tests.

use ndarray::Array2;

use crate::geometry::Quadrupole;
use crate::weights::{Degeneracy, solve_weights};

/// Add a noiseless elliptical Gaussian sampled at pixel centers.
pub(crate) fn add_gaussian(
    data: &mut Array2<f64>,
    center: (f64, f64),
    sigma: &Quadrupole,
    amplitude: f64,
) {
    let kernel = solve_weights(sigma, Degeneracy::Reject).unwrap().kernel;
    data.indexed_iter_mut().for_each(|((y, x), v)| {
        *v += amplitude * (-0.5 * kernel.exponent(x as f64 - center.0, y as f64 - center.1)).exp()
    });
}

/// A `(height, width)` image holding a single Gaussian.
pub(crate) fn gaussian(
    width: usize,
    height: usize,
    center: (f64, f64),
    sigma: &Quadrupole,
    amplitude: f64,
) -> Array2<f64> {
    let mut data = Array2::zeros((height, width));
    add_gaussian(&mut data, center, sigma, amplitude);
    data
}
