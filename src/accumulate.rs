//! Gaussian-weighted sums over a pixel box.

use std::f64::consts::PI;

use itertools::{Itertools, iproduct};
use thiserror::Error;

use crate::geometry::PixelBox;
use crate::image::PixelSource;
use crate::weights::WeightKernel;

/// Pixels with a larger exponent have negligible weight.
const MAX_EXPONENT: f64 = 14.;
/// Same cut-off, applied to the largest corner exponent when interpolating.
const MAX_EXPONENT_INTERPOLATED: f64 = 9.;
/// Sub-pixel sample offsets along each axis; the outermost also bound the pixel's corners.
const SUBPIXEL_OFFSETS: [f64; 4] = [-0.375, -0.125, 0.125, 0.375];
/// Fraction of a pixel represented by one sub-pixel sample.
const SUBPIXEL_AREA: f64 = 1. / 16.;

/// Which sums are needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// All moments up to second order plus the fourth-order diagnostic.
    Full,
    /// Only the weighted sum and amplitude.
    FluxOnly,
}

/// Where and how to accumulate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scan {
    /// Image-local center `(x, y)` of the weight function.
    pub center: (f64, f64),
    /// Pixels to visit.
    pub bbox: PixelBox,
    /// Subtracted from every pixel before weighting.
    pub background: f64,
    /// Sample every pixel on a 4x4 sub-pixel grid.
    pub interpolate: bool,
}

/// Raw weighted sums.
///
/// First moments are absolute image-local positions, second moments are taken about the
/// scan center.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawMoments {
    /// Sum of `weight * intensity`.
    pub sum: f64,
    /// First moment along x, relative to the origin of the image.
    pub sumx: f64,
    /// First moment along y, relative to the origin of the image.
    pub sumy: f64,
    /// Second moment along x about the scan center.
    pub sumxx: f64,
    /// Cross moment about the scan center.
    pub sumxy: f64,
    /// Second moment along y about the scan center.
    pub sumyy: f64,
    /// Sum of `exponent² * weight * intensity`.
    pub sums4: f64,
    /// Amplitude of the Gaussian with the kernel's moments matching the weighted sum.
    pub i0: f64,
}

impl RawMoments {
    #[inline]
    fn add(
        &mut self,
        mode: Mode,
        ymod: f64,
        (x, y): (f64, f64),
        (xcen, ycen): (f64, f64),
        expon: f64,
    ) {
        self.sum += ymod;
        if mode == Mode::Full {
            self.sumx += ymod * (x + xcen);
            self.sumy += ymod * (y + ycen);
            self.sumxx += ymod * x * x;
            self.sumxy += ymod * x * y;
            self.sumyy += ymod * y * y;
            self.sums4 += ymod * expon * expon;
        }
    }
}

/// Reasons why [`accumulate`] produced no usable moments.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccumulateError {
    /// Some kernel coefficient is too large.
    #[error("weight kernel diverged: {0:?}")]
    DivergedKernel(WeightKernel),
    /// The box is empty or reaches past the image.
    #[error("box {bbox:?} does not lie inside the {width}x{height} image")]
    OutOfBounds {
        /// The rejected box.
        bbox: PixelBox,
        /// Width of the image.
        width: usize,
        /// Height of the image.
        height: usize,
    },
    /// The scan completed, but the moments cannot describe an object.
    #[error(
        "non-positive weighted moments (sum={}, sumxx={}, sumyy={})",
        .0.sum, .0.sumxx, .0.sumyy
    )]
    NonPositive(RawMoments),
}

/// Accumulate the moments of `source` weighted by `kernel`.
///
/// Pixels that are not finite are skipped. In [`Mode::Full`], the result is only valid if
/// the sum and both second moments are positive.
///
/// When interpolating, each of the 16 sub-samples carries 1/16 of its pixel, so `i0` has the
/// same scale on both grids.
pub fn accumulate<S: PixelSource>(
    source: &S,
    scan: &Scan,
    kernel: &WeightKernel,
    mode: Mode,
) -> Result<RawMoments, AccumulateError> {
    if kernel.is_diverged() {
        return Err(AccumulateError::DivergedKernel(*kernel));
    }

    let bbox = scan.bbox;
    if !bbox.is_inside(source.width(), source.height()) {
        return Err(AccumulateError::OutOfBounds {
            bbox,
            width: source.width(),
            height: source.height(),
        });
    }

    let (xcen, ycen) = scan.center;
    let mut moments = RawMoments::default();

    for (iy, ix) in iproduct!(bbox.y0..=bbox.y1, bbox.x0..=bbox.x1) {
        let x = ix as f64 - xcen;
        let y = iy as f64 - ycen;

        if scan.interpolate {
            let corner = SUBPIXEL_OFFSETS[3];
            let expon = [
                (-corner, -corner),
                (corner, corner),
                (-corner, corner),
                (corner, -corner),
            ]
            .into_iter()
            .map(|(dx, dy)| kernel.exponent(x + dx, y + dy))
            .fold(f64::NEG_INFINITY, f64::max);
            if expon > MAX_EXPONENT_INTERPOLATED {
                continue;
            }

            let tmod = source.value(ix as usize, iy as usize) - scan.background;
            if !tmod.is_finite() {
                continue;
            }
            for (dy, dx) in SUBPIXEL_OFFSETS
                .into_iter()
                .cartesian_product(SUBPIXEL_OFFSETS)
            {
                let (sx, sy) = (x + dx, y + dy);
                let expon = kernel.exponent(sx, sy);
                let ymod = SUBPIXEL_AREA * tmod * (-0.5 * expon).exp();
                moments.add(mode, ymod, (sx, sy), scan.center, expon);
            }
        } else {
            let expon = kernel.exponent(x, y);
            if expon > MAX_EXPONENT {
                continue;
            }

            let tmod = source.value(ix as usize, iy as usize) - scan.background;
            if !tmod.is_finite() {
                continue;
            }
            let ymod = tmod * (-0.5 * expon).exp();
            moments.add(mode, ymod, (x, y), scan.center, expon);
        }
    }

    moments.i0 = moments.sum / (PI * kernel.covariance_determinant().sqrt());

    if mode == Mode::FluxOnly
        || (moments.sum > 0. && moments.sumxx > 0. && moments.sumyy > 0.)
    {
        Ok(moments)
    } else {
        Err(AccumulateError::NonPositive(moments))
    }
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;

    use super::*;
    use crate::geometry::Quadrupole;
    use crate::image::Image;
    use crate::test_utils::gaussian;
    use crate::weights::{Degeneracy, solve_weights};

    fn scan(center: (f64, f64), bbox: PixelBox, interpolate: bool) -> Scan {
        Scan {
            center,
            bbox,
            background: 0.,
            interpolate,
        }
    }

    #[test]
    fn uniform_sum_counts_pixels() {
        let data = Array2::from_elem((10, 12), 3.);
        let image = Image::new(data.view());
        let bbox = PixelBox {
            x0: 2,
            y0: 1,
            x1: 6,
            y1: 4,
        };

        for interpolate in [false, true] {
            let moments = accumulate(
                &image,
                &scan((4., 2.5), bbox, interpolate),
                &WeightKernel::UNIFORM,
                Mode::Full,
            )
            .unwrap();
            assert_abs_diff_eq!(moments.sum, 3. * 20., epsilon = 1e-9);
            assert_abs_diff_eq!(moments.sumx / moments.sum, 4., epsilon = 1e-9);
            assert_abs_diff_eq!(moments.sumy / moments.sum, 2.5, epsilon = 1e-9);
            assert_abs_diff_eq!(moments.sumxy, 0., epsilon = 1e-9);
            assert!(moments.i0.is_nan());
        }
    }

    #[test]
    fn background_subtracted() {
        let data = Array2::from_elem((5, 5), 10.);
        let image = Image::new(data.view());
        let scan = Scan {
            background: 10.,
            ..scan((2., 2.), PixelBox::around(5, 5, 2., 2., &Quadrupole::circular(0.5), 10.), false)
        };

        let err = accumulate(&image, &scan, &WeightKernel::UNIFORM, Mode::Full).unwrap_err();
        match err {
            AccumulateError::NonPositive(moments) => assert_eq!(moments.sum, 0.),
            err => panic!("unexpected error {err}"),
        }

        let moments = accumulate(&image, &scan, &WeightKernel::UNIFORM, Mode::FluxOnly).unwrap();
        assert_eq!(moments.sum, 0.);
    }

    #[test]
    fn matched_gaussian_amplitude() {
        let sigma = Quadrupole::new(4., 2.5, 0.8);
        let data = gaussian(41, 41, (20., 20.), &sigma, 100.);
        let image = Image::new(data.view());
        let weights = solve_weights(&sigma, Degeneracy::Inflate).unwrap();
        let bbox = PixelBox::around(41, 41, 20., 20., &sigma, 1000.);

        let moments =
            accumulate(&image, &scan((20., 20.), bbox, false), &weights.kernel, Mode::Full)
                .unwrap();
        assert_relative_eq!(moments.i0, 100., max_relative = 1e-4);
        // a Gaussian weighted by itself has half its moments
        assert_relative_eq!(moments.sumxx / moments.sum, 2., max_relative = 1e-4);
        assert_relative_eq!(moments.sumyy / moments.sum, 1.25, max_relative = 1e-4);
        assert_relative_eq!(moments.sumxy / moments.sum, 0.4, max_relative = 1e-4);

        // pixel values are constant over the sub-pixel grid, so only approximately equal
        let interpolated =
            accumulate(&image, &scan((20., 20.), bbox, true), &weights.kernel, Mode::Full)
                .unwrap();
        assert_relative_eq!(interpolated.i0, moments.i0, max_relative = 2e-2);
        assert_relative_eq!(
            interpolated.sumxx / interpolated.sum,
            2.,
            max_relative = 2e-2
        );
        assert_relative_eq!(
            interpolated.sumx / interpolated.sum,
            20.,
            max_relative = 1e-9
        );
    }

    #[test]
    fn flux_only_skips_moments() {
        let sigma = Quadrupole::circular(2.);
        let data = gaussian(21, 21, (10., 10.), &sigma, 5.);
        let image = Image::new(data.view());
        let kernel = solve_weights(&sigma, Degeneracy::Inflate).unwrap().kernel;
        let bbox = PixelBox::around(21, 21, 10., 10., &sigma, 1000.);

        let moments = accumulate(&image, &scan((10., 10.), bbox, false), &kernel, Mode::FluxOnly)
            .unwrap();
        assert!(moments.sum > 0.);
        assert_eq!(moments.sumx, 0.);
        assert_eq!(moments.sumxx, 0.);
        assert_eq!(moments.sums4, 0.);
        assert_relative_eq!(moments.i0, 5., max_relative = 1e-3);
    }

    #[test]
    fn nan_pixels_skipped() {
        let mut data = Array2::from_elem((7, 7), 1.);
        data[[3, 1]] = f64::NAN;
        let image = Image::new(data.view());
        let bbox = PixelBox {
            x0: 0,
            y0: 0,
            x1: 6,
            y1: 6,
        };

        let moments =
            accumulate(&image, &scan((3., 3.), bbox, false), &WeightKernel::UNIFORM, Mode::Full)
                .unwrap();
        assert_abs_diff_eq!(moments.sum, 48.);
    }

    #[test]
    fn out_of_bounds() {
        let data = Array2::<f32>::zeros((10, 10));
        let image = Image::new(data.view());

        for bbox in [
            PixelBox {
                x0: -1,
                y0: 0,
                x1: 5,
                y1: 5,
            },
            PixelBox {
                x0: 0,
                y0: 0,
                x1: 10,
                y1: 5,
            },
            PixelBox {
                x0: 0,
                y0: 0,
                x1: -24,
                y1: 5,
            },
        ] {
            let err =
                accumulate(&image, &scan((0., 0.), bbox, false), &WeightKernel::UNIFORM, Mode::Full)
                    .unwrap_err();
            assert!(matches!(err, AccumulateError::OutOfBounds { .. }));
        }
    }

    #[test]
    fn diverged_kernel() {
        let data = Array2::<f32>::ones((10, 10));
        let image = Image::new(data.view());
        let kernel = WeightKernel {
            w11: 1.,
            w12: -2e6,
            w22: 1.,
        };
        let bbox = PixelBox {
            x0: 0,
            y0: 0,
            x1: 9,
            y1: 9,
        };

        let err = accumulate(&image, &scan((5., 5.), bbox, false), &kernel, Mode::FluxOnly)
            .unwrap_err();
        assert_eq!(err, AccumulateError::DivergedKernel(kernel));
    }
}
