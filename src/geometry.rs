//! Second-moment ellipses and the pixel windows derived from them.

use std::f64::consts::PI;

use nalgebra::Matrix2;

/// Symmetric 2x2 second-moment matrix of a light distribution or a weight function.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quadrupole {
    /// Second moment along x.
    pub ixx: f64,
    /// Second moment along y.
    pub iyy: f64,
    /// Cross moment.
    pub ixy: f64,
}

impl Quadrupole {
    /// Create a new instance.
    pub const fn new(ixx: f64, iyy: f64, ixy: f64) -> Self {
        Self { ixx, iyy, ixy }
    }

    /// Moments of a round distribution with variance `sigma2` along each axis.
    pub const fn circular(sigma2: f64) -> Self {
        Self::new(sigma2, sigma2, 0.)
    }

    pub(crate) fn from_matrix(matrix: &Matrix2<f64>) -> Self {
        Self::new(matrix.m11, matrix.m22, 0.5 * (matrix.m12 + matrix.m21))
    }

    /// As a symmetric matrix.
    pub fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.ixx, self.ixy, self.ixy, self.iyy)
    }

    /// `ixx * iyy - ixy²`.
    pub fn determinant(&self) -> f64 {
        self.ixx * self.iyy - self.ixy * self.ixy
    }

    /// `ixx + iyy`.
    pub fn trace(&self) -> f64 {
        self.ixx + self.iyy
    }

    /// Whether any component is NaN.
    pub fn is_nan(&self) -> bool {
        self.ixx.is_nan() || self.iyy.is_nan() || self.ixy.is_nan()
    }

    /// The shape parameters `(e1, e2)`.
    pub fn ellipticity(&self) -> (f64, f64) {
        let trace = self.trace();
        ((self.ixx - self.iyy) / trace, 2. * self.ixy / trace)
    }

    /// Integral of a unit-amplitude elliptical Gaussian with these moments.
    pub fn flux_scale(&self) -> f64 {
        2. * PI * self.determinant().sqrt()
    }

    /// Add `variance` in quadrature to both principal axes.
    ///
    /// Negative principal variances are clamped to zero first, so the result is always
    /// positive definite for positive `variance`.
    pub(crate) fn inflate_axes(&self, variance: f64) -> Self {
        let mut eigen = self.matrix().symmetric_eigen();
        eigen.eigenvalues.apply(|l| *l = l.max(0.) + variance);
        Self::from_matrix(&eigen.recompose())
    }
}

/// Inclusive integer pixel box `[x0, x1] x [y0, y1]` in image-local coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    /// First column.
    pub x0: i64,
    /// First row.
    pub y0: i64,
    /// Last column.
    pub x1: i64,
    /// Last row.
    pub y1: i64,
}

impl PixelBox {
    /// Region examined around `(xcen, ycen)` for a weight function with moments `weight`.
    ///
    /// The half-size is four times the larger axis' standard deviation, capped at
    /// `max_radius`. The box is clipped to the `width x height` image; a center far enough
    /// outside the image yields an empty box. The cross moment is ignored.
    pub fn around(
        width: usize,
        height: usize,
        xcen: f64,
        ycen: f64,
        weight: &Quadrupole,
        max_radius: f64,
    ) -> Self {
        let radius = (4. * weight.ixx.max(weight.iyy).sqrt()).min(max_radius);

        // `as` truncates towards zero
        let x0 = ((xcen - radius - 0.5) as i64).max(0);
        let y0 = ((ycen - radius - 0.5) as i64).max(0);
        let x1 = ((xcen + radius + 0.5) as i64).min(width as i64 - 1);
        let y1 = ((ycen + radius + 0.5) as i64).min(height as i64 - 1);

        Self { x0, y0, x1, y1 }
    }

    /// Whether the box contains no pixel.
    pub fn is_empty(&self) -> bool {
        self.x0 > self.x1 || self.y0 > self.y1
    }

    /// Whether every pixel of a non-empty box can be read from a `width x height` image.
    pub fn is_inside(&self, width: usize, height: usize) -> bool {
        !self.is_empty()
            && self.x0 >= 0
            && self.y0 >= 0
            && self.x1 < width as i64
            && self.y1 < height as i64
    }

    /// Number of pixels in the box.
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            ((self.x1 - self.x0 + 1) * (self.y1 - self.y0 + 1)) as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn inflate_degenerate() {
        let q = Quadrupole::new(0., 0., 0.).inflate_axes(1. / 12.);
        assert_abs_diff_eq!(q.ixx, 1. / 12., epsilon = 1e-12);
        assert_abs_diff_eq!(q.iyy, 1. / 12., epsilon = 1e-12);
        assert_abs_diff_eq!(q.ixy, 0., epsilon = 1e-12);
    }

    #[test]
    fn inflate_line() {
        // all light on the diagonal x == y
        let q = Quadrupole::new(2., 2., 2.);
        assert_abs_diff_eq!(q.determinant(), 0.);

        let inflated = q.inflate_axes(1. / 12.);
        assert_abs_diff_eq!(
            inflated.determinant(),
            (4. + 1. / 12.) / 12.,
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(inflated.trace(), 4. + 2. / 12., epsilon = 1e-10);
    }

    #[test]
    fn ellipticity() {
        let (e1, e2) = Quadrupole::new(3., 1., 0.5).ellipticity();
        assert_abs_diff_eq!(e1, 0.5);
        assert_abs_diff_eq!(e2, 0.25);
    }

    #[test]
    fn box_clipped() {
        let bbox = PixelBox::around(20, 10, 2., 8., &Quadrupole::circular(4.), 1000.);
        assert_eq!(
            bbox,
            PixelBox {
                x0: 0,
                y0: 0,
                x1: 10,
                y1: 9
            }
        );
        assert!(bbox.is_inside(20, 10));
    }

    #[test]
    fn box_radius_cap() {
        let bbox = PixelBox::around(100, 100, 50., 50., &Quadrupole::new(100., 1., 0.), 3.);
        assert_eq!(
            bbox,
            PixelBox {
                x0: 46,
                y0: 46,
                x1: 53,
                y1: 53
            }
        );
    }

    #[test]
    fn box_area_monotonic() {
        let (width, height) = (64, 48);
        for (xcen, ycen) in [(32., 24.), (1.2, 3.7), (62.5, 47.), (0., 0.)] {
            let mut previous = 0;
            for i in 1..200 {
                let sigma2 = 0.05 * i as f64;
                let bbox = PixelBox::around(
                    width,
                    height,
                    xcen,
                    ycen,
                    &Quadrupole::new(sigma2, 0.5 * sigma2, 0.1),
                    15.,
                );
                assert!(bbox.is_inside(width, height));
                assert!(bbox.area() >= previous);
                previous = bbox.area();
            }
        }
    }

    #[test]
    fn box_outside_image() {
        let bbox = PixelBox::around(20, 20, -30., 10., &Quadrupole::circular(1.5), 1000.);
        assert!(bbox.is_empty());
        assert!(!bbox.is_inside(20, 20));
        assert_eq!(bbox.area(), 0);
    }
}
