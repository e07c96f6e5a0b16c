//! Read-only pixel access for the moments engine.
//!
//! The engine only ever reads single pixel values (and, if available, variances) at integer
//! positions, so any image container can be plugged in by implementing [`PixelSource`].
//! Two adaptors over [`ndarray`] views are provided: [`Image`] without and [`MaskedImage`]
//! with a variance plane.

use ndarray::ArrayView2;
use num_traits::AsPrimitive;

/// A pixel type that can be read as `f64`.
///
/// This trait is automatically implemented for all primitive numeric types.
pub trait Pixel: Copy + AsPrimitive<f64> {}

impl<T> Pixel for T where T: Copy + AsPrimitive<f64> {}

/// Per-pixel variance capability of a [`PixelSource`].
pub trait VarianceSource {
    /// `false` if this source never knows the variance.
    const PROVIDED: bool;

    /// Variance at the image-local pixel `(x, y)`, NaN if unknown.
    fn variance(&self, x: usize, y: usize) -> f64;
}

/// Variance capability of value-only images.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoVariance;

impl VarianceSource for NoVariance {
    const PROVIDED: bool = false;

    fn variance(&self, _x: usize, _y: usize) -> f64 {
        f64::NAN
    }
}

impl<V: Pixel> VarianceSource for ArrayView2<'_, V> {
    const PROVIDED: bool = true;

    fn variance(&self, x: usize, y: usize) -> f64 {
        self.get((y, x)).map_or(f64::NAN, |v| v.as_())
    }
}

/// Random access to the pixels of a rectangular image.
///
/// Coordinates passed to [`value`](PixelSource::value) are image-local with `x` the column
/// and `y` the row. Callers guarantee `x < width()` and `y < height()`.
pub trait PixelSource {
    /// The variance capability of this source.
    type Variance: VarianceSource;

    /// Number of columns.
    fn width(&self) -> usize;

    /// Number of rows.
    fn height(&self) -> usize;

    /// Position of pixel `(0, 0)` in the parent frame.
    fn origin(&self) -> (i64, i64) {
        (0, 0)
    }

    /// Pixel value at `(x, y)`.
    fn value(&self, x: usize, y: usize) -> f64;

    /// Per-pixel variance of this source.
    fn variance_plane(&self) -> &Self::Variance;

    /// Variance at the image-local pixel `(x, y)`; NaN outside the image or if unknown.
    fn variance_at(&self, x: i64, y: i64) -> f64 {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return f64::NAN;
        }
        self.variance_plane().variance(x as usize, y as usize)
    }
}

/// A value-only image.
#[derive(Clone, Debug)]
pub struct Image<'a, T: Pixel> {
    /// Pixel values. Shape `(height, width)`.
    data: ArrayView2<'a, T>,
    origin: (i64, i64),
}

impl<'a, T: Pixel> Image<'a, T> {
    /// Wrap a `(height, width)` array of pixel values.
    pub fn new(data: ArrayView2<'a, T>) -> Self {
        Self {
            data,
            origin: (0, 0),
        }
    }

    /// Set the parent-frame position of the first pixel.
    pub fn with_origin(mut self, x0: i64, y0: i64) -> Self {
        self.origin = (x0, y0);
        self
    }
}

impl<T: Pixel> PixelSource for Image<'_, T> {
    type Variance = NoVariance;

    fn width(&self) -> usize {
        self.data.ncols()
    }

    fn height(&self) -> usize {
        self.data.nrows()
    }

    fn origin(&self) -> (i64, i64) {
        self.origin
    }

    fn value(&self, x: usize, y: usize) -> f64 {
        self.data[[y, x]].as_()
    }

    fn variance_plane(&self) -> &NoVariance {
        &NoVariance
    }
}

/// An image together with its per-pixel variance.
#[derive(Clone, Debug)]
pub struct MaskedImage<'a, T: Pixel, V: Pixel = f32> {
    /// Pixel values. Shape `(height, width)`.
    data: ArrayView2<'a, T>,
    /// Pixel variances. Same shape as `data`.
    variance: ArrayView2<'a, V>,
    origin: (i64, i64),
}

impl<'a, T: Pixel, V: Pixel> MaskedImage<'a, T, V> {
    /// Wrap `(height, width)` arrays of pixel values and variances.
    ///
    /// # Panics
    /// If the shapes of `data` and `variance` differ.
    pub fn new(data: ArrayView2<'a, T>, variance: ArrayView2<'a, V>) -> Self {
        assert_eq!(
            data.shape(),
            variance.shape(),
            "image and variance planes must have the same shape"
        );
        Self {
            data,
            variance,
            origin: (0, 0),
        }
    }

    /// Set the parent-frame position of the first pixel.
    pub fn with_origin(mut self, x0: i64, y0: i64) -> Self {
        self.origin = (x0, y0);
        self
    }
}

impl<'a, T: Pixel, V: Pixel> PixelSource for MaskedImage<'a, T, V> {
    type Variance = ArrayView2<'a, V>;

    fn width(&self) -> usize {
        self.data.ncols()
    }

    fn height(&self) -> usize {
        self.data.nrows()
    }

    fn origin(&self) -> (i64, i64) {
        self.origin
    }

    fn value(&self, x: usize, y: usize) -> f64 {
        self.data[[y, x]].as_()
    }

    fn variance_plane(&self) -> &ArrayView2<'a, V> {
        &self.variance
    }
}
