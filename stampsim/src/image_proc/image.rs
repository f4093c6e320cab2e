use std::ops::{Add, AddAssign, Mul, Sub};

use image::{GrayImage, Luma};
use ndarray::Array2;
use num_traits::Zero;

use crate::error::{Result, StampError};

/// A point in image (pixel) or sky (arcsec) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl Add for Position {
    type Output = Position;
    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Position {
    fn add_assign(&mut self, rhs: Position) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Position {
    type Output = Position;
    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Position {
    type Output = Position;
    fn mul(self, rhs: f64) -> Position {
        Position::new(self.x * rhs, self.y * rhs)
    }
}

/// Inclusive integer pixel bounds.
///
/// A stamp of `ncol × nrow` pixels anchored at origin `(x0, y0)` covers
/// `x0..=x0+ncol-1` and `y0..=y0+nrow-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub xmin: i64,
    pub xmax: i64,
    pub ymin: i64,
    pub ymax: i64,
}

impl Bounds {
    pub const fn new(xmin: i64, xmax: i64, ymin: i64, ymax: i64) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Bounds of an `ncol × nrow` grid whose lower-left pixel is `(x0, y0)`.
    pub fn from_origin(x0: i64, y0: i64, ncol: usize, nrow: usize) -> Self {
        Self::new(x0, x0 + ncol as i64 - 1, y0, y0 + nrow as i64 - 1)
    }

    pub fn ncol(&self) -> usize {
        (self.xmax - self.xmin + 1).max(0) as usize
    }

    pub fn nrow(&self) -> usize {
        (self.ymax - self.ymin + 1).max(0) as usize
    }

    /// Integer center pixel. For an even extent this is the pixel just above
    /// the true center.
    pub fn center(&self) -> (i64, i64) {
        (
            (self.xmin + self.xmax + 1).div_euclid(2),
            (self.ymin + self.ymax + 1).div_euclid(2),
        )
    }

    /// Geometric center, which sits on a pixel corner for even extents.
    pub fn true_center(&self) -> Position {
        Position::new(
            (self.xmin + self.xmax) as f64 / 2.0,
            (self.ymin + self.ymax) as f64 / 2.0,
        )
    }

    pub fn shifted(&self, dx: i64, dy: i64) -> Self {
        Self::new(self.xmin + dx, self.xmax + dx, self.ymin + dy, self.ymax + dy)
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }
}

/// A pixel grid with image-coordinate bounds and a pixel scale.
///
/// The array is indexed `[row, col]` with row = y, so pixel `(x, y)` lives at
/// `[y - ymin, x - xmin]`. An image without bounds is empty (0×0).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBase<T> {
    array: Array2<T>,
    bounds: Option<Bounds>,
    scale: f64,
}

/// Floating-point image used for stamps, PSF stamps and weight maps.
pub type Image = ImageBase<f64>;

/// Bad-pixel mask with the same bounds as its stamp.
pub type BadPixImage = ImageBase<i16>;

impl<T: Clone + Zero> ImageBase<T> {
    /// Zeroed `ncol × nrow` image anchored at `(1, 1)`.
    pub fn zeros(ncol: usize, nrow: usize, scale: f64) -> Self {
        if ncol == 0 || nrow == 0 {
            return Self::empty(scale);
        }
        Self::from_bounds(Bounds::from_origin(1, 1, ncol, nrow), scale)
    }

    pub fn from_bounds(bounds: Bounds, scale: f64) -> Self {
        Self {
            array: Array2::zeros((bounds.nrow(), bounds.ncol())),
            bounds: Some(bounds),
            scale,
        }
    }

    /// A 0×0 image with undefined bounds.
    pub fn empty(scale: f64) -> Self {
        Self {
            array: Array2::zeros((0, 0)),
            bounds: None,
            scale,
        }
    }

    /// Zeroed image sharing this image's bounds and scale.
    pub fn zeros_like<U: Clone + Zero>(&self) -> ImageBase<U> {
        match self.bounds {
            Some(bounds) => ImageBase::<U>::from_bounds(bounds, self.scale),
            None => ImageBase::<U>::empty(self.scale),
        }
    }
}

impl<T> ImageBase<T> {
    /// Wrap an existing array, anchoring its lower-left pixel at `(x0, y0)`.
    pub fn from_array(array: Array2<T>, x0: i64, y0: i64, scale: f64) -> Self {
        let (nrow, ncol) = array.dim();
        let bounds = (nrow > 0 && ncol > 0).then(|| Bounds::from_origin(x0, y0, ncol, nrow));
        Self {
            array,
            bounds,
            scale,
        }
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn ncol(&self) -> usize {
        self.array.ncols()
    }

    pub fn nrow(&self) -> usize {
        self.array.nrows()
    }

    pub fn array(&self) -> &Array2<T> {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut Array2<T> {
        &mut self.array
    }

    pub fn into_array(self) -> Array2<T> {
        self.array
    }

    /// Move the lower-left pixel to `(x0, y0)`. No-op on an empty image.
    pub fn set_origin(&mut self, x0: i64, y0: i64) {
        if let Some(b) = self.bounds {
            self.bounds = Some(b.shifted(x0 - b.xmin, y0 - b.ymin));
        }
    }

    /// Shift the bounds so that [`Bounds::center`] lands on `(cx, cy)`.
    pub fn set_center(&mut self, cx: i64, cy: i64) {
        if let Some(b) = self.bounds {
            let (x, y) = b.center();
            self.bounds = Some(b.shifted(cx - x, cy - y));
        }
    }

    /// Pixel value at image coordinates `(x, y)`.
    pub fn get(&self, x: i64, y: i64) -> Option<&T> {
        let b = self.bounds?;
        if !b.contains(x, y) {
            return None;
        }
        self.array
            .get([(y - b.ymin) as usize, (x - b.xmin) as usize])
    }
}

impl Image {
    pub fn add_scalar(&mut self, value: f64) {
        self.array.mapv_inplace(|v| v + value);
    }

    pub fn scale_by(&mut self, factor: f64) {
        self.array.mapv_inplace(|v| v * factor);
    }

    pub fn sum(&self) -> f64 {
        self.array.sum()
    }

    pub fn sum_sq(&self) -> f64 {
        self.array.iter().map(|v| v * v).sum()
    }

    /// Copy pixel values from an image of the same shape.
    pub fn copy_from(&mut self, other: &Image) -> Result<()> {
        if self.array.dim() != other.array.dim() {
            return Err(StampError::config(format!(
                "cannot copy a {:?} image into a {:?} image",
                other.array.dim(),
                self.array.dim()
            )));
        }
        self.array.assign(&other.array);
        Ok(())
    }

    /// Linearly rescale the pixel values into 0..=255 for a grayscale preview.
    pub fn to_u8(&self) -> Array2<u8> {
        let (min, max) = self
            .array
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        if !range.is_finite() || range <= 0.0 {
            return Array2::zeros(self.array.dim());
        }
        self.array
            .mapv(|v| (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8)
    }

    pub fn to_gray_image(&self) -> GrayImage {
        array2_to_gray_image(&self.to_u8())
    }
}

/// Converts an ndarray Array2<u8> to an image::GrayImage
///
/// Array indices `[y, x]` map to pixel coordinates `(x, y)`. Array dimensions
/// are (height, width) while image dimensions are (width, height).
pub fn array2_to_gray_image(arr: &Array2<u8>) -> GrayImage {
    let (height, width) = arr.dim();
    let mut img = GrayImage::new(width as u32, height as u32);
    for ((y, x), &value) in arr.indexed_iter() {
        img.put_pixel(x as u32, y as u32, Luma([value]));
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_center_even_and_odd() {
        let even = Bounds::from_origin(1, 1, 16, 16);
        assert_eq!(even.center(), (9, 9));
        assert_eq!(even.true_center(), Position::new(8.5, 8.5));

        let odd = Bounds::from_origin(1, 1, 15, 15);
        assert_eq!(odd.center(), (8, 8));
        assert_eq!(odd.true_center(), Position::new(8.0, 8.0));

        let negative = Bounds::new(-4, -1, -4, -1);
        assert_eq!(negative.center(), (-2, -2));
    }

    #[test]
    fn test_set_center_moves_bounds() {
        let mut im = Image::zeros(16, 10, 0.2);
        im.set_center(11, 21);
        let b = im.bounds().unwrap();
        assert_eq!(b.center(), (11, 21));
        assert_eq!(b.ncol(), 16);
        assert_eq!(b.nrow(), 10);
        assert_eq!(b.xmin, 3);
        assert_eq!(b.ymin, 16);
    }

    #[test]
    fn test_set_origin_and_get() {
        let mut im = Image::zeros(4, 3, 1.0);
        im.array_mut()[[2, 3]] = 7.0;
        im.set_origin(10, 20);
        assert_eq!(im.get(13, 22), Some(&7.0));
        assert_eq!(im.get(14, 22), None);
    }

    #[test]
    fn test_empty_image_has_no_bounds() {
        let mut im = Image::empty(1.0);
        im.set_center(5, 5);
        assert!(im.is_empty());
        assert_eq!(im.ncol(), 0);
        let weight: Image = im.zeros_like();
        assert!(weight.is_empty());
    }

    #[test]
    fn test_copy_from_shape_mismatch() {
        let mut a = Image::zeros(4, 4, 1.0);
        let b = Image::zeros(3, 4, 1.0);
        assert!(a.copy_from(&b).is_err());
    }

    #[test]
    fn test_gray_image_dimensions() {
        let mut im = Image::zeros(5, 3, 1.0);
        im.array_mut()[[1, 4]] = 2.0;
        let gray = im.to_gray_image();
        assert_eq!(gray.width(), 5);
        assert_eq!(gray.height(), 3);
        assert_eq!(gray.get_pixel(4, 1).0[0], 255);
        assert_eq!(gray.get_pixel(0, 0).0[0], 0);
    }
}
