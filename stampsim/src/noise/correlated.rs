//! Correlated Gaussian noise described by a sampled correlation function.
//!
//! A correlation function is stored as a square table of covariances at
//! lags that are integer multiples of `dx` arcsec, with the zero lag in the
//! center cell. To generate a field on an image grid, the function is sampled
//! at the image's pixel lags (wrapped periodically), transformed into a power
//! spectrum, and used to color a white Gaussian field in Fourier space.
//!
//! Table files are JSON:
//!
//! ```json
//! { "dx": 0.03, "values": [[0.0, 0.1, 0.0], [0.1, 1.0, 0.1], [0.0, 0.1, 0.0]] }
//! ```

use std::path::Path;

use ndarray::Array2;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rustfft::FftDirection;
use serde::Deserialize;

use crate::error::{Result, StampError};
use crate::image_proc::{fft2, fft_freq, Image};

#[derive(Debug, Deserialize)]
struct CorrelationFile {
    dx: Option<f64>,
    values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationFunction {
    dx: f64,
    values: Array2<f64>,
}

impl CorrelationFunction {
    /// Build from a table with the zero lag in the center. Both dimensions
    /// must be odd.
    pub fn new(dx: f64, values: Array2<f64>) -> Result<Self> {
        let (nrow, ncol) = values.dim();
        if nrow % 2 == 0 || ncol % 2 == 0 {
            return Err(StampError::config(format!(
                "correlation table must have odd dimensions, got {nrow}x{ncol}"
            )));
        }
        if !(dx > 0.0) {
            return Err(StampError::config(format!(
                "correlation spacing must be positive, got {dx}"
            )));
        }
        Ok(Self { dx, values })
    }

    /// Uncorrelated noise of the given variance.
    pub fn white(variance: f64) -> Self {
        Self {
            dx: 1.0,
            values: Array2::from_elem((1, 1), variance),
        }
    }

    pub fn from_json_str(text: &str, default_dx: f64) -> Result<Self> {
        let file: CorrelationFile = serde_json::from_str(text)?;
        let nrow = file.values.len();
        let ncol = file.values.first().map_or(0, Vec::len);
        if file.values.iter().any(|row| row.len() != ncol) {
            return Err(StampError::config("correlation table rows differ in length"));
        }
        let flat: Vec<f64> = file.values.into_iter().flatten().collect();
        let values = Array2::from_shape_vec((nrow, ncol), flat)
            .map_err(|e| StampError::config(format!("correlation table: {e}")))?;
        Self::new(file.dx.unwrap_or(default_dx), values)
    }

    pub fn from_path(path: impl AsRef<Path>, default_dx: f64) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text, default_dx)
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    fn zero_lag_index(&self) -> (usize, usize) {
        let (nrow, ncol) = self.values.dim();
        (nrow / 2, ncol / 2)
    }

    /// Zero-lag value.
    pub fn variance(&self) -> f64 {
        self.values[self.zero_lag_index()]
    }

    /// The same shape, rescaled to the given zero-lag variance.
    pub fn with_variance(&self, variance: f64) -> Result<Self> {
        let current = self.variance();
        if !(current > 0.0) {
            return Err(StampError::config(
                "cannot rescale a correlation function with zero variance",
            ));
        }
        let factor = variance / current;
        Ok(Self {
            dx: self.dx,
            values: self.values.mapv(|v| v * factor),
        })
    }

    /// Remove an uncorrelated component of variance `variance`.
    pub fn subtract_white(&self, variance: f64) -> Self {
        let mut out = self.clone();
        let center = out.zero_lag_index();
        out.values[center] -= variance;
        out
    }

    /// Covariance at a lag in arcsec, nearest table entry, zero outside.
    pub fn value_at(&self, lag_x: f64, lag_y: f64) -> f64 {
        if self.values.len() == 1 {
            return if lag_x == 0.0 && lag_y == 0.0 {
                self.values[[0, 0]]
            } else {
                0.0
            };
        }
        let (cy, cx) = self.zero_lag_index();
        let ix = (lag_x / self.dx).round() as i64 + cx as i64;
        let iy = (lag_y / self.dx).round() as i64 + cy as i64;
        if ix < 0 || iy < 0 {
            return 0.0;
        }
        self.values
            .get([iy as usize, ix as usize])
            .copied()
            .unwrap_or(0.0)
    }

    /// Power spectrum on an `nrow × ncol` periodic grid with pixel `scale`.
    pub fn power_spectrum(&self, nrow: usize, ncol: usize, scale: f64) -> Array2<f64> {
        let mut grid = Array2::from_shape_fn((nrow, ncol), |(r, c)| {
            let lag_x = fft_freq(c, ncol) as f64 * scale;
            let lag_y = fft_freq(r, nrow) as f64 * scale;
            Complex64::new(self.value_at(lag_x, lag_y), 0.0)
        });
        fft2(&mut grid, FftDirection::Forward);
        grid.mapv(|v| v.re)
    }

    /// Add a realization of this noise to `image`.
    pub fn add_to(&self, image: &mut Image, rng: &mut StdRng) {
        if image.is_empty() {
            return;
        }
        let ps = self.power_spectrum(image.nrow(), image.ncol(), image.scale());
        let field = colored_noise(&ps, rng);
        *image.array_mut() += &field;
    }
}

/// Gaussian field with the given (unnormalized DFT) power spectrum. Negative
/// power is clamped to zero.
pub fn colored_noise(ps: &Array2<f64>, rng: &mut StdRng) -> Array2<f64> {
    let n = ps.len() as f64;
    let mut grid = Array2::from_shape_fn(ps.dim(), |_| {
        Complex64::new(StandardNormal.sample(rng), 0.0)
    });
    fft2(&mut grid, FftDirection::Forward);
    grid.zip_mut_with(ps, |v, p| *v *= p.max(0.0).sqrt());
    fft2(&mut grid, FftDirection::Inverse);
    grid.mapv(|v| v.re / n)
}

/// Noise already present in a profile's image, recorded so it can be
/// whitened after drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicNoise {
    correlation: CorrelationFunction,
}

impl IntrinsicNoise {
    pub fn new(correlation: CorrelationFunction) -> Self {
        Self { correlation }
    }

    pub fn white(variance: f64) -> Self {
        Self::new(CorrelationFunction::white(variance))
    }

    pub fn variance(&self) -> f64 {
        self.correlation.variance()
    }

    /// Add noise with power `max P - P(k)` so the total noise in `image`
    /// becomes white. Returns the resulting flat variance.
    pub fn whiten(&self, image: &mut Image, rng: &mut StdRng) -> f64 {
        if image.is_empty() {
            return self.variance();
        }
        let ps = self
            .correlation
            .power_spectrum(image.nrow(), image.ncol(), image.scale());
        let max = ps.iter().copied().fold(f64::NEG_INFINITY, f64::max).max(0.0);
        let whitening = ps.mapv(|p| max - p.max(0.0));
        if whitening.iter().any(|p| *p > max * 1e-12) {
            let field = colored_noise(&whitening, rng);
            *image.array_mut() += &field;
        }
        max
    }
}
