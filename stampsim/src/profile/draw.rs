//! Rendering profiles onto pixel grids.
//!
//! # Fourier drawing
//!
//! The profile's transform is sampled on an `nfft × nfft` grid of
//! wavevectors `k = 2π m / (nfft · scale)`, inverse transformed, and the
//! central region copied into the stamp. Each pixel receives the surface
//! brightness at its center times the pixel area, so the pixel sum equals the
//! transform at `k = 0`, i.e. the flux. Including a pixel-response profile
//! in the convolution turns the point samples into pixel integrals.
//!
//! # Photon shooting
//!
//! Photons are drawn from the profile and binned into the pixel that contains
//! them. Each photon carries `flux / n` of the total. Photons are shot in
//! batches of [`PHOTON_BATCH`], and a budget above [`MAX_PHOTONS`] is
//! rejected rather than run.

use ndarray::Array2;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rustfft::FftDirection;

use super::Profile;
use crate::error::{Result, StampError};
use crate::image_proc::{fft2, fft_freq, Image, Position};

const MIN_FFT_SIZE: usize = 16;

/// Largest `nfft` a Fourier draw may allocate.
pub const MAX_FFT_SIZE: usize = 8192;

/// Largest photon count a single draw may shoot.
pub const MAX_PHOTONS: usize = 100_000_000;

/// Photons sampled per batch.
pub const PHOTON_BATCH: usize = 100_000;

/// How many photons to shoot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhotonBudget {
    /// Shoot exactly this many photons.
    Count(usize),
    /// Use as few photons as possible while keeping the extra per-pixel
    /// variance from finite sampling below this value. Zero or less means
    /// one photon per unit of flux.
    MaxExtraNoise(f64),
}

impl PhotonBudget {
    /// Photon count for a profile drawn at `scale`.
    pub fn photon_count(&self, profile: &Profile, scale: f64) -> Result<usize> {
        let flux = profile.flux().abs();
        let n = match *self {
            PhotonBudget::Count(n) => n.max(1) as f64,
            PhotonBudget::MaxExtraNoise(v) => {
                let peak = profile.max_sb() * scale * scale;
                // A photon of flux g adds variance (g - 1) per unit of pixel flux.
                let g = if v > 0.0 && peak > 0.0 && peak.is_finite() {
                    1.0 + v / peak
                } else {
                    1.0
                };
                (flux / g).ceil().max(1.0)
            }
        };
        if !(n <= MAX_PHOTONS as f64) {
            return Err(StampError::TooManyPhotons {
                required: n,
                maximum: MAX_PHOTONS,
            });
        }
        Ok(n as usize)
    }
}

impl Profile {
    /// Default stamp edge for this profile: even, at least 2 pixels.
    pub fn default_size(&self, scale: f64, wmult: f64) -> usize {
        let half = (wmult * self.extent() / scale).ceil();
        if half.is_finite() && half >= 1.0 {
            2 * half as usize
        } else {
            2
        }
    }

    /// Fresh zeroed stamp of the requested size, auto-sized when either
    /// dimension is zero, anchored at `(1, 1)`.
    pub fn stamp_image(&self, xsize: usize, ysize: usize, scale: f64, wmult: f64) -> Image {
        if xsize > 0 && ysize > 0 {
            Image::zeros(xsize, ysize, scale)
        } else {
            let n = self.default_size(scale, wmult);
            Image::zeros(n, n, scale)
        }
    }

    /// Draw into `image` with Fourier sampling, replacing its contents. The
    /// profile center lands at the image's true center plus `offset` pixels.
    pub fn draw(&self, image: &mut Image, offset: Position) -> Result<()> {
        let Some(bounds) = image.bounds() else {
            return Ok(());
        };
        let scale = image.scale();
        let (nx, ny) = (bounds.ncol(), bounds.nrow());

        let span = 4.0 * (self.extent() / scale).ceil();
        let needed = ((2 * nx.max(ny)).max(MIN_FFT_SIZE) as f64).max(span);
        if !(needed <= MAX_FFT_SIZE as f64) {
            return Err(StampError::FftTooLarge {
                required: if needed.is_finite() { needed as usize } else { usize::MAX },
                maximum: MAX_FFT_SIZE,
            });
        }
        let nfft = (needed as usize).next_power_of_two();

        let center = bounds.true_center() + offset;
        let (icx, icy) = (center.x.floor(), center.y.floor());
        // Sub-pixel part of the center, in arcsec.
        let frac = Position::new((center.x - icx) * scale, (center.y - icy) * scale);

        let dk = 2.0 * std::f64::consts::PI / (nfft as f64 * scale);
        let mut grid = Array2::from_shape_fn((nfft, nfft), |(my, mx)| {
            let (fx, fy) = (fft_freq(mx, nfft), fft_freq(my, nfft));
            let (kx, ky) = (fx as f64 * dk, fy as f64 * dk);
            let phase = Complex64::from_polar(1.0, -(kx * frac.x + ky * frac.y));
            // Moves the spatial origin to the middle of the grid.
            let sign = if (fx + fy).rem_euclid(2) == 0 { 1.0 } else { -1.0 };
            self.k_value(kx, ky) * phase * sign
        });
        fft2(&mut grid, FftDirection::Inverse);

        let norm = 1.0 / (nfft * nfft) as f64;
        let half = (nfft / 2) as i64;
        let (icx, icy) = (icx as i64, icy as i64);
        for ((row, col), pixel) in image.array_mut().indexed_iter_mut() {
            let x = bounds.xmin + col as i64;
            let y = bounds.ymin + row as i64;
            let gx = x - icx + half;
            let gy = y - icy + half;
            *pixel = if (0..nfft as i64).contains(&gx) && (0..nfft as i64).contains(&gy) {
                grid[[gy as usize, gx as usize]].re * norm
            } else {
                0.0
            };
        }
        Ok(())
    }

    /// Shoot photons into `image`, adding to its contents. Returns the number
    /// of photons shot.
    pub fn draw_shoot(
        &self,
        image: &mut Image,
        budget: PhotonBudget,
        offset: Position,
        rng: &mut StdRng,
    ) -> Result<usize> {
        let Some(bounds) = image.bounds() else {
            return Ok(0);
        };
        let scale = image.scale();
        if scale <= 0.0 {
            return Err(StampError::config("photon shooting needs a positive pixel scale"));
        }
        let n = budget.photon_count(self, scale)?;
        let photon_flux = self.flux() / n as f64;
        let center = bounds.true_center() + offset;

        let array = image.array_mut();
        let mut remaining = n;
        while remaining > 0 {
            let batch = remaining.min(PHOTON_BATCH);
            for photon in self.shoot(batch, rng)? {
                let px = center.x + photon.x / scale;
                let py = center.y + photon.y / scale;
                let ix = (px + 0.5).floor() as i64;
                let iy = (py + 0.5).floor() as i64;
                if bounds.contains(ix, iy) {
                    array[[(iy - bounds.ymin) as usize, (ix - bounds.xmin) as usize]] +=
                        photon_flux;
                }
            }
            remaining -= batch;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn centroid(image: &Image) -> Position {
        let b = image.bounds().unwrap();
        let total = image.sum();
        let (mut sx, mut sy) = (0.0, 0.0);
        for ((row, col), v) in image.array().indexed_iter() {
            sx += v * (b.xmin + col as i64) as f64;
            sy += v * (b.ymin + row as i64) as f64;
        }
        Position::new(sx / total, sy / total)
    }

    #[test]
    fn test_fft_draw_conserves_flux() {
        let p = Profile::convolve(vec![
            Profile::gaussian(0.6, 250.0).unwrap(),
            Profile::pixel(0.2, 0.2, 1.0).unwrap(),
        ])
        .unwrap();
        let mut image = Image::zeros(48, 48, 0.2);
        p.draw(&mut image, Position::default()).unwrap();
        assert_relative_eq!(image.sum(), 250.0, max_relative = 1e-6);
        assert!(image.array().iter().all(|v| *v > -1e-9));
    }

    #[test]
    fn test_fft_draw_centroid_follows_offset() {
        let p = Profile::gaussian(1.0, 1.0).unwrap();
        let mut image = Image::zeros(64, 64, 0.25);
        p.draw(&mut image, Position::new(0.3, -0.2)).unwrap();
        let c = centroid(&image);
        assert_relative_eq!(c.x, 32.5 + 0.3, epsilon = 1e-6);
        assert_relative_eq!(c.y, 32.5 - 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_fft_draw_profile_shift_in_arcsec() {
        let p = Profile::gaussian(0.5, 1.0).unwrap().shift(0.5, 0.0);
        let mut image = Image::zeros(33, 33, 0.25);
        p.draw(&mut image, Position::default()).unwrap();
        let c = centroid(&image);
        assert_relative_eq!(c.x, 17.0 + 2.0, epsilon = 1e-6);
        assert_relative_eq!(c.y, 17.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shoot_conserves_flux_inside_stamp() {
        let p = Profile::gaussian(0.5, 1000.0).unwrap();
        let mut image = Image::zeros(40, 40, 0.2);
        let mut rng = StdRng::seed_from_u64(3);
        let n = p
            .draw_shoot(&mut image, PhotonBudget::Count(5000), Position::default(), &mut rng)
            .unwrap();
        assert_eq!(n, 5000);
        assert_relative_eq!(image.sum(), 1000.0, max_relative = 1e-9);
        let c = centroid(&image);
        assert_relative_eq!(c.x, 20.5, epsilon = 0.1);
        assert_relative_eq!(c.y, 20.5, epsilon = 0.1);
    }

    #[test]
    fn test_photon_count_from_extra_noise() {
        let p = Profile::gaussian(1.0, 1000.0).unwrap();
        assert_eq!(PhotonBudget::MaxExtraNoise(0.0).photon_count(&p, 1.0).unwrap(), 1000);
        let peak = p.max_sb();
        let n = PhotonBudget::MaxExtraNoise(peak).photon_count(&p, 1.0).unwrap();
        assert_eq!(n, 500);
        assert_eq!(PhotonBudget::Count(0).photon_count(&p, 1.0).unwrap(), 1);
    }

    #[test]
    fn test_photon_budget_ceiling() {
        let p = Profile::gaussian(1.0, 1e15).unwrap();
        let mut image = Image::zeros(16, 16, 1.0);
        let mut rng = StdRng::seed_from_u64(8);
        let err = p
            .draw_shoot(&mut image, PhotonBudget::MaxExtraNoise(0.0), Position::default(), &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            StampError::TooManyPhotons { maximum: MAX_PHOTONS, .. }
        ));
        assert!(image.array().iter().all(|v| *v == 0.0));

        let err = PhotonBudget::Count(MAX_PHOTONS + 1)
            .photon_count(&p, 1.0)
            .unwrap_err();
        assert!(matches!(err, StampError::TooManyPhotons { .. }));
    }

    #[test]
    fn test_shoot_spans_several_batches() {
        let p = Profile::gaussian(0.5, 5.0).unwrap();
        let mut image = Image::zeros(32, 32, 0.2);
        let mut rng = StdRng::seed_from_u64(9);
        let count = 2 * PHOTON_BATCH + 17;
        let n = p
            .draw_shoot(&mut image, PhotonBudget::Count(count), Position::default(), &mut rng)
            .unwrap();
        assert_eq!(n, count);
        assert_relative_eq!(image.sum(), 5.0, max_relative = 1e-9);
    }

    #[test]
    fn test_fft_size_ceiling() {
        let p = Profile::gaussian(2000.0, 1.0).unwrap();
        let mut image = Image::zeros(32, 32, 1.0);
        let err = p.draw(&mut image, Position::default()).unwrap_err();
        match err {
            StampError::FftTooLarge { required, maximum } => {
                assert_eq!(maximum, MAX_FFT_SIZE);
                assert!(required > MAX_FFT_SIZE);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_default_size_is_even() {
        let p = Profile::gaussian(1.0, 1.0).unwrap();
        assert_eq!(p.default_size(1.0, 1.0), 10);
        assert_eq!(p.default_size(0.3, 1.0), 34);
        let im = p.stamp_image(0, 0, 1.0, 2.0);
        assert_eq!((im.ncol(), im.nrow()), (20, 20));
    }
}
