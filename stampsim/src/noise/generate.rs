//! In-place noise generators over stamp images.
//!
//! Every generator draws its base seed from the caller's RNG and fills the
//! image in parallel row chunks, so the same object seed always produces the
//! same noise field regardless of thread count.

use rand::rngs::StdRng;
use rand::RngCore;
use rand_distr::{Distribution, Normal, Poisson};

use crate::algo::process_array_in_parallel_chunks;
use crate::error::{Result, StampError};
use crate::image_proc::Image;

const NOISE_CHUNK_ROWS: usize = 16;

/// Poisson draw that treats non-positive means as zero.
fn poisson_sample(mean: f64, rng: &mut StdRng) -> f64 {
    if mean > 0.0 {
        Poisson::new(mean).map_or(0.0, |d| d.sample(rng))
    } else {
        0.0
    }
}

fn normal(sigma: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, sigma)
        .map_err(|e| StampError::config(format!("invalid gaussian sigma {sigma}: {e}")))
}

/// Add zero-mean Gaussian noise of standard deviation `sigma`.
pub fn add_gaussian_noise(image: &mut Image, sigma: f64, rng: &mut StdRng) -> Result<()> {
    if sigma == 0.0 {
        return Ok(());
    }
    let dist = normal(sigma)?;
    process_array_in_parallel_chunks(
        image.array_mut(),
        rng.next_u64(),
        Some(NOISE_CHUNK_ROWS),
        |chunk, rng| {
            chunk.iter_mut().for_each(|pixel| *pixel += dist.sample(rng));
        },
    );
    Ok(())
}

/// Replace each pixel by a Poisson realization of itself plus `extra` sky,
/// counted in electrons with `gain` electrons per image unit, then remove the
/// extra sky again and add Gaussian read noise.
///
/// `pixel = Poisson((pixel + extra) * gain) / gain - extra + N(0, read_noise)`
pub fn add_ccd_noise(
    image: &mut Image,
    extra: f64,
    gain: f64,
    read_noise: f64,
    rng: &mut StdRng,
) -> Result<()> {
    if !(gain > 0.0) {
        return Err(StampError::config(format!("gain must be positive, got {gain}")));
    }
    let read = (read_noise > 0.0).then(|| normal(read_noise)).transpose()?;
    process_array_in_parallel_chunks(
        image.array_mut(),
        rng.next_u64(),
        Some(NOISE_CHUNK_ROWS),
        |chunk, rng| {
            chunk.iter_mut().for_each(|pixel| {
                let electrons = poisson_sample((*pixel + extra) * gain, rng);
                *pixel = electrons / gain - extra;
                if let Some(read) = &read {
                    *pixel += read.sample(rng);
                }
            });
        },
    );
    Ok(())
}

/// Poisson noise on the pixel values themselves plus `extra` sky.
pub fn add_poisson_noise(image: &mut Image, extra: f64, rng: &mut StdRng) -> Result<()> {
    add_ccd_noise(image, extra, 1.0, 0.0, rng)
}

/// Add the fluctuation of a Poisson deviate of fixed mean without touching
/// the existing signal: `pixel += Poisson(mean * gain) / gain - mean`.
pub fn add_deviate_noise(image: &mut Image, mean: f64, gain: f64, rng: &mut StdRng) -> Result<()> {
    if mean == 0.0 {
        return Ok(());
    }
    if !(gain > 0.0) {
        return Err(StampError::config(format!("gain must be positive, got {gain}")));
    }
    process_array_in_parallel_chunks(
        image.array_mut(),
        rng.next_u64(),
        Some(NOISE_CHUNK_ROWS),
        |chunk, rng| {
            chunk.iter_mut().for_each(|pixel| {
                *pixel += poisson_sample(mean * gain, rng) / gain - mean;
            });
        },
    );
    Ok(())
}
