//! Parallel processing utilities for image and array operations
//!
//! Arrays are split into row chunks that are processed in parallel with
//! deterministic per-chunk seeding, so the result depends only on the base
//! seed and the chunk size, never on the thread schedule.

use ndarray::{Array2, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Default number of rows per chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 64;

/// Process an Array2 in place in parallel chunks with deterministic seeding
///
/// Each row chunk gets its own RNG seeded from the base seed plus the chunk
/// index.
///
/// # Arguments
/// * `array` - The 2D array to process, modified in place
/// * `seed` - Base seed for random number generation
/// * `chunk_size` - Optional chunk size (number of rows per chunk). Defaults to 64 if None.
/// * `processor` - Closure that processes each chunk with its own RNG
pub fn process_array_in_parallel_chunks<F>(
    array: &mut Array2<f64>,
    seed: u64,
    chunk_size: Option<usize>,
    processor: F,
) where
    F: Fn(&mut ArrayViewMut2<f64>, &mut StdRng) + Send + Sync,
{
    let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_ROWS).max(1);
    if array.is_empty() {
        return;
    }

    array
        .axis_chunks_iter_mut(Axis(0), chunk_size)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk_idx, mut chunk)| {
            let chunk_seed = seed.wrapping_add(chunk_idx as u64);
            let mut rng = StdRng::seed_from_u64(chunk_seed);
            processor(&mut chunk, &mut rng);
        });
}
