//! Two-dimensional FFT over ndarray grids built from 1-D `rustfft` plans.

use ndarray::Array2;
use num_complex::Complex64;
use rustfft::{FftDirection, FftPlanner};

/// In-place unnormalized 2-D FFT: rows first, then columns.
pub fn fft2(data: &mut Array2<Complex64>, direction: FftDirection) {
    let (nrow, ncol) = data.dim();
    if nrow == 0 || ncol == 0 {
        return;
    }
    let mut planner = FftPlanner::<f64>::new();

    let row_fft = planner.plan_fft(ncol, direction);
    let mut buf = vec![Complex64::new(0.0, 0.0); ncol];
    for mut row in data.rows_mut() {
        buf.iter_mut().zip(row.iter()).for_each(|(b, v)| *b = *v);
        row_fft.process(&mut buf);
        row.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b);
    }

    let col_fft = planner.plan_fft(nrow, direction);
    let mut buf = vec![Complex64::new(0.0, 0.0); nrow];
    for mut col in data.columns_mut() {
        buf.iter_mut().zip(col.iter()).for_each(|(b, v)| *b = *v);
        col_fft.process(&mut buf);
        col.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b);
    }
}

/// Signed frequency index of FFT bin `i` on an `n`-point grid.
pub fn fft_freq(i: usize, n: usize) -> i64 {
    if i < n.div_ceil(2) {
        i as i64
    } else {
        i as i64 - n as i64
    }
}
