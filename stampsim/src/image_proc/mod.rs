//! Image primitives: integer bounds, pixel grids with an origin, FFT helpers
//! and PNG conversion.

pub mod fft;
pub mod image;

pub use self::fft::{fft2, fft_freq};
pub use self::image::{array2_to_gray_image, BadPixImage, Bounds, Image, ImageBase, Position};
