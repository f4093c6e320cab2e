//! Analytic light profiles.
//!
//! A [`Profile`] is a surface-brightness distribution that can be evaluated in
//! Fourier space ([`Profile::k_value`]) and sampled with photons
//! ([`Profile::shoot`]). Profiles carry a flux, a linear transform built from
//! shears and rotations, and a shift. Convolutions are products in Fourier
//! space and sums of photon offsets.
//!
//! All lengths are in arcsec.

pub mod builder;
pub mod draw;

use std::f64::consts::PI;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Gamma, Normal};

pub use builder::{BuildOutcome, ConfigProfileBuilder, ProfileBuilder, ProfileKey};
pub use draw::PhotonBudget;

use crate::error::{Result, StampError};
use crate::image_proc::Position;
use crate::noise::IntrinsicNoise;

/// Ratio of FWHM to sigma for a Gaussian.
pub const GAUSSIAN_FWHM_FACTOR: f64 = 2.354_820_045_030_949_3;
/// Ratio of half-light radius to sigma for a Gaussian.
pub const GAUSSIAN_HLR_FACTOR: f64 = 1.177_410_022_515_474_7;
/// Ratio of half-light radius to scale radius for an exponential disk.
pub const EXPONENTIAL_HLR_FACTOR: f64 = 1.678_346_990_016_660_5;

/// Reduced shear `g = g1 + i g2`, `|g| < 1`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Shear {
    pub g1: f64,
    pub g2: f64,
}

impl Shear {
    pub fn new(g1: f64, g2: f64) -> Result<Self> {
        if !(g1.is_finite() && g2.is_finite()) || g1.hypot(g2) >= 1.0 {
            return Err(StampError::config(format!(
                "shear magnitude must be < 1, got ({g1}, {g2})"
            )));
        }
        Ok(Self { g1, g2 })
    }

    /// Shear with magnitude `g` along position angle `beta` (radians).
    pub fn from_g_beta(g: f64, beta: f64) -> Result<Self> {
        Self::new(g * (2.0 * beta).cos(), g * (2.0 * beta).sin())
    }

    /// From distortion `e = (a² - b²)/(a² + b²)`.
    pub fn from_e_beta(e: f64, beta: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&e.abs()) {
            return Err(StampError::config(format!("distortion must be < 1, got {e}")));
        }
        Self::from_g_beta(e / (1.0 + (1.0 - e * e).sqrt()), beta)
    }

    /// From axis ratio `q = b/a`.
    pub fn from_q_beta(q: f64, beta: f64) -> Result<Self> {
        if !(q > 0.0 && q <= 1.0) {
            return Err(StampError::config(format!("axis ratio must be in (0, 1], got {q}")));
        }
        Self::from_g_beta((1.0 - q) / (1.0 + q), beta)
    }

    pub fn g(&self) -> f64 {
        self.g1.hypot(self.g2)
    }

    /// Area-preserving shear matrix.
    pub fn matrix(&self) -> [[f64; 2]; 2] {
        let norm = 1.0 / (1.0 - self.g1 * self.g1 - self.g2 * self.g2).sqrt();
        [
            [norm * (1.0 + self.g1), norm * self.g2],
            [norm * self.g2, norm * (1.0 - self.g1)],
        ]
    }
}

const IDENTITY: [[f64; 2]; 2] = [[1.0, 0.0], [0.0, 1.0]];

fn mat_mul(a: &[[f64; 2]; 2], b: &[[f64; 2]; 2]) -> [[f64; 2]; 2] {
    let mut out = [[0.0; 2]; 2];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    out
}

fn mat_apply(m: &[[f64; 2]; 2], x: f64, y: f64) -> (f64, f64) {
    (m[0][0] * x + m[0][1] * y, m[1][0] * x + m[1][1] * y)
}

fn det(m: &[[f64; 2]; 2]) -> f64 {
    m[0][0] * m[1][1] - m[0][1] * m[1][0]
}

/// Largest singular value.
fn spectral_norm(m: &[[f64; 2]; 2]) -> f64 {
    let a = m[0][0] * m[0][0] + m[1][0] * m[1][0];
    let d = m[0][1] * m[0][1] + m[1][1] * m[1][1];
    let b = m[0][0] * m[0][1] + m[1][0] * m[1][1];
    let tr = a + d;
    let disc = ((a - d) * (a - d) + 4.0 * b * b).sqrt();
    ((tr + disc) / 2.0).sqrt()
}

fn sinc(u: f64) -> f64 {
    if u.abs() < 1e-8 {
        1.0 - u * u / 6.0
    } else {
        u.sin() / u
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileKind {
    Gaussian { sigma: f64 },
    Exponential { scale_radius: f64 },
    /// Uniform box of width `xw` and height `yw`.
    Pixel { xw: f64, yw: f64 },
    Convolution(Vec<Profile>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    kind: ProfileKind,
    /// Flux for analytic kinds; a scale factor on the product of the
    /// component fluxes for a convolution.
    flux: f64,
    jacobian: [[f64; 2]; 2],
    shift: Position,
    noise: Option<IntrinsicNoise>,
}

fn positive(name: &str, value: f64) -> Result<f64> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(StampError::config(format!("{name} must be positive, got {value}")))
    }
}

impl Profile {
    fn analytic(kind: ProfileKind, flux: f64) -> Self {
        Self {
            kind,
            flux,
            jacobian: IDENTITY,
            shift: Position::default(),
            noise: None,
        }
    }

    pub fn gaussian(sigma: f64, flux: f64) -> Result<Self> {
        let sigma = positive("sigma", sigma)?;
        Ok(Self::analytic(ProfileKind::Gaussian { sigma }, flux))
    }

    pub fn exponential(scale_radius: f64, flux: f64) -> Result<Self> {
        let scale_radius = positive("scale_radius", scale_radius)?;
        Ok(Self::analytic(
            ProfileKind::Exponential { scale_radius },
            flux,
        ))
    }

    pub fn pixel(xw: f64, yw: f64, flux: f64) -> Result<Self> {
        let xw = positive("xw", xw)?;
        let yw = positive("yw", yw)?;
        Ok(Self::analytic(ProfileKind::Pixel { xw, yw }, flux))
    }

    /// Convolve the given profiles. A single profile is returned unchanged.
    /// The result inherits the first intrinsic noise found among the inputs.
    pub fn convolve(mut profiles: Vec<Profile>) -> Result<Self> {
        match profiles.len() {
            0 => Err(StampError::config("cannot convolve an empty list of profiles")),
            1 => Ok(profiles.remove(0)),
            _ => {
                let noise = profiles.iter().find_map(|p| p.noise.clone());
                let mut conv = Self::analytic(ProfileKind::Convolution(profiles), 1.0);
                conv.noise = noise;
                Ok(conv)
            }
        }
    }

    pub fn kind(&self) -> &ProfileKind {
        &self.kind
    }

    pub fn flux(&self) -> f64 {
        match &self.kind {
            ProfileKind::Convolution(parts) => {
                self.flux * parts.iter().map(Profile::flux).product::<f64>()
            }
            _ => self.flux,
        }
    }

    /// Same shape with total flux `flux`.
    pub fn with_flux(mut self, flux: f64) -> Self {
        match &self.kind {
            ProfileKind::Convolution(parts) => {
                let inner: f64 = parts.iter().map(Profile::flux).product();
                self.flux = if inner != 0.0 { flux / inner } else { 0.0 };
            }
            _ => self.flux = flux,
        }
        self
    }

    pub fn scale_flux(mut self, factor: f64) -> Self {
        self.flux *= factor;
        self
    }

    pub fn shift_offset(&self) -> Position {
        self.shift
    }

    pub fn noise(&self) -> Option<&IntrinsicNoise> {
        self.noise.as_ref()
    }

    pub fn with_noise(mut self, noise: IntrinsicNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    fn transform(mut self, m: &[[f64; 2]; 2]) -> Self {
        self.jacobian = mat_mul(m, &self.jacobian);
        let (x, y) = mat_apply(m, self.shift.x, self.shift.y);
        self.shift = Position::new(x, y);
        self
    }

    pub fn shear(self, shear: &Shear) -> Self {
        self.transform(&shear.matrix())
    }

    /// Rotate counter-clockwise by `theta` radians.
    pub fn rotate(self, theta: f64) -> Self {
        let (s, c) = theta.sin_cos();
        self.transform(&[[c, -s], [s, c]])
    }

    pub fn shift(mut self, dx: f64, dy: f64) -> Self {
        self.shift += Position::new(dx, dy);
        self
    }

    /// Fourier transform at wavevector `(kx, ky)` in radians per arcsec.
    pub fn k_value(&self, kx: f64, ky: f64) -> Complex64 {
        // The transformed profile I(J⁻¹x) has transform Ĩ(Jᵀk).
        let j = &self.jacobian;
        let ux = j[0][0] * kx + j[1][0] * ky;
        let uy = j[0][1] * kx + j[1][1] * ky;
        let base = match &self.kind {
            ProfileKind::Gaussian { sigma } => {
                Complex64::new(self.flux * (-0.5 * sigma * sigma * (ux * ux + uy * uy)).exp(), 0.0)
            }
            ProfileKind::Exponential { scale_radius } => {
                let r2k2 = scale_radius * scale_radius * (ux * ux + uy * uy);
                Complex64::new(self.flux / (1.0 + r2k2).powf(1.5), 0.0)
            }
            ProfileKind::Pixel { xw, yw } => Complex64::new(
                self.flux * sinc(0.5 * ux * xw) * sinc(0.5 * uy * yw),
                0.0,
            ),
            ProfileKind::Convolution(parts) => parts
                .iter()
                .fold(Complex64::new(self.flux, 0.0), |acc, p| acc * p.k_value(ux, uy)),
        };
        if self.shift.x == 0.0 && self.shift.y == 0.0 {
            base
        } else {
            base * Complex64::from_polar(1.0, -(kx * self.shift.x + ky * self.shift.y))
        }
    }

    /// Sample `n` photon positions from the normalized profile.
    pub fn shoot(&self, n: usize, rng: &mut StdRng) -> Result<Vec<Position>> {
        let mut photons = match &self.kind {
            ProfileKind::Gaussian { sigma } => {
                let normal = Normal::new(0.0, *sigma)
                    .map_err(|e| StampError::config(format!("gaussian sigma: {e}")))?;
                (0..n)
                    .map(|_| Position::new(normal.sample(rng), normal.sample(rng)))
                    .collect()
            }
            ProfileKind::Exponential { scale_radius } => {
                // Radial density r·exp(-r/r0) is Gamma(2, r0).
                let gamma = Gamma::new(2.0, *scale_radius)
                    .map_err(|e| StampError::config(format!("exponential radius: {e}")))?;
                (0..n)
                    .map(|_| {
                        let r = gamma.sample(rng);
                        let theta = 2.0 * PI * rng.random::<f64>();
                        Position::new(r * theta.cos(), r * theta.sin())
                    })
                    .collect()
            }
            ProfileKind::Pixel { xw, yw } => (0..n)
                .map(|_| {
                    Position::new(
                        xw * (rng.random::<f64>() - 0.5),
                        yw * (rng.random::<f64>() - 0.5),
                    )
                })
                .collect(),
            ProfileKind::Convolution(parts) => {
                let mut total = vec![Position::default(); n];
                for part in parts {
                    for (acc, p) in total.iter_mut().zip(part.shoot(n, rng)?) {
                        *acc += p;
                    }
                }
                total
            }
        };
        for p in photons.iter_mut() {
            let (x, y) = mat_apply(&self.jacobian, p.x, p.y);
            *p = Position::new(x, y) + self.shift;
        }
        Ok(photons)
    }

    /// Peak surface brightness per arcsec². Exact for analytic kinds, an
    /// upper bound for convolutions.
    pub fn max_sb(&self) -> f64 {
        let area = det(&self.jacobian).abs();
        let peak = match &self.kind {
            ProfileKind::Gaussian { sigma } => self.flux.abs() / (2.0 * PI * sigma * sigma),
            ProfileKind::Exponential { scale_radius } => {
                self.flux.abs() / (2.0 * PI * scale_radius * scale_radius)
            }
            ProfileKind::Pixel { xw, yw } => self.flux.abs() / (xw * yw),
            ProfileKind::Convolution(parts) => {
                let fluxes: Vec<f64> = parts.iter().map(|p| p.flux().abs()).collect();
                let bound = parts
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let others: f64 = fluxes
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, f)| f)
                            .product();
                        p.max_sb() * others
                    })
                    .fold(f64::INFINITY, f64::min);
                self.flux.abs() * bound
            }
        };
        if area > 0.0 {
            peak / area
        } else {
            peak
        }
    }

    /// Radius in arcsec, measured from the origin, that contains effectively
    /// all of the flux.
    pub fn extent(&self) -> f64 {
        let radius = match &self.kind {
            ProfileKind::Gaussian { sigma } => 5.0 * sigma,
            ProfileKind::Exponential { scale_radius } => 8.0 * scale_radius,
            ProfileKind::Pixel { xw, yw } => 0.5 * xw.hypot(*yw),
            ProfileKind::Convolution(parts) => parts.iter().map(Profile::extent).sum(),
        };
        radius * spectral_norm(&self.jacobian) + self.shift.norm()
    }
}
