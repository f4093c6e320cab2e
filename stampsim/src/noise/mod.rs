//! Noise models for rendered stamps.
//!
//! A [`NoiseSpec`] is parsed from `image.noise` for each object and then
//! either queried for its variance ([`NoiseSpec::variance`]) or applied to a
//! drawn stamp ([`add_noise`]).
//!
//! Fourier-drawn stamps are noiseless, so the Poisson and CCD models draw
//! shot noise for the signal and the sky together. Photon-shot stamps already
//! carry the signal's shot noise; only the sky fluctuation is added.
//!
//! If whitening has put noise of variance `current_var` into the stamp, that
//! amount is taken off the requested noise. Asking for less noise than is
//! already present is an error.

pub mod correlated;
pub mod generate;

use std::path::PathBuf;

use log::debug;
use rand::rngs::StdRng;
use serde_json::Value;

pub use correlated::{CorrelationFunction, IntrinsicNoise};

use crate::config::{check_all_params, resolve, resolve_required, ParamSpec};
use crate::error::{Result, StampError};
use crate::image_proc::Image;
use crate::stamp::StampContext;

/// Default pixel scale of COSMOS correlation tables, in arcsec.
pub const DEFAULT_DX_COSMOS: f64 = 0.03;

/// How the stamp was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Fourier,
    Photon,
}

/// Sky level given per arcsec² or per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkyLevel {
    PerArcsec2(f64),
    PerPixel(f64),
}

impl SkyLevel {
    pub fn per_pixel(&self, pixel_scale: f64) -> f64 {
        match *self {
            SkyLevel::PerArcsec2(level) => level * pixel_scale * pixel_scale,
            SkyLevel::PerPixel(level) => level,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianParams {
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoissonParams {
    /// Sky on top of the image sky, if any.
    pub sky: Option<SkyLevel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CcdParams {
    pub sky: Option<SkyLevel>,
    /// Electrons per image unit.
    pub gain: f64,
    /// Read noise in image units.
    pub read_noise: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CosmosParams {
    pub file_name: PathBuf,
    pub dx_cosmos: f64,
    pub variance: Option<f64>,
    /// The loaded table, rescaled to `variance` when one is given.
    pub correlation: CorrelationFunction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoiseSpec {
    Gaussian(GaussianParams),
    Poisson(PoissonParams),
    Ccd(CcdParams),
    Cosmos(CosmosParams),
}

fn sky_params(
    noise: &Value,
    type_name: &str,
    image_sky_present: bool,
    opt: &[&str],
    ctx: &mut StampContext,
) -> Result<Option<SkyLevel>> {
    const SKY: &[&str] = &["sky_level", "sky_level_pixel"];
    let name = format!("noise.type = {type_name}");
    let with_sky: Vec<&str> = opt.iter().chain(SKY).copied().collect();
    let spec = if image_sky_present {
        ParamSpec {
            opt: &with_sky,
            ..ParamSpec::default()
        }
    } else {
        ParamSpec {
            opt,
            single: &[SKY],
            ..ParamSpec::default()
        }
    };
    check_all_params(noise, &name, &spec)?;

    let sky_level = resolve::<f64>(noise, "sky_level", ctx)?;
    let sky_level_pixel = resolve::<f64>(noise, "sky_level_pixel", ctx)?;
    match (sky_level, sky_level_pixel) {
        (Some(_), Some(_)) => Err(StampError::config(format!(
            "only one of sky_level and sky_level_pixel is allowed for {name}"
        ))),
        (Some(level), None) => Ok(Some(SkyLevel::PerArcsec2(level))),
        (None, Some(level)) => Ok(Some(SkyLevel::PerPixel(level))),
        (None, None) => Ok(None),
    }
}

impl NoiseSpec {
    /// Parse and validate `image.noise`. `image_sky_present` says whether
    /// the image has a sky level of its own, which makes the noise sky
    /// optional.
    pub fn from_config(
        noise: &Value,
        ctx: &mut StampContext,
        image_sky_present: bool,
    ) -> Result<Self> {
        if !noise.is_object() {
            return Err(StampError::config("image.noise is not a dict"));
        }
        let type_name = match noise.get("type") {
            None => "Poisson",
            Some(Value::String(s)) => s.as_str(),
            Some(other) => return Err(StampError::UnknownNoiseType(other.to_string())),
        };

        match type_name {
            "Gaussian" => {
                check_all_params(
                    noise,
                    "noise.type = Gaussian",
                    &ParamSpec {
                        single: &[&["sigma", "variance"]],
                        ..ParamSpec::default()
                    },
                )?;
                let variance = match resolve::<f64>(noise, "sigma", ctx)? {
                    Some(sigma) => sigma * sigma,
                    None => resolve_required::<f64>(noise, "variance", ctx)?,
                };
                if variance < 0.0 || variance.is_nan() {
                    return Err(StampError::config(format!(
                        "gaussian noise variance must be non-negative, got {variance}"
                    )));
                }
                Ok(NoiseSpec::Gaussian(GaussianParams { variance }))
            }
            "Poisson" => {
                let sky = sky_params(noise, type_name, image_sky_present, &[], ctx)?;
                Ok(NoiseSpec::Poisson(PoissonParams { sky }))
            }
            "CCD" => {
                let sky =
                    sky_params(noise, type_name, image_sky_present, &["gain", "read_noise"], ctx)?;
                let gain = resolve::<f64>(noise, "gain", ctx)?.unwrap_or(1.0);
                let read_noise = resolve::<f64>(noise, "read_noise", ctx)?.unwrap_or(0.0);
                if !(gain > 0.0) {
                    return Err(StampError::config(format!("CCD gain must be positive, got {gain}")));
                }
                if read_noise < 0.0 || read_noise.is_nan() {
                    return Err(StampError::config(format!(
                        "CCD read_noise must be non-negative, got {read_noise}"
                    )));
                }
                Ok(NoiseSpec::Ccd(CcdParams {
                    sky,
                    gain,
                    read_noise,
                }))
            }
            "COSMOS" => {
                check_all_params(
                    noise,
                    "noise.type = COSMOS",
                    &ParamSpec {
                        req: &["file_name"],
                        opt: &["dx_cosmos", "variance"],
                        ..ParamSpec::default()
                    },
                )?;
                let file_name = PathBuf::from(resolve_required::<String>(noise, "file_name", ctx)?);
                let dx_cosmos = resolve::<f64>(noise, "dx_cosmos", ctx)?;
                let variance = resolve::<f64>(noise, "variance", ctx)?;
                let mut correlation = CorrelationFunction::from_path(
                    &file_name,
                    dx_cosmos.unwrap_or(DEFAULT_DX_COSMOS),
                )?;
                if let Some(dx) = dx_cosmos {
                    correlation = CorrelationFunction::new(dx, correlation.values().clone())?;
                }
                if let Some(variance) = variance {
                    if variance < 0.0 || variance.is_nan() {
                        return Err(StampError::config(format!(
                            "COSMOS variance must be non-negative, got {variance}"
                        )));
                    }
                    correlation = correlation.with_variance(variance)?;
                }
                Ok(NoiseSpec::Cosmos(CosmosParams {
                    file_name,
                    dx_cosmos: correlation.dx(),
                    variance,
                    correlation,
                }))
            }
            other => Err(StampError::UnknownNoiseType(other.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NoiseSpec::Gaussian(_) => "Gaussian",
            NoiseSpec::Poisson(_) => "Poisson",
            NoiseSpec::Ccd(_) => "CCD",
            NoiseSpec::Cosmos(_) => "COSMOS",
        }
    }

    /// Per-pixel variance this noise model targets, including the image sky.
    pub fn variance(&self, pixel_scale: f64, sky_level_pixel: f64) -> f64 {
        let total_sky =
            |sky: &Option<SkyLevel>| sky_level_pixel + sky.map_or(0.0, |s| s.per_pixel(pixel_scale));
        match self {
            NoiseSpec::Gaussian(p) => p.variance,
            NoiseSpec::Poisson(p) => total_sky(&p.sky),
            NoiseSpec::Ccd(p) => total_sky(&p.sky) / p.gain + p.read_noise * p.read_noise,
            NoiseSpec::Cosmos(p) => p.correlation.variance(),
        }
    }

    fn conflict(&self, requested: f64, current: f64) -> StampError {
        StampError::NoiseConflict {
            noise_type: self.type_name(),
            requested,
            current,
        }
    }
}

/// Inputs to [`add_noise`] besides the images and the spec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseInputs {
    /// Variance already added by whitening.
    pub current_var: f64,
    /// Image-level sky per pixel, added before the noise.
    pub sky_level_pixel: f64,
    pub mode: DrawMode,
    /// Put the object's own variance into the weight image.
    pub include_obj_var: bool,
}

/// Add the image sky and the noise described by `spec` to `image`,
/// accumulating the expected variance into `weight` when given.
pub fn add_noise(
    image: &mut Image,
    mut weight: Option<&mut Image>,
    spec: &NoiseSpec,
    inputs: NoiseInputs,
    rng: &mut StdRng,
) -> Result<()> {
    let NoiseInputs {
        current_var,
        sky_level_pixel,
        mode,
        include_obj_var,
    } = inputs;
    let scale = image.scale();

    if sky_level_pixel != 0.0 {
        image.add_scalar(sky_level_pixel);
    }

    match spec {
        NoiseSpec::Gaussian(p) => {
            if p.variance < current_var {
                return Err(spec.conflict(p.variance, current_var));
            }
            let sigma = (p.variance - current_var).sqrt();
            generate::add_gaussian_noise(image, sigma, rng)?;
            if let Some(w) = weight.as_deref_mut() {
                w.add_scalar(sigma * sigma + current_var);
            }
            debug!("added gaussian noise with sigma = {sigma:.4}");
        }
        NoiseSpec::Poisson(p) => {
            let extra = p.sky.map_or(0.0, |s| s.per_pixel(scale));
            let total = sky_level_pixel + extra;
            if total < current_var {
                return Err(spec.conflict(total, current_var));
            }
            if let Some(w) = weight.as_deref_mut() {
                if include_obj_var {
                    w.copy_from(image)?;
                    w.add_scalar(extra);
                } else {
                    w.add_scalar(total);
                }
            }
            match mode {
                DrawMode::Fourier => generate::add_poisson_noise(image, extra - current_var, rng)?,
                DrawMode::Photon => {
                    generate::add_deviate_noise(image, total - current_var, 1.0, rng)?
                }
            }
            debug!("added poisson noise with sky_level_pixel = {total:.4}");
        }
        NoiseSpec::Ccd(p) => {
            let extra = p.sky.map_or(0.0, |s| s.per_pixel(scale));
            let total = sky_level_pixel + extra;
            let gain = p.gain;
            let mut read_var = p.read_noise * p.read_noise;
            let requested = total / gain + read_var;
            if requested < current_var {
                return Err(spec.conflict(requested, current_var));
            }
            if let Some(w) = weight.as_deref_mut() {
                if include_obj_var {
                    w.copy_from(image)?;
                    w.add_scalar(extra);
                    w.scale_by(1.0 / gain);
                    w.add_scalar(read_var);
                } else {
                    w.add_scalar(requested);
                }
            }

            // Whitening noise comes out of the read noise first, being
            // Gaussian already; the rest is taken off the sky.
            let mut sky_removed = 0.0;
            if read_var >= current_var {
                read_var -= current_var;
            } else {
                sky_removed = (current_var - read_var) * gain;
                read_var = 0.0;
            }
            let read_noise = read_var.sqrt();
            match mode {
                DrawMode::Fourier => {
                    generate::add_ccd_noise(image, extra - sky_removed, gain, read_noise, rng)?
                }
                DrawMode::Photon => {
                    generate::add_deviate_noise(image, total - sky_removed, gain, rng)?;
                    generate::add_gaussian_noise(image, read_noise, rng)?;
                }
            }
            debug!(
                "added CCD noise with sky_level_pixel = {:.4}, gain = {gain:.4}, read_noise = {read_noise:.4}",
                total - sky_removed
            );
        }
        NoiseSpec::Cosmos(p) => {
            let cn_var = p.correlation.variance();
            if cn_var < current_var {
                return Err(spec.conflict(cn_var, current_var));
            }
            let correlation = if current_var > 0.0 {
                p.correlation.subtract_white(current_var)
            } else {
                p.correlation.clone()
            };
            correlation.add_to(image, rng);
            if let Some(w) = weight.as_deref_mut() {
                w.add_scalar(cn_var);
            }
            debug!("added COSMOS correlated noise with variance = {cn_var:.4}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use serde_json::json;
    use std::io::Write;

    fn ctx() -> StampContext {
        StampContext::new(0, 99)
    }

    fn spec(noise: Value, image_sky: bool) -> Result<NoiseSpec> {
        NoiseSpec::from_config(&noise, &mut ctx(), image_sky)
    }

    fn inputs(current_var: f64, sky_level_pixel: f64, mode: DrawMode) -> NoiseInputs {
        NoiseInputs {
            current_var,
            sky_level_pixel,
            mode,
            include_obj_var: false,
        }
    }

    #[test]
    fn test_gaussian_sigma_or_variance() {
        let s = spec(json!({"type": "Gaussian", "sigma": 2.0}), false).unwrap();
        assert_relative_eq!(s.variance(1.0, 0.0), 4.0);
        assert!(spec(json!({"type": "Gaussian", "sigma": 2.0, "variance": 4.0}), false).is_err());
        assert!(spec(json!({"type": "Gaussian"}), false).is_err());
    }

    #[test]
    fn test_poisson_sky_requirements() {
        assert!(matches!(
            spec(json!({"type": "Poisson"}), false),
            Err(StampError::Config(_))
        ));
        assert!(spec(json!({"type": "Poisson"}), true).is_ok());
        for image_sky in [false, true] {
            let both = spec(
                json!({"type": "Poisson", "sky_level": 1.0, "sky_level_pixel": 1.0}),
                image_sky,
            );
            assert!(matches!(both, Err(StampError::Config(_))));
        }
    }

    #[test]
    fn test_variance_per_type() {
        let p = spec(json!({"type": "Poisson", "sky_level": 100.0}), true).unwrap();
        assert_relative_eq!(p.variance(0.5, 10.0), 35.0);
        let c = spec(
            json!({"type": "CCD", "sky_level_pixel": 40.0, "gain": 4.0, "read_noise": 3.0}),
            false,
        )
        .unwrap();
        assert_relative_eq!(c.variance(1.0, 0.0), 19.0);
    }

    #[test]
    fn test_unknown_type_and_attribute() {
        assert!(matches!(
            spec(json!({"type": "Pink"}), false),
            Err(StampError::UnknownNoiseType(name)) if name == "Pink"
        ));
        assert!(matches!(
            spec(json!({"type": "Gaussian", "sigma": 1.0, "seed": 3}), false),
            Err(StampError::Config(_))
        ));
        assert!(matches!(
            spec(json!({"type": "CCD", "sky_level": 1.0, "gain": 0.0}), false),
            Err(StampError::Config(_))
        ));
        assert!(spec(json!(5), false).is_err());
    }

    #[test]
    fn test_gaussian_conflict_and_exact_budget() {
        let s = spec(json!({"type": "Gaussian", "variance": 2.0}), false).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let mut image = Image::zeros(8, 8, 1.0);
        let err = add_noise(&mut image, None, &s, inputs(2.5, 0.0, DrawMode::Fourier), &mut rng)
            .unwrap_err();
        assert!(matches!(err, StampError::NoiseConflict { noise_type: "Gaussian", .. }));

        let mut image = Image::zeros(8, 8, 1.0);
        let mut weight = Image::zeros(8, 8, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(2.0, 0.0, DrawMode::Fourier),
            &mut rng,
        )
        .unwrap();
        assert!(image.array().iter().all(|v| *v == 0.0));
        assert!(weight.array().iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_poisson_weight_and_statistics() {
        let s = spec(json!({"type": "Poisson", "sky_level_pixel": 30.0}), true).unwrap();
        let mut image = Image::zeros(128, 128, 1.0);
        let mut weight = Image::zeros(128, 128, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(0.0, 70.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert!(weight.array().iter().all(|v| *v == 100.0));
        // The image sky stays, the extra sky is removed again.
        let n = image.array().len() as f64;
        let mean = image.sum() / n;
        let var = image.array().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert_relative_eq!(mean, 70.0, epsilon = 0.3);
        assert_relative_eq!(var, 100.0, max_relative = 0.05);
    }

    #[test]
    fn test_poisson_photon_mode_keeps_signal() {
        let s = spec(json!({"type": "Poisson", "sky_level_pixel": 50.0}), false).unwrap();
        let mut image = Image::zeros(128, 128, 1.0);
        image.add_scalar(0.25);
        add_noise(
            &mut image,
            None,
            &s,
            inputs(0.0, 0.0, DrawMode::Photon),
            &mut StdRng::seed_from_u64(4),
        )
        .unwrap();
        let n = image.array().len() as f64;
        let mean = image.sum() / n;
        let var = image.array().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert_relative_eq!(mean, 0.25, epsilon = 0.2);
        assert_relative_eq!(var, 50.0, max_relative = 0.05);
    }

    #[test]
    fn test_include_obj_var_weight() {
        let s = spec(json!({"type": "Poisson", "sky_level_pixel": 5.0}), false).unwrap();
        let mut image = Image::zeros(4, 4, 1.0);
        image.array_mut()[[1, 1]] = 20.0;
        let mut weight = Image::zeros(4, 4, 1.0);
        let mut inp = inputs(0.0, 0.0, DrawMode::Fourier);
        inp.include_obj_var = true;
        add_noise(&mut image, Some(&mut weight), &s, inp, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(weight.array()[[1, 1]], 25.0);
        assert_eq!(weight.array()[[0, 0]], 5.0);
    }

    #[test]
    fn test_ccd_include_obj_var_weight() {
        let s = spec(
            json!({"type": "CCD", "sky_level_pixel": 6.0, "gain": 2.0, "read_noise": 1.5}),
            false,
        )
        .unwrap();
        let mut image = Image::zeros(4, 4, 1.0);
        image.array_mut()[[1, 1]] = 20.0;
        let mut weight = Image::zeros(4, 4, 1.0);
        let mut inp = inputs(0.0, 0.0, DrawMode::Fourier);
        inp.include_obj_var = true;
        add_noise(&mut image, Some(&mut weight), &s, inp, &mut StdRng::seed_from_u64(10)).unwrap();
        // (pixel + sky) / gain + read_noise²
        assert_eq!(weight.array()[[1, 1]], 15.25);
        assert_eq!(weight.array()[[0, 0]], 5.25);

        let mut image = Image::zeros(4, 4, 1.0);
        image.array_mut()[[1, 1]] = 20.0;
        let mut weight = Image::zeros(4, 4, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(0.0, 0.0, DrawMode::Photon),
            &mut StdRng::seed_from_u64(10),
        )
        .unwrap();
        assert!(weight.array().iter().all(|v| *v == 5.25));
    }

    #[test]
    fn test_poisson_exact_budget_adds_nothing() {
        let s = spec(json!({"type": "Poisson", "sky_level_pixel": 30.0}), false).unwrap();

        let mut image = Image::zeros(8, 8, 1.0);
        image.add_scalar(3.0);
        image.array_mut()[[2, 2]] = 40.0;
        let before = image.clone();
        let mut weight = Image::zeros(8, 8, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(30.0, 0.0, DrawMode::Photon),
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap();
        assert_eq!(image, before);
        assert!(weight.array().iter().all(|v| *v == 30.0));

        let mut image = Image::zeros(8, 8, 1.0);
        add_noise(
            &mut image,
            None,
            &s,
            inputs(30.0, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap();
        assert!(image.array().iter().all(|v| *v == 0.0));

        let err = add_noise(
            &mut image,
            None,
            &s,
            inputs(30.5, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap_err();
        assert!(matches!(err, StampError::NoiseConflict { noise_type: "Poisson", .. }));
    }

    #[test]
    fn test_ccd_exact_budget_adds_nothing() {
        let s = spec(
            json!({"type": "CCD", "sky_level_pixel": 100.0, "read_noise": 1.0, "gain": 2.0}),
            false,
        )
        .unwrap();
        // Requested variance 100/2 + 1 = 51.
        let mut image = Image::zeros(8, 8, 1.0);
        image.add_scalar(3.0);
        let before = image.clone();
        add_noise(
            &mut image,
            None,
            &s,
            inputs(51.0, 0.0, DrawMode::Photon),
            &mut StdRng::seed_from_u64(12),
        )
        .unwrap();
        assert_eq!(image, before);

        let mut image = Image::zeros(8, 8, 1.0);
        let mut weight = Image::zeros(8, 8, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(51.0, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(12),
        )
        .unwrap();
        assert!(image.array().iter().all(|v| *v == 0.0));
        assert!(weight.array().iter().all(|v| *v == 51.0));
    }

    #[test]
    fn test_ccd_photon_mode_uses_gain() {
        let s = spec(json!({"type": "CCD", "sky_level_pixel": 100.0, "gain": 4.0}), false).unwrap();
        let mut image = Image::zeros(128, 128, 1.0);
        image.add_scalar(0.5);
        add_noise(
            &mut image,
            None,
            &s,
            inputs(0.0, 0.0, DrawMode::Photon),
            &mut StdRng::seed_from_u64(13),
        )
        .unwrap();
        let n = image.array().len() as f64;
        let mean = image.sum() / n;
        let var = image.array().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        // Electrons are Poisson(sky * gain); in image units the variance is sky / gain.
        assert_relative_eq!(mean, 0.5, epsilon = 0.2);
        assert_relative_eq!(var, 25.0, max_relative = 0.05);
        assert!(image.array().iter().all(|v| (v * 4.0).fract() == 0.0));
    }

    #[test]
    fn test_ccd_whitening_drains_read_noise_first() {
        let s = spec(
            json!({"type": "CCD", "sky_level_pixel": 0.0, "read_noise": 2.0, "gain": 2.0}),
            false,
        )
        .unwrap();
        // Exactly the read-noise variance: nothing left to add.
        let mut image = Image::zeros(16, 16, 1.0);
        let mut weight = Image::zeros(16, 16, 1.0);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(4.0, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(6),
        )
        .unwrap();
        assert!(image.array().iter().all(|v| *v == 0.0));
        assert!(weight.array().iter().all(|v| *v == 4.0));

        let err = add_noise(
            &mut image,
            None,
            &s,
            inputs(4.5, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(6),
        )
        .unwrap_err();
        assert!(matches!(err, StampError::NoiseConflict { noise_type: "CCD", .. }));
    }

    #[test]
    fn test_ccd_remaining_budget_comes_off_the_sky() {
        let s = spec(
            json!({"type": "CCD", "sky_level_pixel": 100.0, "read_noise": 1.0, "gain": 2.0}),
            false,
        )
        .unwrap();
        // Requested variance 100/2 + 1 = 51; whitening already put in 26.
        let mut image = Image::zeros(128, 128, 1.0);
        add_noise(
            &mut image,
            None,
            &s,
            inputs(26.0, 0.0, DrawMode::Fourier),
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();
        let n = image.array().len() as f64;
        let mean = image.sum() / n;
        let var = image.array().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert_relative_eq!(var, 25.0, max_relative = 0.05);
        assert_relative_eq!(mean, 0.0, epsilon = 0.2);
    }

    #[test]
    fn test_cosmos_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"values": [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]}}"#)
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let s = spec(json!({"type": "COSMOS", "file_name": path, "variance": 9.0}), false).unwrap();
        assert_relative_eq!(s.variance(0.1, 0.0), 9.0);
        match &s {
            NoiseSpec::Cosmos(p) => assert_relative_eq!(p.dx_cosmos, DEFAULT_DX_COSMOS),
            other => panic!("{other:?}"),
        }

        let mut image = Image::zeros(8, 8, 0.03);
        let mut weight = Image::zeros(8, 8, 0.03);
        let err = add_noise(&mut image, None, &s, inputs(10.0, 0.0, DrawMode::Fourier), &mut ctx().rng)
            .unwrap_err();
        assert!(matches!(err, StampError::NoiseConflict { noise_type: "COSMOS", .. }));
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(1.0, 0.0, DrawMode::Fourier),
            &mut ctx().rng,
        )
        .unwrap();
        assert!(weight.array().iter().all(|v| *v == 9.0));

        assert!(spec(json!({"type": "COSMOS"}), false).is_err());
    }

    #[test]
    fn test_cosmos_exact_budget_adds_nothing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"values": [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]}}"#)
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let s = spec(json!({"type": "COSMOS", "file_name": path, "variance": 9.0}), false).unwrap();

        let mut image = Image::zeros(8, 8, 0.03);
        let mut weight = Image::zeros(8, 8, 0.03);
        add_noise(
            &mut image,
            Some(&mut weight),
            &s,
            inputs(9.0, 0.0, DrawMode::Fourier),
            &mut ctx().rng,
        )
        .unwrap();
        assert!(image.array().iter().all(|v| *v == 0.0));
        assert!(weight.array().iter().all(|v| *v == 9.0));
    }
}
