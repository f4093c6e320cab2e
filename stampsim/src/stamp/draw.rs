//! Drawing the convolved profile of one object.

use log::{debug, warn};

use crate::config::{check_all_params, resolve, resolve_required, ParamSpec, StampConfig};
use crate::error::{Result, StampError};
use crate::image_proc::{Image, Position};
use crate::noise::NoiseSpec;
use crate::profile::{PhotonBudget, Profile, Shear};
use crate::stamp::StampContext;

/// Default `image.max_extra_noise` for photon shooting, as a fraction of
/// the noise variance.
pub const DEFAULT_MAX_EXTRA_NOISE: f64 = 0.01;

/// Size, sky and sub-pixel offset of the stamp being drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRequest {
    /// Zero in either dimension means auto-size.
    pub xsize: usize,
    pub ysize: usize,
    pub sky_level_pixel: f64,
    /// Offset of the object from the stamp's true center, in pixels.
    pub offset: Position,
}

/// Shear requested by `image.wcs`, if any. Only the `Shear` type is known.
pub fn calculate_wcs_shear(config: &StampConfig, ctx: &mut StampContext) -> Result<Option<Shear>> {
    let Some(wcs) = config.image_key("wcs") else {
        return Ok(None);
    };
    if !wcs.is_object() {
        return Err(StampError::config("image.wcs is not a dict"));
    }
    match wcs.get("type").and_then(|t| t.as_str()).unwrap_or("Shear") {
        "Shear" => {
            check_all_params(
                wcs,
                "wcs",
                &ParamSpec {
                    req: &["shear"],
                    ..ParamSpec::default()
                },
            )?;
            resolve_required::<Shear>(wcs, "shear", ctx).map(Some)
        }
        other => Err(StampError::UnknownWcsType(other.to_string())),
    }
}

/// Target variance of the configured noise, for S/N scaling and photon
/// budgets.
pub fn calculate_noise_var(
    config: &StampConfig,
    ctx: &mut StampContext,
    sky_level_pixel: f64,
) -> Result<f64> {
    let noise = config
        .noise()
        .ok_or_else(|| StampError::config("image.noise is required"))?;
    let spec = NoiseSpec::from_config(noise, ctx, sky_level_pixel != 0.0)?;
    Ok(spec.variance(ctx.pixel_scale, sky_level_pixel))
}

/// Scope holding the galaxy's S/N target: `gal`, or `psf` when there is no
/// galaxy scope.
fn signal_to_noise_scope(config: &StampConfig) -> Option<(&'static str, &serde_json::Value)> {
    match config.scope("gal") {
        Some(gal) => gal.get("signal_to_noise").map(|_| ("gal", gal)),
        None => config
            .scope("psf")
            .filter(|psf| psf.get("signal_to_noise").is_some())
            .map(|psf| ("psf", psf)),
    }
}

/// Rescale `image` so that `sqrt(Σ pixel² / noise_var)` equals `target`.
/// Returns the flux factor applied.
pub fn scale_to_signal_to_noise(image: &mut Image, target: f64, noise_var: f64) -> Result<f64> {
    if !(noise_var > 0.0) {
        return Err(StampError::config(format!(
            "noise variance must be positive for signal_to_noise, got {noise_var}"
        )));
    }
    let sum_sq = image.sum_sq();
    if !(sum_sq > 0.0) {
        return Err(StampError::config(
            "cannot scale a blank stamp to a signal_to_noise target",
        ));
    }
    let sn_meas = (sum_sq / noise_var).sqrt();
    let factor = target / sn_meas;
    image.scale_by(factor);
    Ok(factor)
}

fn convolved(profiles: impl IntoIterator<Item = Option<Profile>>) -> Result<Profile> {
    Profile::convolve(profiles.into_iter().flatten().collect())
}

fn wmult(config: &StampConfig, ctx: &mut StampContext) -> Result<f64> {
    let wmult = resolve::<f64>(config.image(), "wmult", ctx)?.unwrap_or(1.0);
    if !(wmult > 0.0) {
        return Err(StampError::config(format!("image.wmult must be positive, got {wmult}")));
    }
    Ok(wmult)
}

fn whiten(final_profile: &Profile, image: &mut Image, ctx: &mut StampContext) -> f64 {
    match final_profile.noise() {
        Some(noise) => {
            let var = noise.whiten(image, &mut ctx.rng);
            debug!("obj {}: whitened to variance {var:.4}", ctx.obj_num);
            var
        }
        None => 0.0,
    }
}

/// Fourier draw of PSF ⊛ pixel ⊛ galaxy. Returns the stamp, anchored at
/// `image_origin`, and the variance added by whitening.
pub fn draw_stamp_fft(
    psf: Option<&Profile>,
    pix: Option<&Profile>,
    gal: Option<&Profile>,
    config: &StampConfig,
    ctx: &mut StampContext,
    request: &DrawRequest,
) -> Result<(Image, f64)> {
    let mut final_profile = convolved([psf.cloned(), gal.cloned()])?;
    if let Some(shear) = calculate_wcs_shear(config, ctx)? {
        final_profile = final_profile.shear(&shear);
        ctx.wcs_shear = Some(shear);
    }
    if let Some(pix) = pix {
        final_profile = Profile::convolve(vec![final_profile, pix.clone()])?;
    }

    let scale = ctx.pixel_scale;
    let wmult = wmult(config, ctx)?;
    let mut image = final_profile.stamp_image(request.xsize, request.ysize, scale, wmult);
    final_profile.draw(&mut image, request.offset)?;
    let (x0, y0) = config.image_origin();
    image.set_origin(x0, y0);

    let mut current_var = whiten(&final_profile, &mut image, ctx);

    if let Some((name, scope)) = signal_to_noise_scope(config) {
        if scope.get("flux").is_some() {
            return Err(StampError::config(format!(
                "only one of signal_to_noise or flux may be specified for {name}"
            )));
        }
        if !config.has_noise() {
            return Err(StampError::config(format!(
                "need to specify noise level when using {name}.signal_to_noise"
            )));
        }
        let noise_var = calculate_noise_var(config, ctx, request.sky_level_pixel)?;
        let target = resolve_required::<f64>(scope, "signal_to_noise", ctx)?;
        let factor = scale_to_signal_to_noise(&mut image, target, noise_var)?;
        current_var *= factor * factor;
        debug!(
            "obj {}: scaled flux by {factor:.4} for signal_to_noise = {target}",
            ctx.obj_num
        );
    }

    Ok((image, current_var))
}

/// Photon-shooting draw of PSF ⊛ galaxy. The pixel response is implicit in
/// binning the photons.
pub fn draw_stamp_phot(
    psf: Option<&Profile>,
    gal: Option<&Profile>,
    config: &StampConfig,
    ctx: &mut StampContext,
    request: &DrawRequest,
) -> Result<(Image, f64)> {
    let mut final_profile = convolved([psf.cloned(), gal.cloned()])?;
    if let Some(shear) = calculate_wcs_shear(config, ctx)? {
        final_profile = final_profile.shear(&shear);
        ctx.wcs_shear = Some(shear);
    }

    if signal_to_noise_scope(config).is_some() {
        return Err(StampError::Unsupported(
            "signal_to_noise option not implemented for draw_method = phot".to_string(),
        ));
    }

    let image_scope = config.image();
    let budget = if let Some(n_photons) = resolve::<usize>(image_scope, "n_photons", ctx)? {
        if image_scope.get("max_extra_noise").is_some() {
            warn!(
                "obj {}: both max_extra_noise and n_photons are set, ignoring max_extra_noise",
                ctx.obj_num
            );
        }
        PhotonBudget::Count(n_photons)
    } else {
        let mut max_extra_noise = resolve::<f64>(image_scope, "max_extra_noise", ctx)?
            .unwrap_or(DEFAULT_MAX_EXTRA_NOISE);
        if max_extra_noise < 0.0 {
            return Err(StampError::config("image.max_extra_noise cannot be negative"));
        }
        if max_extra_noise > 0.0 {
            if !config.has_noise() {
                return Err(StampError::config(
                    "need to specify noise level when using draw_method = phot",
                ));
            }
            let noise_var = calculate_noise_var(config, ctx, request.sky_level_pixel)?;
            if noise_var < 0.0 {
                return Err(StampError::config(format!(
                    "noise variance calculated to be < 0 ({noise_var})"
                )));
            }
            max_extra_noise *= noise_var;
        }
        PhotonBudget::MaxExtraNoise(max_extra_noise)
    };

    let scale = ctx.pixel_scale;
    let wmult = wmult(config, ctx)?;
    let mut image = final_profile.stamp_image(request.xsize, request.ysize, scale, wmult);
    let n = final_profile.draw_shoot(&mut image, budget, request.offset, &mut ctx.rng)?;
    debug!("obj {}: shot {n} photons", ctx.obj_num);
    let (x0, y0) = config.image_origin();
    image.set_origin(x0, y0);

    let current_var = whiten(&final_profile, &mut image, ctx);
    Ok((image, current_var))
}
