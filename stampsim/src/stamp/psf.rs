//! PSF-only companion stamp.

use log::debug;

use crate::config::{resolve, resolve_required, StampConfig};
use crate::error::{Result, StampError};
use crate::image_proc::{Bounds, Image, Position};
use crate::profile::Profile;
use crate::stamp::draw::{calculate_noise_var, scale_to_signal_to_noise};
use crate::stamp::StampContext;

/// Draw `psf ⊛ pix` on the given bounds, registered with the main stamp: the
/// WCS shear and galaxy shift recorded in `ctx` are applied, and the same
/// sub-pixel `offset` is used. Without bounds the stamp is auto-sized.
pub fn draw_psf_stamp(
    psf: Option<&Profile>,
    pix: Option<&Profile>,
    config: &StampConfig,
    ctx: &mut StampContext,
    bounds: Option<Bounds>,
    sky_level_pixel: f64,
    offset: Position,
) -> Result<Image> {
    let psf = psf.ok_or_else(|| StampError::config("drawing a PSF image requires a psf"))?;

    let mut psf = psf.clone();
    if let Some(shear) = &ctx.wcs_shear {
        psf = psf.shear(shear);
    }
    let mut final_psf = Profile::convolve([Some(psf), pix.cloned()].into_iter().flatten().collect())?;

    let output_psf = config.root().get("output").and_then(|o| o.get("psf"));
    if let Some(output_psf) = output_psf {
        // Accepted for compatibility; the draw is always done in Fourier space.
        if let Some(real_space) = resolve::<bool>(output_psf, "real_space", ctx)? {
            debug!("obj {}: psf real_space = {real_space} ignored", ctx.obj_num);
        }
    }

    if let Some(shift) = ctx.gal_shift {
        final_psf = final_psf.shift(shift.x, shift.y);
    }

    let scale = ctx.pixel_scale;
    let mut image = match bounds {
        Some(bounds) => Image::from_bounds(bounds, scale),
        None => final_psf.stamp_image(0, 0, scale, 1.0),
    };
    final_psf.draw(&mut image, offset)?;

    let sn_scope = match output_psf.filter(|p| p.get("signal_to_noise").is_some()) {
        Some(scope) => Some(scope),
        None if config.scope("gal").is_none() => config
            .scope("psf")
            .filter(|p| p.get("signal_to_noise").is_some()),
        None => None,
    };
    if let Some(scope) = sn_scope {
        if !config.has_noise() {
            return Err(StampError::config(
                "need to specify noise level when using psf.signal_to_noise",
            ));
        }
        let noise_var = calculate_noise_var(config, ctx, sky_level_pixel)?;
        let target = resolve_required::<f64>(scope, "signal_to_noise", ctx)?;
        scale_to_signal_to_noise(&mut image, target, noise_var)?;
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn centroid(image: &Image) -> (f64, f64) {
        let bounds = image.bounds().unwrap();
        let (mut sx, mut sy, mut s) = (0.0, 0.0, 0.0);
        for ((r, c), v) in image.array().indexed_iter() {
            sx += (bounds.xmin + c as i64) as f64 * v;
            sy += (bounds.ymin + r as i64) as f64 * v;
            s += v;
        }
        (sx / s, sy / s)
    }

    #[test]
    fn test_missing_psf_is_config_error() {
        let config = StampConfig::from_json_str("{}").unwrap();
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        let result = draw_psf_stamp(None, None, &config, &mut ctx, None, 0.0, Position::default());
        assert!(matches!(result, Err(StampError::Config(_))));
    }

    #[test]
    fn test_uses_bounds_and_galaxy_shift() {
        let config = StampConfig::from_json_str(r#"{"image": {"pixel_scale": 0.25}}"#).unwrap();
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        ctx.gal_shift = Some(Position::new(1.0, 0.0));
        let psf = Profile::gaussian(0.5, 1.0).unwrap();
        let bounds = Bounds::new(101, 164, 201, 264);
        let image = draw_psf_stamp(
            Some(&psf),
            None,
            &config,
            &mut ctx,
            Some(bounds),
            0.0,
            Position::default(),
        )
        .unwrap();
        assert_eq!(image.bounds(), Some(bounds));
        let (cx, cy) = centroid(&image);
        // One arcsec at 0.25 arcsec/pixel moves the center by four pixels.
        assert_relative_eq!(cx, 132.5 + 4.0, epsilon = 1e-3);
        assert_relative_eq!(cy, 232.5, epsilon = 1e-3);
    }

    #[test]
    fn test_output_signal_to_noise() {
        let config = StampConfig::from_json_str(
            r#"{"image": {"noise": {"type": "Gaussian", "variance": 4.0}},
                "gal": {"type": "Gaussian", "sigma": 1.0},
                "output": {"psf": {"signal_to_noise": 30.0, "real_space": false}}}"#,
        )
        .unwrap();
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        let psf = Profile::gaussian(1.0, 1.0).unwrap();
        let image = draw_psf_stamp(
            Some(&psf),
            None,
            &config,
            &mut ctx,
            Some(Bounds::new(1, 24, 1, 24)),
            0.0,
            Position::default(),
        )
        .unwrap();
        assert_relative_eq!((image.sum_sq() / 4.0).sqrt(), 30.0, max_relative = 1e-9);
    }
}
