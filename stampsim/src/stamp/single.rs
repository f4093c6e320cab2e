//! Rendering of a single object stamp.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::{parse_value, resolve, StampConfig};
use crate::error::{Result, StampError};
use crate::image_proc::{BadPixImage, Image, Position};
use crate::noise::{add_noise, DrawMode, NoiseInputs, NoiseSpec};
use crate::profile::{BuildOutcome, ProfileBuilder, ProfileKey};
use crate::stamp::draw::{draw_stamp_fft, draw_stamp_phot, DrawRequest};
use crate::stamp::psf::draw_psf_stamp;
use crate::stamp::StampContext;

/// What to render for one object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampRequest {
    pub obj_num: usize,
    /// Explicit stamp size; zero defers to `image.stamp_xsize` /
    /// `image.stamp_size`, then to auto-sizing.
    pub xsize: usize,
    pub ysize: usize,
    pub sky_level_pixel: f64,
    pub do_noise: bool,
    pub make_psf_image: bool,
    pub make_weight_image: bool,
    pub make_badpix_image: bool,
}

impl StampRequest {
    pub fn new(obj_num: usize) -> Self {
        Self {
            obj_num,
            xsize: 0,
            ysize: 0,
            sky_level_pixel: 0.0,
            do_noise: true,
            make_psf_image: false,
            make_weight_image: false,
            make_badpix_image: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StampResult {
    pub image: Image,
    pub psf_image: Option<Image>,
    pub weight_image: Option<Image>,
    pub badpix_image: Option<BadPixImage>,
    /// Variance present in `image` before noise was added.
    pub current_var: f64,
    pub elapsed: Duration,
}

/// Where the stamp lands on the full image.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Placement {
    icenter: Option<(i64, i64)>,
    offset: Position,
}

/// Render one object.
///
/// Errors are wrapped in [`StampError::Object`] with the object number and,
/// once placement is known, the integer stamp center.
pub fn render_stamp(
    config: &StampConfig,
    builder: &dyn ProfileBuilder,
    request: &StampRequest,
) -> Result<StampResult> {
    let start = Instant::now();
    let mut location = String::new();
    let result = render(config, builder, request, &mut location);
    result
        .map(|mut stamp| {
            stamp.elapsed = start.elapsed();
            debug!(
                "obj {}: stamp done in {:.3} s",
                request.obj_num,
                stamp.elapsed.as_secs_f64()
            );
            stamp
        })
        .map_err(|source| StampError::Object {
            obj_num: request.obj_num,
            location,
            source: Box::new(source),
        })
}

fn stamp_size(
    config: &StampConfig,
    ctx: &mut StampContext,
    request: &StampRequest,
) -> Result<(usize, usize)> {
    let image = config.image();
    let mut xsize = request.xsize;
    let mut ysize = request.ysize;
    if xsize == 0 {
        xsize = match resolve::<usize>(image, "stamp_xsize", ctx)? {
            Some(n) => n,
            None => resolve::<usize>(image, "stamp_size", ctx)?.unwrap_or(0),
        };
    }
    if ysize == 0 {
        ysize = match resolve::<usize>(image, "stamp_ysize", ctx)? {
            Some(n) => n,
            None => resolve::<usize>(image, "stamp_size", ctx)?.unwrap_or(0),
        };
    }
    // A single given dimension makes a square stamp.
    match (xsize, ysize) {
        (0, n) | (n, 0) => Ok((n, n)),
        sizes => Ok(sizes),
    }
}

fn resolve_placement(config: &StampConfig, ctx: &mut StampContext) -> Result<Placement> {
    let image = config.image();
    let image_pos = resolve::<Position>(image, "image_pos", ctx)?;
    let sky_pos = resolve::<Position>(image, "sky_pos", ctx)?;
    let center = config.image_center();
    let scale = ctx.pixel_scale;

    let (image_pos, sky_pos) = match (image_pos, sky_pos) {
        (Some(image_pos), Some(sky_pos)) => (Some(image_pos), Some(sky_pos)),
        (Some(image_pos), None) => (Some(image_pos), Some((image_pos - center) * scale)),
        (None, Some(sky_pos)) => (Some(sky_pos * (1.0 / scale) + center), Some(sky_pos)),
        (None, None) => (None, None),
    };
    ctx.image_pos = image_pos;
    ctx.sky_pos = sky_pos;

    let Some(image_pos) = image_pos else {
        debug!("obj {}: no offset", ctx.obj_num);
        return Ok(Placement {
            icenter: None,
            offset: Position::default(),
        });
    };
    debug!("obj {}: image_pos = ({}, {})", ctx.obj_num, image_pos.x, image_pos.y);

    // Even stamps have their nominal center half a pixel up and right of the
    // true center. Auto-sized stamps are always even.
    let mut nominal = image_pos;
    if ctx.xsize % 2 == 0 {
        nominal.x += 0.5;
    }
    if ctx.ysize % 2 == 0 {
        nominal.y += 0.5;
    }
    let icenter = ((nominal.x + 0.5).floor(), (nominal.y + 0.5).floor());
    Ok(Placement {
        icenter: Some((icenter.0 as i64, icenter.1 as i64)),
        offset: Position::new(nominal.x - icenter.0, nominal.y - icenter.1),
    })
}

/// Build psf, pix and gal in that order into the context. Returns the skip
/// message when the builder skipped the object.
fn build_profiles(
    config: &StampConfig,
    builder: &dyn ProfileBuilder,
    ctx: &mut StampContext,
) -> Result<Option<Option<String>>> {
    for key in [ProfileKey::Psf, ProfileKey::Pix, ProfileKey::Gal] {
        let profile = match builder.build(key, config, ctx)? {
            BuildOutcome::Built(profile) => profile,
            BuildOutcome::Skipped(message) => return Ok(Some(message)),
        };
        match key {
            ProfileKey::Psf => ctx.psf = profile,
            ProfileKey::Pix => ctx.pix = profile,
            ProfileKey::Gal => ctx.gal = profile,
        }
    }
    Ok(None)
}

fn include_obj_var(config: &StampConfig, ctx: &mut StampContext) -> Result<bool> {
    match config.output_key("weight", "include_obj_var") {
        Some(value) => parse_value::<bool>(value, "include_obj_var", ctx),
        None => Ok(false),
    }
}

fn render(
    config: &StampConfig,
    builder: &dyn ProfileBuilder,
    request: &StampRequest,
    location: &mut String,
) -> Result<StampResult> {
    let mut ctx = StampContext::for_object(config, request.obj_num)?;
    let (xsize, ysize) = stamp_size(config, &mut ctx, request)?;
    ctx.xsize = xsize;
    ctx.ysize = ysize;
    debug!("obj {}: xsize,ysize = {xsize},{ysize}", ctx.obj_num);

    let mut placement = resolve_placement(config, &mut ctx)?;
    if let Some((x, y)) = placement.icenter {
        *location = format!(" at ({x}, {y})");
    }

    let sky_level_pixel = request.sky_level_pixel;
    let skipped = build_profiles(config, builder, &mut ctx)?;

    let (image, weight, current_var) = match &skipped {
        Some(message) => {
            match message {
                Some(msg) => info!("Skipping object {}: {msg}", ctx.obj_num),
                None => debug!("obj {}: skipped", ctx.obj_num),
            }
            let image = if xsize > 0 && ysize > 0 {
                let mut image = Image::zeros(xsize, ysize, ctx.pixel_scale);
                let (x0, y0) = config.image_origin();
                image.set_origin(x0, y0);
                if request.do_noise && sky_level_pixel != 0.0 {
                    image.add_scalar(sky_level_pixel);
                }
                image
            } else {
                Image::empty(ctx.pixel_scale)
            };
            let weight = request.make_weight_image.then(|| image.zeros_like::<f64>());
            (image, weight, 0.0)
        }
        None => {
            if let Some(extra) = resolve::<Position>(config.image(), "offset", &mut ctx)? {
                placement.offset += extra;
            }
            if ctx.gal.is_none() && ctx.psf.is_none() {
                return Err(StampError::config(
                    "at least one of gal or psf must be specified",
                ));
            }

            let draw_request = DrawRequest {
                xsize,
                ysize,
                sky_level_pixel,
                offset: placement.offset,
            };
            let draw_method = resolve::<String>(config.image(), "draw_method", &mut ctx)?
                .unwrap_or_else(|| "fft".to_string());
            let (psf, pix, gal) = (ctx.psf.clone(), ctx.pix.clone(), ctx.gal.clone());
            let (mode, (mut image, current_var)) = match draw_method.as_str() {
                "fft" => (
                    DrawMode::Fourier,
                    draw_stamp_fft(
                        psf.as_ref(),
                        pix.as_ref(),
                        gal.as_ref(),
                        config,
                        &mut ctx,
                        &draw_request,
                    )?,
                ),
                "phot" => (
                    DrawMode::Photon,
                    draw_stamp_phot(psf.as_ref(), gal.as_ref(), config, &mut ctx, &draw_request)?,
                ),
                other => return Err(StampError::UnknownDrawMethod(other.to_string())),
            };
            if let Some((x, y)) = placement.icenter {
                image.set_center(x, y);
            }

            let mut weight = request.make_weight_image.then(|| image.zeros_like::<f64>());
            if request.do_noise {
                if let Some(noise) = config.noise() {
                    let spec = NoiseSpec::from_config(noise, &mut ctx, sky_level_pixel != 0.0)?;
                    let inputs = NoiseInputs {
                        current_var,
                        sky_level_pixel,
                        mode,
                        include_obj_var: include_obj_var(config, &mut ctx)?,
                    };
                    add_noise(&mut image, weight.as_mut(), &spec, inputs, &mut ctx.rng)?;
                } else if sky_level_pixel != 0.0 {
                    image.add_scalar(sky_level_pixel);
                }
            }
            (image, weight, current_var)
        }
    };

    let badpix_image = request
        .make_badpix_image
        .then(|| image.zeros_like::<i16>());

    let psf_image = if request.make_psf_image {
        Some(render_psf_image(
            config,
            &mut ctx,
            &image,
            skipped.is_some(),
            sky_level_pixel,
            placement.offset,
        )?)
    } else {
        None
    };

    Ok(StampResult {
        image,
        psf_image,
        weight_image: weight,
        badpix_image,
        current_var,
        elapsed: Duration::ZERO,
    })
}

fn render_psf_image(
    config: &StampConfig,
    ctx: &mut StampContext,
    image: &Image,
    skipped: bool,
    sky_level_pixel: f64,
    offset: Position,
) -> Result<Image> {
    let (psf, pix) = (ctx.psf.clone(), ctx.pix.clone());
    if skipped && psf.is_none() {
        return Ok(image.zeros_like::<f64>());
    }
    let mut psf_image = draw_psf_stamp(
        psf.as_ref(),
        pix.as_ref(),
        config,
        ctx,
        image.bounds(),
        sky_level_pixel,
        offset,
    )?;
    if config.output_key("psf", "signal_to_noise").is_some() {
        if let Some(noise) = config.noise() {
            let spec = NoiseSpec::from_config(noise, ctx, false)?;
            let inputs = NoiseInputs {
                current_var: 0.0,
                sky_level_pixel: 0.0,
                mode: DrawMode::Fourier,
                include_obj_var: false,
            };
            add_noise(&mut psf_image, None, &spec, inputs, &mut ctx.rng)?;
        }
    }
    Ok(psf_image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ConfigProfileBuilder;
    use approx::assert_relative_eq;

    fn config(json: &str) -> StampConfig {
        StampConfig::from_json_str(json).unwrap()
    }

    #[test]
    fn test_single_dimension_makes_square() {
        let config = config(r#"{"image": {"stamp_xsize": 12}}"#);
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        let size = stamp_size(&config, &mut ctx, &StampRequest::new(0)).unwrap();
        assert_eq!(size, (12, 12));

        let mut request = StampRequest::new(0);
        request.xsize = 8;
        let config = self::config(r#"{"image": {"stamp_size": 20}}"#);
        let size = stamp_size(&config, &mut ctx, &request).unwrap();
        assert_eq!(size, (8, 20));
    }

    #[test]
    fn test_placement_from_sky_position() {
        let config = config(
            r#"{"image": {"pixel_scale": 0.5, "image_center": [50, 50], "sky_pos": [2.0, -1.0]}}"#,
        );
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        ctx.xsize = 15;
        ctx.ysize = 15;
        let placement = resolve_placement(&config, &mut ctx).unwrap();
        assert_eq!(ctx.image_pos, Some(Position::new(54.0, 48.0)));
        assert_eq!(placement.icenter, Some((54, 48)));
        assert_relative_eq!(placement.offset.x, 0.0);
    }

    #[test]
    fn test_even_stamp_offset() {
        let config = config(r#"{"image": {"image_pos": [10.3, 20.0]}}"#);
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        ctx.xsize = 16;
        ctx.ysize = 16;
        let placement = resolve_placement(&config, &mut ctx).unwrap();
        assert_eq!(placement.icenter, Some((11, 21)));
        assert_relative_eq!(placement.offset.x, -0.2, epsilon = 1e-12);
        assert_relative_eq!(placement.offset.y, -0.5, epsilon = 1e-12);
        assert_eq!(ctx.sky_pos, Some(Position::new(10.3, 20.0)));
    }

    #[test]
    fn test_error_carries_object_and_center() {
        let config = config(r#"{"image": {"image_pos": [5, 5], "stamp_size": 9}}"#);
        let err = render_stamp(&config, &ConfigProfileBuilder, &StampRequest::new(4)).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("obj 4 at (5, 5)"), "{message}");
        assert!(matches!(err.root_cause(), StampError::Config(_)));
    }

    #[test]
    fn test_skip_without_size_is_empty() {
        let config = config(r#"{"gal": {"type": "Gaussian", "sigma": 1.0, "skip": true}}"#);
        let mut request = StampRequest::new(0);
        request.make_weight_image = true;
        request.make_badpix_image = true;
        let stamp = render_stamp(&config, &ConfigProfileBuilder, &request).unwrap();
        assert!(stamp.image.is_empty());
        assert!(stamp.weight_image.unwrap().is_empty());
        assert!(stamp.badpix_image.unwrap().is_empty());
        assert_eq!(stamp.current_var, 0.0);
    }

    #[test]
    fn test_offset_applies_after_centering() {
        let config = config(
            r#"{"image": {"stamp_size": 32, "pixel_scale": 0.25, "offset": [1.0, 0.0]},
                "gal": {"type": "Gaussian", "sigma": 0.5}}"#,
        );
        let stamp = render_stamp(&config, &ConfigProfileBuilder, &StampRequest::new(0)).unwrap();
        let b = stamp.image.bounds().unwrap();
        let (mut sx, mut s) = (0.0, 0.0);
        for ((_, c), v) in stamp.image.array().indexed_iter() {
            sx += (b.xmin + c as i64) as f64 * v;
            s += v;
        }
        assert_relative_eq!(sx / s, 16.5 + 1.0, epsilon = 1e-4);
    }
}
