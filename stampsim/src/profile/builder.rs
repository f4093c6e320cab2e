//! Construction of profiles from configuration scopes.

use std::f64::consts::PI;
use std::fmt;

use log::debug;
use serde_json::Value;

use super::{
    Profile, Shear, EXPONENTIAL_HLR_FACTOR, GAUSSIAN_FWHM_FACTOR, GAUSSIAN_HLR_FACTOR,
};
use crate::config::value::parse_bool_word;
use crate::config::{check_all_params, resolve, resolve_required, ParamSpec, StampConfig};
use crate::error::{Result, StampError};
use crate::image_proc::Position;
use crate::noise::IntrinsicNoise;
use crate::stamp::StampContext;

/// Which profile of a stamp is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKey {
    Psf,
    Pix,
    Gal,
}

impl ProfileKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKey::Psf => "psf",
            ProfileKey::Pix => "pix",
            ProfileKey::Gal => "gal",
        }
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of building one profile.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The profile, or `None` when the scope is not configured.
    Built(Option<Profile>),
    /// The object must not be drawn. The stamp is still produced, blank.
    Skipped(Option<String>),
}

/// Turns a configuration scope into a [`Profile`].
///
/// Implementations are shared by every worker of a batch and must not keep
/// per-object state; anything object-specific goes through the context.
pub trait ProfileBuilder: Send + Sync {
    fn build(
        &self,
        key: ProfileKey,
        config: &StampConfig,
        ctx: &mut StampContext,
    ) -> Result<BuildOutcome>;
}

/// Builds the analytic profile types from the `psf`, `pix` and `gal` scopes.
///
/// Supported types: `Gaussian` (`sigma`, `fwhm` or `half_light_radius`),
/// `Exponential` (`scale_radius` or `half_light_radius`), `Pixel` (`xw`,
/// optional `yw`) and `Ring` (`num`, `first`). Every type also accepts
/// `flux`, `ellip`, `rotate` (degrees), `shear`, `shift`, `skip` and
/// `whiten_variance`, applied in that order after the shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigProfileBuilder;

const COMMON: &[&str] = &[
    "flux",
    "ellip",
    "rotate",
    "shear",
    "shift",
    "skip",
    "whiten_variance",
];

/// Read by the stamp renderer rather than the builder.
const RENDER_KEYS: &[&str] = &["signal_to_noise"];

fn with_common<'a>(extra: &'a [&'a str]) -> Vec<&'a str> {
    COMMON.iter().chain(extra).copied().collect()
}

impl ProfileBuilder for ConfigProfileBuilder {
    fn build(
        &self,
        key: ProfileKey,
        config: &StampConfig,
        ctx: &mut StampContext,
    ) -> Result<BuildOutcome> {
        let Some(scope) = config.scope(key.as_str()) else {
            return Ok(BuildOutcome::Built(None));
        };
        let outcome = self.build_scope(scope, key.as_str(), config, ctx)?;
        if key == ProfileKey::Gal {
            if let BuildOutcome::Built(Some(gal)) = &outcome {
                debug!("obj {}: gal flux = {:.4}", ctx.obj_num, gal.flux());
            }
        }
        Ok(outcome)
    }
}

impl ConfigProfileBuilder {
    fn build_scope(
        &self,
        scope: &Value,
        name: &str,
        config: &StampConfig,
        ctx: &mut StampContext,
    ) -> Result<BuildOutcome> {
        if !scope.is_object() {
            return Err(StampError::config(format!("{name} is not a dict")));
        }
        if let Some(outcome) = skip_outcome(scope, ctx)? {
            return Ok(outcome);
        }
        let type_name = scope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StampError::config(format!("type attribute required in {name}")))?;

        let profile = match type_name {
            "Gaussian" => {
                check_all_params(
                    scope,
                    name,
                    &ParamSpec {
                        opt: &with_common(&[]),
                        single: &[&["sigma", "fwhm", "half_light_radius"]],
                        ignore: RENDER_KEYS,
                        ..ParamSpec::default()
                    },
                )?;
                let sigma = if let Some(sigma) = resolve::<f64>(scope, "sigma", ctx)? {
                    sigma
                } else if let Some(fwhm) = resolve::<f64>(scope, "fwhm", ctx)? {
                    fwhm / GAUSSIAN_FWHM_FACTOR
                } else {
                    resolve_required::<f64>(scope, "half_light_radius", ctx)?
                        / GAUSSIAN_HLR_FACTOR
                };
                Profile::gaussian(sigma, 1.0)?
            }
            "Exponential" => {
                check_all_params(
                    scope,
                    name,
                    &ParamSpec {
                        opt: &with_common(&[]),
                        single: &[&["scale_radius", "half_light_radius"]],
                        ignore: RENDER_KEYS,
                        ..ParamSpec::default()
                    },
                )?;
                let scale_radius = match resolve::<f64>(scope, "scale_radius", ctx)? {
                    Some(r0) => r0,
                    None => {
                        resolve_required::<f64>(scope, "half_light_radius", ctx)?
                            / EXPONENTIAL_HLR_FACTOR
                    }
                };
                Profile::exponential(scale_radius, 1.0)?
            }
            "Pixel" => {
                check_all_params(
                    scope,
                    name,
                    &ParamSpec {
                        req: &["xw"],
                        opt: &with_common(&["yw"]),
                        ignore: RENDER_KEYS,
                        ..ParamSpec::default()
                    },
                )?;
                let xw = resolve_required::<f64>(scope, "xw", ctx)?;
                let yw = resolve::<f64>(scope, "yw", ctx)?.unwrap_or(xw);
                Profile::pixel(xw, yw, 1.0)?
            }
            "Ring" => {
                check_all_params(
                    scope,
                    name,
                    &ParamSpec {
                        req: &["num", "first"],
                        opt: COMMON,
                        ignore: RENDER_KEYS,
                        ..ParamSpec::default()
                    },
                )?;
                match self.build_ring(scope, name, config, ctx)? {
                    BuildOutcome::Built(Some(first)) => first,
                    other => return Ok(other),
                }
            }
            other => {
                return Err(StampError::UnknownProfileType {
                    key: name.to_string(),
                    type_name: other.to_string(),
                })
            }
        };

        let profile = apply_common(profile, scope, name, type_name == "Ring", ctx)?;
        Ok(BuildOutcome::Built(Some(profile)))
    }

    /// Object `k` of a ring of `num` is the ring's first object rotated by
    /// `k·π/num`. The first object is built from a fresh context for the
    /// first index of the ring so every member shares its random draws.
    /// Those draws come from that context's stream; `ctx.rng` is not advanced.
    fn build_ring(
        &self,
        scope: &Value,
        name: &str,
        config: &StampConfig,
        ctx: &mut StampContext,
    ) -> Result<BuildOutcome> {
        let num = resolve_required::<usize>(scope, "num", ctx)?;
        if num == 0 {
            return Err(StampError::config(format!("{name}.num must be positive")));
        }
        let k = ctx.obj_num % num;
        let first_scope = &scope["first"];
        let mut first_ctx = StampContext::for_object(config, ctx.obj_num - k)?;
        let first_name = format!("{name}.first");
        match self.build_scope(first_scope, &first_name, config, &mut first_ctx)? {
            BuildOutcome::Built(Some(first)) => Ok(BuildOutcome::Built(Some(
                first.rotate(k as f64 * PI / num as f64),
            ))),
            BuildOutcome::Built(None) => Err(StampError::config(format!(
                "{first_name} did not produce a profile"
            ))),
            skipped => Ok(skipped),
        }
    }
}

/// A `skip` attribute may be a boolean or a message string.
fn skip_outcome(scope: &Value, ctx: &mut StampContext) -> Result<Option<BuildOutcome>> {
    let skip = match scope.get("skip") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if parse_bool_word(s).is_none() => {
            return Ok(Some(BuildOutcome::Skipped(Some(s.clone()))))
        }
        Some(_) => resolve_required::<bool>(scope, "skip", ctx)?,
    };
    Ok(skip.then_some(BuildOutcome::Skipped(None)))
}

fn apply_common(
    mut profile: Profile,
    scope: &Value,
    name: &str,
    keep_flux: bool,
    ctx: &mut StampContext,
) -> Result<Profile> {
    match resolve::<f64>(scope, "flux", ctx)? {
        Some(flux) => profile = profile.with_flux(flux),
        None if !keep_flux => profile = profile.with_flux(1.0),
        None => {}
    }
    if let Some(ellip) = resolve::<Shear>(scope, "ellip", ctx)? {
        profile = profile.shear(&ellip);
    }
    if let Some(degrees) = resolve::<f64>(scope, "rotate", ctx)? {
        profile = profile.rotate(degrees * PI / 180.0);
    }
    if let Some(shear) = resolve::<Shear>(scope, "shear", ctx)? {
        profile = profile.shear(&shear);
    }
    if let Some(shift) = resolve::<Position>(scope, "shift", ctx)? {
        profile = profile.shift(shift.x, shift.y);
        if name == ProfileKey::Gal.as_str() {
            ctx.gal_shift = Some(shift);
        }
    }
    if let Some(variance) = resolve::<f64>(scope, "whiten_variance", ctx)? {
        if variance < 0.0 || variance.is_nan() {
            return Err(StampError::config(format!(
                "{name}.whiten_variance must be non-negative, got {variance}"
            )));
        }
        profile = profile.with_noise(IntrinsicNoise::white(variance));
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileKind;
    use approx::assert_relative_eq;

    fn build(json: &str, key: ProfileKey, obj_num: usize) -> Result<BuildOutcome> {
        let config = StampConfig::from_json_str(json).unwrap();
        let mut ctx = StampContext::for_object(&config, obj_num).unwrap();
        ConfigProfileBuilder.build(key, &config, &mut ctx)
    }

    fn built(json: &str, key: ProfileKey) -> Profile {
        match build(json, key, 0).unwrap() {
            BuildOutcome::Built(Some(p)) => p,
            other => panic!("expected a profile, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_scope_is_none() {
        assert_eq!(
            build("{}", ProfileKey::Psf, 0).unwrap(),
            BuildOutcome::Built(None)
        );
    }

    #[test]
    fn test_gaussian_size_parameters() {
        let p = built(r#"{"psf": {"type": "Gaussian", "fwhm": 2.3548200450309493}}"#, ProfileKey::Psf);
        assert!(matches!(p.kind(), ProfileKind::Gaussian { sigma } if (sigma - 1.0).abs() < 1e-12));
        assert_relative_eq!(p.flux(), 1.0);

        let p = built(
            r#"{"gal": {"type": "Exponential", "half_light_radius": 1.6783469900166605, "flux": 50}}"#,
            ProfileKey::Gal,
        );
        assert!(
            matches!(p.kind(), ProfileKind::Exponential { scale_radius } if (scale_radius - 1.0).abs() < 1e-12)
        );
        assert_relative_eq!(p.flux(), 50.0);
    }

    #[test]
    fn test_size_exclusivity() {
        let err = build(
            r#"{"psf": {"type": "Gaussian", "sigma": 1.0, "fwhm": 2.0}}"#,
            ProfileKey::Psf,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, StampError::Config(_)));
    }

    #[test]
    fn test_unknown_type() {
        let err = build(r#"{"gal": {"type": "Sersic", "n": 4}}"#, ProfileKey::Gal, 0).unwrap_err();
        assert!(matches!(err, StampError::UnknownProfileType { key, .. } if key == "gal"));
    }

    #[test]
    fn test_skip_forms() {
        let msg = build(
            r#"{"gal": {"type": "Gaussian", "sigma": 1.0, "skip": "too faint"}}"#,
            ProfileKey::Gal,
            0,
        )
        .unwrap();
        assert_eq!(msg, BuildOutcome::Skipped(Some("too faint".to_string())));

        let plain = build(
            r#"{"gal": {"type": "Gaussian", "sigma": 1.0, "skip": true}}"#,
            ProfileKey::Gal,
            0,
        )
        .unwrap();
        assert_eq!(plain, BuildOutcome::Skipped(None));

        let listed = r#"{"gal": {"type": "Gaussian", "sigma": 1.0,
            "skip": {"type": "List", "items": [false, true]}}}"#;
        assert!(matches!(build(listed, ProfileKey::Gal, 0).unwrap(), BuildOutcome::Built(Some(_))));
        assert_eq!(build(listed, ProfileKey::Gal, 1).unwrap(), BuildOutcome::Skipped(None));
    }

    #[test]
    fn test_shift_recorded_for_gal() {
        let config = StampConfig::from_json_str(
            r#"{"gal": {"type": "Gaussian", "sigma": 1.0, "shift": {"x": 0.5, "y": -0.25}}}"#,
        )
        .unwrap();
        let mut ctx = StampContext::for_object(&config, 0).unwrap();
        ConfigProfileBuilder
            .build(ProfileKey::Gal, &config, &mut ctx)
            .unwrap();
        assert_eq!(ctx.gal_shift, Some(Position::new(0.5, -0.25)));
    }

    #[test]
    fn test_ring_rotates_first() {
        let json = r#"{
            "image": {"random_seed": {"type": "Sequence", "first": 10}},
            "gal": {"type": "Ring", "num": 4,
                    "first": {"type": "Gaussian", "sigma": 1.0, "flux": 3.0,
                              "ellip": {"type": "EBeta", "e": 0.3,
                                        "beta": {"type": "Random", "min": 0, "max": 180}},
                              "shift": [1.0, 0.0]}}
        }"#;
        let p0 = match build(json, ProfileKey::Gal, 4).unwrap() {
            BuildOutcome::Built(Some(p)) => p,
            other => panic!("{other:?}"),
        };
        let p2 = match build(json, ProfileKey::Gal, 6).unwrap() {
            BuildOutcome::Built(Some(p)) => p,
            other => panic!("{other:?}"),
        };
        assert_relative_eq!(p2.flux(), 3.0);
        // Object 6 is k = 2 of the ring starting at 4: rotated by 90 degrees.
        assert_relative_eq!(p2.shift_offset().x, -p0.shift_offset().y, epsilon = 1e-12);
        assert_relative_eq!(p2.shift_offset().y, p0.shift_offset().x, epsilon = 1e-12);
        // Rotating a sheared profile by 90 degrees flips its ellipticity.
        let (k0, k2) = (p0.k_value(0.7, 0.0).re, p2.k_value(0.0, 0.7).re);
        assert_relative_eq!(k0.abs(), k2.abs(), max_relative = 1e-9);
    }

    #[test]
    fn test_whiten_variance_attaches_noise() {
        let p = built(
            r#"{"gal": {"type": "Gaussian", "sigma": 1.0, "whiten_variance": 2.0}}"#,
            ProfileKey::Gal,
        );
        assert_relative_eq!(p.noise().unwrap().variance(), 2.0);
    }
}
