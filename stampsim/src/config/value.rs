//! Resolution of configuration values.
//!
//! A value is either a JSON literal or a typed object such as
//! `{"type": "Sequence", "first": 1}`. Typed values are evaluated against the
//! per-object [`StampContext`]: sequences and lists are indexed by the object
//! number, random values draw from the object's RNG.
//!
//! Unlike a stateful counter, `Sequence` is a pure function of the object
//! number, so any object can be rendered in isolation and a worker pool
//! produces the same values as a sequential run.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde_json::Value;

use super::params::{check_all_params, ParamSpec};
use crate::error::{Result, StampError};
use crate::image_proc::Position;
use crate::profile::Shear;
use crate::stamp::StampContext;

/// A type that can be read out of a configuration value.
pub trait ParamValue: Sized {
    /// Name used in error messages.
    const TYPE_NAME: &'static str;

    /// Parse a plain JSON literal.
    fn from_literal(value: &Value) -> Option<Self>;

    /// Evaluate a typed value object for this type. `Ok(None)` means the
    /// type tag is not valid for `Self`.
    fn from_typed(
        _type_name: &str,
        _scope: &Value,
        _key: &str,
        _ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        Ok(None)
    }
}

/// Resolve `scope[key]`. A missing key yields `Ok(None)`.
pub fn resolve<T: ParamValue>(
    scope: &Value,
    key: &str,
    ctx: &mut StampContext,
) -> Result<Option<T>> {
    match scope.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_value(value, key, ctx).map(Some),
    }
}

/// Resolve `scope[key]`, failing when it is absent.
pub fn resolve_required<T: ParamValue>(
    scope: &Value,
    key: &str,
    ctx: &mut StampContext,
) -> Result<T> {
    resolve(scope, key, ctx)?
        .ok_or_else(|| StampError::config(format!("attribute {key} is required")))
}

/// Evaluate a single configuration value.
pub fn parse_value<T: ParamValue>(value: &Value, key: &str, ctx: &mut StampContext) -> Result<T> {
    if let Some(type_name) = value_type(value) {
        if type_name == "List" {
            return parse_list(value, key, ctx);
        }
        return T::from_typed(type_name, value, key, ctx)?.ok_or_else(|| {
            StampError::config(format!(
                "invalid value type {type_name} for {key} (expected {})",
                T::TYPE_NAME
            ))
        });
    }
    T::from_literal(value).ok_or_else(|| {
        StampError::config(format!(
            "could not parse {key} = {value} as {}",
            T::TYPE_NAME
        ))
    })
}

/// The `type` tag of a typed value object.
fn value_type(value: &Value) -> Option<&str> {
    value.as_object()?.get("type")?.as_str()
}

fn parse_list<T: ParamValue>(scope: &Value, key: &str, ctx: &mut StampContext) -> Result<T> {
    check_all_params(
        scope,
        key,
        &ParamSpec {
            req: &["items"],
            opt: &["index"],
            ..ParamSpec::default()
        },
    )?;
    let items = scope
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| StampError::config(format!("items for List {key} must be an array")))?;
    if items.is_empty() {
        return Err(StampError::config(format!("List {key} has no items")));
    }
    let index = match resolve::<i64>(scope, "index", ctx)? {
        Some(i) if i < 0 || i as usize >= items.len() => {
            return Err(StampError::config(format!(
                "index {i} out of bounds for List {key} of length {}",
                items.len()
            )))
        }
        Some(i) => i as usize,
        None => ctx.obj_num % items.len(),
    };
    parse_value(&items[index], key, ctx)
}

/// Position of `obj_num` in a sequence, after `repeat` and wrapping at `nitems`.
fn sequence_index(obj_num: usize, repeat: i64, nitems: Option<i64>) -> i64 {
    let k = obj_num as i64 / repeat.max(1);
    match nitems {
        Some(n) if n > 0 => k.rem_euclid(n),
        _ => k,
    }
}

fn sequence_spec() -> ParamSpec<'static> {
    ParamSpec {
        opt: &["first", "step", "last", "repeat"],
        ..ParamSpec::default()
    }
}

impl ParamValue for f64 {
    const TYPE_NAME: &'static str = "float";

    fn from_literal(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        match type_name {
            "Sequence" => {
                check_all_params(scope, key, &sequence_spec())?;
                let first = resolve::<f64>(scope, "first", ctx)?.unwrap_or(0.0);
                let step = resolve::<f64>(scope, "step", ctx)?.unwrap_or(1.0);
                let repeat = resolve::<i64>(scope, "repeat", ctx)?.unwrap_or(1);
                let nitems = match resolve::<f64>(scope, "last", ctx)? {
                    Some(last) if step != 0.0 => {
                        Some(((last - first) / step + 1e-10).floor() as i64 + 1)
                    }
                    _ => None,
                };
                let k = sequence_index(ctx.obj_num, repeat, nitems);
                Ok(Some(first + k as f64 * step))
            }
            "Random" => {
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        req: &["min", "max"],
                        ..ParamSpec::default()
                    },
                )?;
                let min = resolve_required::<f64>(scope, "min", ctx)?;
                let max = resolve_required::<f64>(scope, "max", ctx)?;
                if max < min {
                    return Err(StampError::config(format!(
                        "Random {key}: max ({max}) < min ({min})"
                    )));
                }
                Ok(Some(min + (max - min) * ctx.rng.random::<f64>()))
            }
            "RandomGaussian" => {
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        req: &["sigma"],
                        opt: &["mean"],
                        ..ParamSpec::default()
                    },
                )?;
                let mean = resolve::<f64>(scope, "mean", ctx)?.unwrap_or(0.0);
                let sigma = resolve_required::<f64>(scope, "sigma", ctx)?;
                let normal = Normal::new(mean, sigma).map_err(|e| {
                    StampError::config(format!("RandomGaussian {key}: {e}"))
                })?;
                Ok(Some(normal.sample(&mut ctx.rng)))
            }
            _ => Ok(None),
        }
    }
}

impl ParamValue for i64 {
    const TYPE_NAME: &'static str = "int";

    fn from_literal(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        match type_name {
            "Sequence" => {
                check_all_params(scope, key, &sequence_spec())?;
                let first = resolve::<i64>(scope, "first", ctx)?.unwrap_or(0);
                let step = resolve::<i64>(scope, "step", ctx)?.unwrap_or(1);
                let repeat = resolve::<i64>(scope, "repeat", ctx)?.unwrap_or(1);
                let nitems = match resolve::<i64>(scope, "last", ctx)? {
                    Some(last) if step != 0 => Some((last - first).div_euclid(step) + 1),
                    _ => None,
                };
                let k = sequence_index(ctx.obj_num, repeat, nitems);
                Ok(Some(first.wrapping_add(k.wrapping_mul(step))))
            }
            "Random" => {
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        req: &["min", "max"],
                        ..ParamSpec::default()
                    },
                )?;
                let min = resolve_required::<i64>(scope, "min", ctx)?;
                let max = resolve_required::<i64>(scope, "max", ctx)?;
                if max < min {
                    return Err(StampError::config(format!(
                        "Random {key}: max ({max}) < min ({min})"
                    )));
                }
                Ok(Some(ctx.rng.random_range(min..=max)))
            }
            _ => Ok(None),
        }
    }
}

impl ParamValue for usize {
    const TYPE_NAME: &'static str = "non-negative int";

    fn from_literal(value: &Value) -> Option<Self> {
        i64::from_literal(value).and_then(|v| usize::try_from(v).ok())
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        match i64::from_typed(type_name, scope, key, ctx)? {
            Some(v) => usize::try_from(v)
                .map(Some)
                .map_err(|_| StampError::config(format!("{key} must be non-negative, got {v}"))),
            None => Ok(None),
        }
    }
}

impl ParamValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_literal(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => parse_bool_word(s),
            _ => None,
        }
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        match type_name {
            "Random" => {
                check_all_params(scope, key, &ParamSpec::default())?;
                Ok(Some(ctx.rng.random::<bool>()))
            }
            _ => Ok(None),
        }
    }
}

/// Interpret the usual spellings of a boolean.
pub fn parse_bool_word(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl ParamValue for String {
    const TYPE_NAME: &'static str = "str";

    fn from_literal(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl ParamValue for Position {
    const TYPE_NAME: &'static str = "position";

    fn from_literal(value: &Value) -> Option<Self> {
        literal_position(value)
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        match type_name {
            "XY" => {
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        req: &["x", "y"],
                        ..ParamSpec::default()
                    },
                )?;
                let x = resolve_required::<f64>(scope, "x", ctx)?;
                let y = resolve_required::<f64>(scope, "y", ctx)?;
                Ok(Some(Position::new(x, y)))
            }
            _ => Ok(None),
        }
    }
}

/// Parse `{"x": .., "y": ..}` or `[x, y]` with literal numbers.
pub fn literal_position(value: &Value) -> Option<Position> {
    match value {
        Value::Array(items) if items.len() == 2 => Some(Position::new(
            f64::from_literal(&items[0])?,
            f64::from_literal(&items[1])?,
        )),
        Value::Object(map) if !map.contains_key("type") && map.len() == 2 => Some(Position::new(
            f64::from_literal(map.get("x")?)?,
            f64::from_literal(map.get("y")?)?,
        )),
        _ => None,
    }
}

impl ParamValue for Shear {
    const TYPE_NAME: &'static str = "shear";

    fn from_literal(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.contains_key("type") {
            return None;
        }
        let g1 = map.get("g1").map_or(Some(0.0), f64::from_literal)?;
        let g2 = map.get("g2").map_or(Some(0.0), f64::from_literal)?;
        Shear::new(g1, g2).ok()
    }

    fn from_typed(
        type_name: &str,
        scope: &Value,
        key: &str,
        ctx: &mut StampContext,
    ) -> Result<Option<Self>> {
        let shear = match type_name {
            "G1G2" => {
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        opt: &["g1", "g2"],
                        ..ParamSpec::default()
                    },
                )?;
                let g1 = resolve::<f64>(scope, "g1", ctx)?.unwrap_or(0.0);
                let g2 = resolve::<f64>(scope, "g2", ctx)?.unwrap_or(0.0);
                Shear::new(g1, g2)?
            }
            "GBeta" | "EBeta" | "QBeta" => {
                let magnitude_key = match type_name {
                    "GBeta" => "g",
                    "EBeta" => "e",
                    _ => "q",
                };
                check_all_params(
                    scope,
                    key,
                    &ParamSpec {
                        req: &[magnitude_key, "beta"],
                        ..ParamSpec::default()
                    },
                )?;
                let magnitude = resolve_required::<f64>(scope, magnitude_key, ctx)?;
                let beta = resolve_required::<f64>(scope, "beta", ctx)? * PI / 180.0;
                match type_name {
                    "GBeta" => Shear::from_g_beta(magnitude, beta)?,
                    "EBeta" => Shear::from_e_beta(magnitude, beta)?,
                    _ => Shear::from_q_beta(magnitude, beta)?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(shear))
    }
}
