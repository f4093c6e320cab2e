//! Stamp configuration tree.
//!
//! The configuration is a JSON object with `image`, `psf`, `pix`, `gal` and
//! `output` scopes. It is normalized once when loaded and treated as read-only
//! afterwards; everything that changes while an object is rendered lives in the
//! per-object [`crate::stamp::StampContext`].

pub mod params;
pub mod value;

use std::path::Path;

use log::debug;
use serde_json::{json, Map, Value};

pub use params::{check_all_params, ParamSpec};
pub use value::{parse_value, resolve, resolve_required, ParamValue};

use crate::error::{Result, StampError};
use crate::image_proc::Position;

#[derive(Debug, Clone, PartialEq)]
pub struct StampConfig {
    root: Value,
    image_origin: (i64, i64),
    image_center: Position,
}

impl StampConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_value(mut root: Value) -> Result<Self> {
        normalize(&mut root)?;

        let image = &root["image"];
        let image_origin = match image.get("image_origin") {
            Some(v) => {
                let pos = value::literal_position(v).ok_or_else(|| {
                    StampError::config(format!("image.image_origin must be a position, got {v}"))
                })?;
                if pos.x.fract() != 0.0 || pos.y.fract() != 0.0 {
                    return Err(StampError::config("image.image_origin must be integral"));
                }
                (pos.x as i64, pos.y as i64)
            }
            None => (1, 1),
        };
        let image_center = match image.get("image_center") {
            Some(v) => value::literal_position(v).ok_or_else(|| {
                StampError::config(format!("image.image_center must be a position, got {v}"))
            })?,
            None => Position::default(),
        };

        Ok(Self {
            root,
            image_origin,
            image_center,
        })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// A top-level scope such as `"gal"`.
    pub fn scope(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    pub fn image(&self) -> &Value {
        &self.root["image"]
    }

    /// `image.<key>` if present.
    pub fn image_key(&self, key: &str) -> Option<&Value> {
        self.image().get(key)
    }

    /// `output.<scope>.<key>` if present.
    pub fn output_key(&self, scope: &str, key: &str) -> Option<&Value> {
        self.root.get("output")?.get(scope)?.get(key)
    }

    pub fn noise(&self) -> Option<&Value> {
        self.image_key("noise")
    }

    pub fn has_noise(&self) -> bool {
        self.noise().is_some()
    }

    pub fn image_origin(&self) -> (i64, i64) {
        self.image_origin
    }

    pub fn image_center(&self) -> Position {
        self.image_center
    }

    /// Number of objects in a galaxy ring when `gal.type` is `Ring` with a
    /// literal `num`.
    pub fn ring_period(&self) -> Option<usize> {
        let gal = self.scope("gal")?;
        if gal.get("type")?.as_str()? != "Ring" {
            return None;
        }
        let num = gal.get("num")?;
        let period = <usize as ParamValue>::from_literal(num).filter(|n| *n > 0);
        if period.is_none() {
            debug!(
                "gal.num = {num} is not a positive literal, ring chunks fall back to one object"
            );
        }
        period
    }
}

/// Insert the implicit defaults. Applying this twice leaves the tree unchanged.
pub fn normalize(root: &mut Value) -> Result<()> {
    let top = root
        .as_object_mut()
        .ok_or_else(|| StampError::config("configuration root must be a JSON object"))?;
    let image = top
        .entry("image")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StampError::config("image is not a dict"))?;

    image.entry("pixel_scale").or_insert(json!(1.0));
    image.entry("draw_method").or_insert(json!("fft"));

    for (key, default_type) in [("noise", "Poisson"), ("wcs", "Shear")] {
        if let Some(scope) = image.get_mut(key) {
            let map = scope
                .as_object_mut()
                .ok_or_else(|| StampError::config(format!("image.{key} is not a dict")))?;
            map.entry("type").or_insert(json!(default_type));
        }
    }
    Ok(())
}
