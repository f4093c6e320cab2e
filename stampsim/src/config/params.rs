//! Attribute validation for configuration scopes.

use serde_json::Value;

use crate::error::{Result, StampError};

/// Allowed attributes of a scope.
///
/// Every key in `req` must be present. Each group in `single` must have
/// exactly one member present. Keys in `opt` and `ignore` may appear. Anything
/// else is rejected. The `type` key and keys starting with `#` are always
/// allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamSpec<'a> {
    pub req: &'a [&'a str],
    pub opt: &'a [&'a str],
    pub single: &'a [&'a [&'a str]],
    pub ignore: &'a [&'a str],
}

impl ParamSpec<'_> {
    fn allows(&self, key: &str) -> bool {
        key == "type"
            || key.starts_with('#')
            || listed(self.req, key)
            || listed(self.opt, key)
            || listed(self.ignore, key)
            || self.single.iter().any(|group| listed(group, key))
    }
}

fn listed(keys: &[&str], key: &str) -> bool {
    keys.iter().any(|k| *k == key)
}

/// Check the attributes of `scope` against `spec`. `name` is used in error
/// messages.
pub fn check_all_params(scope: &Value, name: &str, spec: &ParamSpec) -> Result<()> {
    let map = scope
        .as_object()
        .ok_or_else(|| StampError::config(format!("{name} is not a dict")))?;

    for key in spec.req {
        if !map.contains_key(*key) {
            return Err(StampError::config(format!(
                "attribute {key} is required for {name}"
            )));
        }
    }

    for group in spec.single {
        let present = group.iter().filter(|k| map.contains_key(**k)).count();
        if present == 0 {
            return Err(StampError::config(format!(
                "one of the attributes {group:?} is required for {name}"
            )));
        }
        if present > 1 {
            return Err(StampError::config(format!(
                "only one of the attributes {group:?} is allowed for {name}"
            )));
        }
    }

    if let Some(key) = map.keys().find(|k| !spec.allows(k)) {
        return Err(StampError::config(format!(
            "unexpected attribute {key} found for {name}"
        )));
    }
    Ok(())
}
