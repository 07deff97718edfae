//! Configuration layering.
//!
//! Merge semantics:
//! - Tables: deep-merge by key
//! - Arrays: replace (overlay wins entirely)
//! - Scalars: override (overlay wins)

use toml::Value;

/// Deep merge `overlay` on top of `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Table(mut base_map), Value::Table(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Table(base_map)
        }
        (_, overlay) => overlay,
    }
}
