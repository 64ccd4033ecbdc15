//! Persisted visual/behavior options.
//!
//! A flat string-keyed store persisted as JSON. Top-level categories hold
//! daemon-wide options; per-map categories are addressed through the
//! coordinator's `device.<duid>.map.<map_id>.<category>` key scheme, which
//! is the stable join key between live state and persisted options.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::debug;

use crate::map::codec::Color;
use crate::map::codec::Drawable;
use crate::map::codec::ImageConfig;
use crate::map::codec::Sizes;

/// Daemon-wide option category.
pub const CAT_DOMAIN: &str = "vacuumd";
/// Per-map image transform category.
pub const CAT_IMAGE_CONFIG: &str = "image_config";
/// Per-map room color overrides.
pub const CAT_ROOM_COLORS: &str = "room_colors";
/// Global drawable-layer toggles.
pub const CAT_DRAWABLES: &str = "drawables";
/// Global object sizes.
pub const CAT_SIZES: &str = "sizes";

const DEFAULT_INCLUDE_SHARED: bool = true;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to read options store: {0}")]
    Io(#[from] std::io::Error),

    #[error("options store is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct OptionsStore {
    path: Option<PathBuf>,
    values: HashMap<String, Value>,
}

impl OptionsStore {
    /// Load the store from disk; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let values = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no options store yet, starting empty");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// In-memory store, used by tests and first-run defaults.
    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Merge a patch into one key's payload, additively by field, then
    /// persist. Mirrors how option forms update only the fields they show.
    pub fn update(&mut self, key: &str, patch: Value) -> Result<(), OptionsError> {
        let slot = self.values.entry(key.to_string()).or_insert(Value::Null);
        match patch {
            Value::Object(incoming) if slot.is_object() => {
                if let Some(current) = slot.as_object_mut() {
                    for (k, v) in incoming {
                        current.insert(k, v);
                    }
                }
            }
            other => *slot = other,
        }
        self.save()
    }

    fn save(&self) -> Result<(), OptionsError> {
        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_string_pretty(&self.values)?)?;
        }
        Ok(())
    }

    /// Whether devices shared from other accounts are included at discovery.
    pub fn include_shared(&self) -> bool {
        self.values
            .get(CAT_DOMAIN)
            .and_then(|v| v.get("include_shared"))
            .and_then(Value::as_bool)
            .unwrap_or(DEFAULT_INCLUDE_SHARED)
    }

    /// Enabled drawable layers: every layer defaults to on, stored toggles
    /// override per layer.
    pub fn drawables(&self) -> Vec<Drawable> {
        let toggles = self.values.get(CAT_DRAWABLES);
        Drawable::iter()
            .filter(|drawable| {
                toggles
                    .and_then(|v| v.get(drawable.as_ref()))
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Object sizes: stored values overlaid on defaults.
    pub fn sizes(&self) -> Sizes {
        self.typed_or_default(self.values.get(CAT_SIZES))
    }

    /// Per-map image transform, addressed by the coordinator's key scheme.
    pub fn image_config(&self, key: &str) -> ImageConfig {
        self.typed_or_default(self.values.get(key))
    }

    /// Per-map room color overrides, room id -> RGBA.
    pub fn room_colors(&self, key: &str) -> HashMap<u8, Color> {
        let Some(stored) = self.values.get(key).and_then(Value::as_object) else {
            return HashMap::new();
        };
        stored
            .iter()
            .filter_map(|(room, color)| {
                let id = room.parse::<u8>().ok()?;
                let rgba: Color = serde_json::from_value(color.clone()).ok()?;
                Some((id, rgba))
            })
            .collect()
    }

    fn typed_or_default<T>(&self, value: Option<&Value>) -> T
    where
        T: Default + serde::de::DeserializeOwned,
    {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_categories_yield_defaults() {
        let store = OptionsStore::ephemeral();
        assert_eq!(store.drawables().len(), 3);
        assert_eq!(store.sizes().robot_radius, Sizes::default().robot_radius);
        assert_eq!(store.image_config("device.x.map.0.image_config").scale, 1.0);
        assert!(store.room_colors("device.x.map.0.room_colors").is_empty());
        assert!(store.include_shared());
    }

    #[test]
    fn stored_values_overlay_defaults() {
        let mut store = OptionsStore::ephemeral();
        store
            .update(CAT_SIZES, json!({"robot_radius": 6.5}))
            .unwrap();
        store
            .update(CAT_DRAWABLES, json!({"path": false}))
            .unwrap();

        let sizes = store.sizes();
        assert_eq!(sizes.robot_radius, 6.5);
        assert_eq!(sizes.path_width, Sizes::default().path_width);

        let drawables = store.drawables();
        assert!(!drawables.contains(&Drawable::Path));
        assert!(drawables.contains(&Drawable::Charger));
    }

    #[test]
    fn update_merges_by_field() {
        let mut store = OptionsStore::ephemeral();
        let key = "device.abc.map.1.image_config";
        store.update(key, json!({"scale": 2.0})).unwrap();
        store.update(key, json!({"rotate": 90})).unwrap();

        let config = store.image_config(key);
        assert_eq!(config.scale, 2.0);
        assert_eq!(config.rotate, 90);
    }

    #[test]
    fn room_colors_parse_ids_and_rgba() {
        let mut store = OptionsStore::ephemeral();
        let key = "device.abc.map.1.room_colors";
        store
            .update(key, json!({"0": [255, 0, 0, 255], "bad": [1], "7": [0, 0, 255, 128]}))
            .unwrap();

        let colors = store.room_colors(key);
        assert_eq!(colors.get(&0), Some(&[255, 0, 0, 255]));
        assert_eq!(colors.get(&7), Some(&[0, 0, 255, 128]));
        assert_eq!(colors.len(), 2);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");

        let mut store = OptionsStore::load(&path).unwrap();
        store
            .update(CAT_DOMAIN, json!({"include_shared": false}))
            .unwrap();

        let reloaded = OptionsStore::load(&path).unwrap();
        assert!(!reloaded.include_shared());
    }
}
