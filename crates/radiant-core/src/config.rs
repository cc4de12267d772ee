//! Editor configuration and the user registry.
//!
//! `EditorConfig` is loaded once from JSON at startup and describes where game
//! assets live. The `Registry` is the mutable key/value store holding user
//! preferences under `user/ui/**`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::signal::Signal;

/// Registry key of the brush texture-lock toggle.
pub const RKEY_TEXTURE_LOCK: &str = "user/ui/brush/textureLock";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory archive described inline in the configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub name: String,
    /// Logical path to file contents.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// Game and filesystem setup for one editing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_game_type")]
    pub game_type: String,
    #[serde(default)]
    pub engine_path: PathBuf,
    #[serde(default = "default_base_game")]
    pub base_game: String,
    /// Full path of the active mod; the first writable search path.
    #[serde(default)]
    pub mod_path: Option<PathBuf>,
    /// Per-user engine directory, used for writing when no mod is active.
    #[serde(default)]
    pub user_engine_path: Option<PathBuf>,
    #[serde(default)]
    pub vfs_paths: Vec<PathBuf>,
    #[serde(default)]
    pub archives: Vec<ArchiveConfig>,
    /// Physical directory holding the editor's fallback bitmaps.
    #[serde(default = "default_bitmaps_path")]
    pub bitmaps_path: PathBuf,
    /// Initial registry contents.
    #[serde(default)]
    pub registry: BTreeMap<String, String>,
}

fn default_game_type() -> String {
    "doom3".to_string()
}

fn default_base_game() -> String {
    "base".to_string()
}

fn default_bitmaps_path() -> PathBuf {
    PathBuf::from("bitmaps")
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            game_type: default_game_type(),
            engine_path: PathBuf::new(),
            base_game: default_base_game(),
            mod_path: None,
            user_engine_path: None,
            vfs_paths: Vec::new(),
            archives: Vec::new(),
            bitmaps_path: default_bitmaps_path(),
            registry: BTreeMap::new(),
        }
    }
}

impl EditorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Physical search paths in priority order: mod, user engine, base game, extras.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(mod_path) = &self.mod_path {
            paths.push(mod_path.clone());
        }
        if let Some(user_path) = &self.user_engine_path {
            paths.push(user_path.join(&self.base_game));
        }
        if !self.engine_path.as_os_str().is_empty() {
            paths.push(self.engine_path.join(&self.base_game));
        }
        paths.extend(self.vfs_paths.iter().cloned());

        let mut unique = Vec::new();
        for path in paths {
            if !unique.contains(&path) {
                unique.push(path);
            }
        }
        unique
    }

    /// Directory new files are written to: the mod path, or the user engine path.
    pub fn writable_root(&self) -> Option<PathBuf> {
        self.mod_path
            .clone()
            .or_else(|| self.user_engine_path.as_ref().map(|p| p.join(&self.base_game)))
    }
}

/// Thread-safe string key/value store for user preferences.
#[derive(Debug, Default)]
pub struct Registry {
    values: RwLock<BTreeMap<String, String>>,
    key_changed: Signal<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
            key_changed: Signal::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let changed = {
            let mut values = self.values.write();
            values.insert(key.to_string(), value.clone()) != Some(value)
        };
        if changed {
            self.key_changed.emit(&key.to_string());
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key).as_deref(), Some("1" | "true"))
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, if value { "1" } else { "0" });
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn key_exists(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Emitted with the key name whenever a value actually changes.
    pub fn signal_key_changed(&self) -> &Signal<String> {
        &self.key_changed
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&*self.values.read())?)
    }

    /// Merges the given JSON object into the registry.
    pub fn import_json(&self, json: &str) -> Result<(), ConfigError> {
        let values: BTreeMap<String, String> = serde_json::from_str(json)?;
        for (key, value) in values {
            self.set(&key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_config_defaults_from_json() {
        let config = EditorConfig::from_json(r#"{ "engine_path": "/games/doom3" }"#).unwrap();
        assert_eq!(config.game_type, "doom3");
        assert_eq!(config.base_game, "base");
        assert_eq!(config.search_paths(), vec![PathBuf::from("/games/doom3/base")]);
        assert_eq!(config.writable_root(), None);
    }

    #[test]
    fn test_search_path_order() {
        let config = EditorConfig {
            engine_path: PathBuf::from("/d3"),
            mod_path: Some(PathBuf::from("/d3/mymod")),
            user_engine_path: Some(PathBuf::from("/home/u/.doom3")),
            ..Default::default()
        };
        assert_eq!(
            config.search_paths(),
            vec![
                PathBuf::from("/d3/mymod"),
                PathBuf::from("/home/u/.doom3/base"),
                PathBuf::from("/d3/base"),
            ]
        );
        assert_eq!(config.writable_root(), Some(PathBuf::from("/d3/mymod")));
    }

    #[test]
    fn test_registry_signals_only_on_change() {
        let registry = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.signal_key_changed().connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        registry.set_bool(RKEY_TEXTURE_LOCK, true);
        registry.set_bool(RKEY_TEXTURE_LOCK, true);
        assert!(registry.get_bool(RKEY_TEXTURE_LOCK));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        registry.import_json(r#"{ "user/ui/grid/size": "8" }"#).unwrap();
        assert_eq!(registry.get_int("user/ui/grid/size"), Some(8));
    }
}
