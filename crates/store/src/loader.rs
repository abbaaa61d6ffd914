use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Config filenames probed under the root, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "fortistate.config.toml",
    "fortistate.config.json",
    "fortistate.toml",
];

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Declarative plugin/preset configuration file.
///
/// `stores` entries become registered (plugin-owned) stores. String entries
/// in `presets` / `plugins` are extra files or directories that contribute
/// more stores and join the watch set; inline tables in `presets` define
/// named presets for the preset catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub stores: BTreeMap<String, StoreDecl>,
    #[serde(default)]
    pub presets: Vec<Value>,
    #[serde(default)]
    pub plugins: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDecl {
    pub value: Value,
}

/// A named preset from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
}

/// Result of one [`PluginLoader::load`] pass.
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    /// Number of files that contributed stores or presets.
    pub loaded: usize,
    pub config_path: Option<PathBuf>,
    pub config: Option<ConfigFile>,
}

/// Resolves and parses the plugin/preset configuration, tracking the set of
/// registered store keys across hot reloads.
pub struct PluginLoader {
    registered: Mutex<BTreeMap<String, Value>>,
    presets: Mutex<Vec<Preset>>,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(BTreeMap::new()),
            presets: Mutex::new(Vec::new()),
        }
    }

    /// First existing default config file under `root`.
    pub fn resolve_config_path(root: &Path) -> Option<PathBuf> {
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.is_file())
    }

    /// Re-resolve and parse the config, replacing the registered-store set.
    ///
    /// A missing config file is not an error: it clears the registered set
    /// and reports `loaded: 0`.
    pub fn load(&self, root: &Path) -> Result<LoadOutcome, LoaderError> {
        let Some(config_path) = Self::resolve_config_path(root) else {
            self.registered.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.presets.lock().unwrap_or_else(|e| e.into_inner()).clear();
            return Ok(LoadOutcome::default());
        };

        let config = parse_config_file(&config_path)?;
        let mut loaded = 1;
        let mut registered: BTreeMap<String, Value> = config
            .stores
            .iter()
            .map(|(key, decl)| (key.clone(), decl.value.clone()))
            .collect();
        let mut presets: Vec<Preset> = Vec::new();

        for entry in config.presets.iter().chain(config.plugins.iter()) {
            match entry {
                Value::String(rel) => {
                    let path = root.join(rel);
                    for file in contributing_files(&path) {
                        match parse_config_file(&file) {
                            Ok(extra) => {
                                loaded += 1;
                                for (key, decl) in extra.stores {
                                    registered.insert(key, decl.value);
                                }
                                presets.extend(inline_presets(&extra.presets));
                            }
                            Err(e) => {
                                tracing::warn!(path = %file.display(), "Skipping unparsable plugin file: {e}");
                            }
                        }
                    }
                }
                other => {
                    if let Some(preset) = as_inline_preset(other) {
                        presets.push(preset);
                    }
                }
            }
        }

        *self.registered.lock().unwrap_or_else(|e| e.into_inner()) = registered;
        *self.presets.lock().unwrap_or_else(|e| e.into_inner()) = presets;

        Ok(LoadOutcome {
            loaded,
            config_path: Some(config_path),
            config: Some(config),
        })
    }

    /// Keys and initial values registered by the most recent load.
    pub fn registered(&self) -> BTreeMap<String, Value> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Presets contributed by the most recent load.
    pub fn presets(&self) -> Vec<Preset> {
        self.presets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn inline_presets(entries: &[Value]) -> Vec<Preset> {
    entries.iter().filter_map(as_inline_preset).collect()
}

fn as_inline_preset(value: &Value) -> Option<Preset> {
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let preset_value = obj.get("value")?.clone();
    let css = obj.get("css").and_then(|c| c.as_str()).map(String::from);
    Some(Preset {
        name,
        value: preset_value,
        css,
    })
}

/// A string entry resolves to itself when it is a file, or to every `*.toml`
/// directly inside it when it is a directory.
fn contributing_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    if path.is_dir() {
        let Ok(entries) = std::fs::read_dir(path) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("toml")
            })
            .collect();
        files.sort();
        return files;
    }
    Vec::new()
}

fn parse_config_file(path: &Path) -> Result<ConfigFile, LoaderError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&contents).map_err(|e| LoaderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    } else {
        toml::from_str(&contents).map_err(|e| LoaderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
