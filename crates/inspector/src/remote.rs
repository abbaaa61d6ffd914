use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

/// Un-namespaced persistence file from older releases, migrated on startup.
pub const LEGACY_REMOTE_FILE: &str = ".fortistate-remote-stores.json";

/// Lowercase, non-alphanumerics collapsed to single dashes, trimmed.
fn sanitize_namespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// First usable candidate: env override, package name, root basename,
/// then `"default"`.
pub fn derive_namespace(
    override_ns: Option<&str>,
    package_name: Option<&str>,
    root: &Path,
) -> String {
    let basename = root
        .canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(root)
        .file_name()
        .map(|n| n.to_string_lossy().to_string());

    for candidate in [override_ns, package_name, basename.as_deref()]
        .into_iter()
        .flatten()
    {
        let sanitized = sanitize_namespace(candidate);
        if !sanitized.is_empty() {
            return sanitized;
        }
    }
    "default".to_string()
}

struct RegistryState {
    entries: BTreeMap<String, Value>,
    plugin_owned: HashSet<String>,
}

/// In-memory mirror of remote-origin store values with namespaced on-disk
/// persistence.
///
/// A key is either plugin-owned (contributed by the config reloader, which
/// may remove it) or remote-owned (written by `/register` or `/change`).
pub struct RemoteStoreRegistry {
    path: PathBuf,
    namespace: String,
    debug: bool,
    state: Mutex<RegistryState>,
}

impl RemoteStoreRegistry {
    /// Open the registry for `root`. When the namespaced file is absent but
    /// the legacy file exists and the namespace was derived (not overridden),
    /// the legacy file is migrated by rename, falling back to copy+unlink.
    pub fn open(root: &Path, namespace: String, migrate_legacy: bool, debug: bool) -> Self {
        let dir = root.join(".fortistate");
        let path = dir.join(format!("remote-stores-{namespace}.json"));

        if migrate_legacy && !path.exists() {
            let legacy = root.join(LEGACY_REMOTE_FILE);
            if legacy.exists() {
                let _ = std::fs::create_dir_all(&dir);
                match std::fs::rename(&legacy, &path) {
                    Ok(()) => {
                        tracing::info!(to = %path.display(), "Migrated legacy remote-store file");
                    }
                    Err(_) => {
                        // Rename can fail across filesystems; copy instead.
                        match std::fs::copy(&legacy, &path) {
                            Ok(_) => {
                                let _ = std::fs::remove_file(&legacy);
                                tracing::info!(to = %path.display(), "Copied legacy remote-store file");
                            }
                            Err(e) => {
                                tracing::warn!("Legacy remote-store migration failed: {e}");
                            }
                        }
                    }
                }
            }
        }

        Self {
            path,
            namespace,
            debug,
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                plugin_owned: HashSet::new(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge the persisted map into memory. Persisted values never clobber
    /// keys already written this run.
    pub fn load_initial(&self) {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return;
        };
        let persisted: BTreeMap<String, Value> = match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Unreadable remote-store file: {e}");
                return;
            }
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in persisted {
            state.entries.entry(key).or_insert(value);
        }
    }

    /// Returns true when the key did not exist before.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let created = state.entries.insert(key.to_string(), value).is_none();
        self.persist_locked(&state);
        created
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let existed = state.entries.remove(key).is_some();
        state.plugin_owned.remove(key);
        if existed {
            self.persist_locked(&state);
        }
        existed
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(key)
            .cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }

    /// Mark or unmark a key as contributed by the config reloader.
    pub fn set_plugin_owned(&self, key: &str, owned: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if owned {
            state.plugin_owned.insert(key.to_string());
        } else {
            state.plugin_owned.remove(key);
        }
    }

    pub fn plugin_owned_keys(&self) -> HashSet<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .plugin_owned
            .clone()
    }

    pub fn is_plugin_owned(&self, key: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .plugin_owned
            .contains(key)
    }

    /// Rewrite the whole map on disk.
    pub fn persist(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_locked(&state);
    }

    fn persist_locked(&self, state: &RegistryState) {
        if let Some(dir) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            if self.debug {
                tracing::debug!("Failed to create remote-store dir: {e}");
            }
            return;
        }
        match serde_json::to_string_pretty(&state.entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json)
                    && self.debug
                {
                    tracing::debug!(path = %self.path.display(), "Remote-store persist failed: {e}");
                }
            }
            Err(e) => tracing::error!("Failed to serialize remote stores: {e}"),
        }
    }
}
