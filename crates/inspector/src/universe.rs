use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fortistate_protocol::{Binding, CanvasState, LaunchTicket, Universe, UniverseVersion};
use rand::Rng;
use serde::Deserialize;

use crate::session::now_ms;

/// Universe registry directory under the working root.
pub const UNIVERSES_DIR: &str = ".fortistate-universes";

/// Lowercase slug of the form `[a-z0-9]+(-[a-z0-9]+)*`.
pub fn slugify(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_dash = false;
    for c in label.to_lowercase().chars() {
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
    if out.is_empty() {
        "universe".to_string()
    } else {
        out
    }
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn random_base36(len: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| DIGITS[rng.gen_range(0..36)] as char)
        .collect()
}

/// `v<N>-<last 4 of base36(now_ms)>`.
fn version_id(ordinal: usize, now: u64) -> String {
    let stamp = base36(now);
    let suffix = &stamp[stamp.len().saturating_sub(4)..];
    format!("v{ordinal}-{suffix}")
}

/// Canvas-form create/update request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasRequest {
    pub id: Option<String>,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub market_tags: Option<Vec<String>>,
    #[serde(default)]
    pub data_sensitivity: Option<String>,
    pub canvas: CanvasState,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub version_label: Option<String>,
}

/// Request body for a new version under an existing universe.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRequest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub canvas: CanvasState,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// Metadata-only create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRequest {
    pub id: String,
    pub label: String,
    pub owner_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub market_tags: Option<Vec<String>>,
    #[serde(default)]
    pub data_sensitivity: Option<String>,
}

/// On-disk registry of universes and their version documents, independent of
/// the live store graph.
pub struct UniverseRegistry {
    dir: PathBuf,
}

impl UniverseRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(UNIVERSES_DIR),
        }
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("meta.json")
    }

    fn version_path(&self, id: &str, vid: &str) -> PathBuf {
        self.dir.join(id).join("versions").join(format!("{vid}.json"))
    }

    /// Every universe with a readable `meta.json`; unreadable or malformed
    /// entries are skipped.
    pub fn list(&self) -> Vec<Universe> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut universes: Vec<Universe> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let meta = e.path().join("meta.json");
                let contents = std::fs::read_to_string(meta).ok()?;
                serde_json::from_str(&contents).ok()
            })
            .collect();
        universes.sort_by(|a, b| a.id.cmp(&b.id));
        universes
    }

    pub fn get(&self, id: &str) -> Option<Universe> {
        let contents = std::fs::read_to_string(self.meta_path(id)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn get_version(&self, id: &str, vid: &str) -> Option<UniverseVersion> {
        let contents = std::fs::read_to_string(self.version_path(id, vid)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Allocate an id that cannot collide with an existing universe: the base
    /// slug if free, else `<slug>-1`, `<slug>-2`, ….
    fn allocate_id(&self, label: &str) -> String {
        let base = slugify(label);
        if !self.dir.join(&base).exists() {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.dir.join(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Canvas-form create or update. Writes the version document, merges
    /// metadata, recomputes integration counts, and activates the new
    /// version. Returns the universe and whether it was newly created.
    pub fn save_canvas(&self, req: CanvasRequest, created_by: &str) -> Result<(Universe, bool)> {
        let now = now_ms();
        let (mut universe, created) = match req.id.as_deref().and_then(|id| self.get(id)) {
            Some(existing) => (existing, false),
            None => {
                let id = match req.id {
                    Some(ref id) if !id.is_empty() => id.clone(),
                    _ => self.allocate_id(&req.label),
                };
                (
                    Universe {
                        id,
                        label: req.label.clone(),
                        description: req.description.clone().unwrap_or_default(),
                        icon: None,
                        created_at: now,
                        updated_at: now,
                        owner_id: req
                            .owner_id
                            .clone()
                            .unwrap_or_else(|| created_by.to_string()),
                        market_tags: Vec::new(),
                        active_version_id: None,
                        version_ids: Vec::new(),
                        integration_counts: BTreeMap::new(),
                        data_sensitivity: "internal".to_string(),
                    },
                    true,
                )
            }
        };

        universe.label = req.label.clone();
        if let Some(description) = req.description {
            universe.description = description;
        }
        if let Some(icon) = req.icon {
            universe.icon = Some(icon);
        }
        if let Some(owner) = req.owner_id {
            universe.owner_id = owner;
        }
        if let Some(tags) = req.market_tags {
            universe.market_tags = tags;
        }
        if let Some(sensitivity) = req.data_sensitivity {
            universe.data_sensitivity = sensitivity;
        }

        let vid = match req.version_id {
            Some(vid) if !vid.is_empty() => vid,
            _ => version_id(universe.version_ids.len() + 1, now),
        };
        let version = UniverseVersion {
            id: vid.clone(),
            label: req
                .version_label
                .unwrap_or_else(|| format!("Version {}", universe.version_ids.len() + 1)),
            description: String::new(),
            created_at: now,
            created_by: created_by.to_string(),
            canvas_state: req.canvas,
            bindings: req.bindings,
            last_run_summary: None,
        };

        universe.integration_counts = integration_counts(&version.bindings);
        if !universe.version_ids.contains(&vid) {
            universe.version_ids.push(vid.clone());
        }
        universe.active_version_id = Some(vid);
        universe.updated_at = now;

        self.write_version(&universe.id, &version)?;
        self.write_meta(&universe)?;
        Ok((universe, created))
    }

    /// Metadata-only create; fails if the id is taken.
    pub fn create_metadata(&self, req: MetadataRequest) -> Result<Universe> {
        if self.get(&req.id).is_some() {
            anyhow::bail!("universe {} already exists", req.id);
        }
        let now = now_ms();
        let universe = Universe {
            id: req.id,
            label: req.label,
            description: req.description.unwrap_or_default(),
            icon: req.icon,
            created_at: now,
            updated_at: now,
            owner_id: req.owner_id,
            market_tags: req.market_tags.unwrap_or_default(),
            active_version_id: None,
            version_ids: Vec::new(),
            integration_counts: BTreeMap::new(),
            data_sensitivity: req
                .data_sensitivity
                .unwrap_or_else(|| "internal".to_string()),
        };
        self.write_meta(&universe)?;
        Ok(universe)
    }

    /// Append a version to an existing universe.
    pub fn add_version(
        &self,
        id: &str,
        req: VersionRequest,
        created_by: &str,
    ) -> Result<Option<(Universe, UniverseVersion)>> {
        let Some(mut universe) = self.get(id) else {
            return Ok(None);
        };
        let now = now_ms();
        let vid = version_id(universe.version_ids.len() + 1, now);
        let version = UniverseVersion {
            id: vid.clone(),
            label: req
                .label
                .unwrap_or_else(|| format!("Version {}", universe.version_ids.len() + 1)),
            description: req.description.unwrap_or_default(),
            created_at: now,
            created_by: created_by.to_string(),
            canvas_state: req.canvas,
            bindings: req.bindings,
            last_run_summary: None,
        };

        universe.version_ids.push(vid.clone());
        if universe.active_version_id.is_none() {
            universe.active_version_id = Some(vid);
        }
        universe.updated_at = now;

        self.write_version(id, &version)?;
        self.write_meta(&universe)?;
        Ok(Some((universe, version)))
    }

    /// Remove the universe directory recursively.
    pub fn delete(&self, id: &str) -> bool {
        let dir = self.dir.join(id);
        if !dir.is_dir() {
            return false;
        }
        std::fs::remove_dir_all(&dir).is_ok()
    }

    /// Queue a launch for an existing universe. Execution is out of scope;
    /// callers get a ticket with status `"queued"`.
    pub fn launch(&self, id: &str) -> Option<LaunchTicket> {
        self.get(id)?;
        Some(LaunchTicket {
            launch_id: format!("launch-{}-{}", base36(now_ms()), random_base36(4)),
            universe_id: id.to_string(),
            status: "queued".to_string(),
        })
    }

    fn write_meta(&self, universe: &Universe) -> Result<()> {
        let dir = self.dir.join(&universe.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(universe)?;
        std::fs::write(self.meta_path(&universe.id), json)
            .with_context(|| format!("failed to write meta for {}", universe.id))?;
        Ok(())
    }

    fn write_version(&self, id: &str, version: &UniverseVersion) -> Result<()> {
        let dir = self.dir.join(id).join("versions");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(version)?;
        std::fs::write(self.version_path(id, &version.id), json)
            .with_context(|| format!("failed to write version {}", version.id))?;
        Ok(())
    }
}

fn integration_counts(bindings: &[Binding]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for binding in bindings {
        *counts.entry(binding.provider_id.clone()).or_insert(0) += 1;
    }
    counts
}
