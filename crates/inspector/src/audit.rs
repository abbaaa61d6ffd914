use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fortistate_protocol::{AuditEntry, Role};
use serde_json::Value;

/// Audit log file under the working root.
pub const AUDIT_FILE: &str = ".fortistate-audit.log";

/// Append-only JSONL audit trail with size/age rotation.
///
/// Writes are best-effort: the inspector never fails a request because the
/// audit line could not be written.
pub struct AuditLog {
    path: PathBuf,
    max_size_bytes: u64,
    max_age_days: u64,
    debug: bool,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(root: &Path, max_size_bytes: u64, max_age_days: u64, debug: bool) -> Self {
        Self {
            path: root.join(AUDIT_FILE),
            max_size_bytes,
            max_age_days,
            debug,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one entry, rotating the file first if it would exceed the size
    /// threshold or is older than the age threshold.
    pub fn append(
        &self,
        action: &str,
        session_id: Option<&str>,
        role: Option<Role>,
        details: Option<Value>,
    ) {
        let entry = AuditEntry {
            time: chrono::Utc::now().to_rfc3339(),
            action: action.to_string(),
            session_id: session_id.map(String::from),
            role,
            details,
        };
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                if self.debug {
                    tracing::debug!("Failed to serialize audit entry: {e}");
                }
                return;
            }
        };
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.rotate_if_needed(line.len() as u64);

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result
            && self.debug
        {
            tracing::debug!(path = %self.path.display(), "Audit write failed: {e}");
        }
    }

    fn rotate_if_needed(&self, incoming: u64) {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return;
        };

        let too_big = meta.len() + incoming > self.max_size_bytes;
        let too_old = meta
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age.as_secs() > self.max_age_days * 24 * 60 * 60);
        if !too_big && !too_old {
            return;
        }

        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let rotated = self
            .path
            .with_file_name(format!(".fortistate-audit-{stamp}.log"));
        if let Err(e) = std::fs::rename(&self.path, &rotated) {
            if self.debug {
                tracing::debug!("Audit rotation failed: {e}");
            }
        } else {
            tracing::info!(to = %rotated.display(), "Rotated audit log");
        }
    }

    /// Last `limit` entries, oldest first. Malformed lines are skipped.
    pub fn tail(&self, limit: usize) -> Vec<AuditEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
