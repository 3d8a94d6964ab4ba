// =============================================================================
// Audit Trail — append-only JSON-lines log of admin actions
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

/// Append-only audit log at `<data_dir>/audit.log`, one JSON object per line.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("audit.log"),
            file: Mutex::new(None),
        }
    }

    /// Record one admin action. Failures are logged and swallowed; auditing
    /// never blocks the admin path.
    pub fn record(&self, actor_user_id: u64, action: &str, details: serde_json::Value) {
        let entry = serde_json::json!({
            "at": Utc::now().to_rfc3339(),
            "actor_user_id": actor_user_id,
            "action": action,
            "details": details,
        });

        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(error = %e, path = %self.path.display(), "failed to open audit log");
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{entry}") {
                warn!(error = %e, "audit write failed");
                *guard = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());

        audit.record(1, "symbol_upsert", serde_json::json!({"symbol": "EURUSD"}));
        audit.record(1, "rule_delete", serde_json::json!({"rule_id": 3}));

        let content = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "symbol_upsert");
        assert_eq!(first["actor_user_id"], 1);
    }
}
