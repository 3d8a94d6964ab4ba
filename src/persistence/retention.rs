// =============================================================================
// Retention Sweep — daily archive and expiry of rotated tick files
// =============================================================================
//
// Day files older than `archive_after_days` move into the archive subtree:
//
//     <data_dir>/ticks/db/archive/<YYYY>/<MM>/ticks_<YYYY-MM-DD>.db
//
// Archived files older than `retention_days` are deleted.  Compressing the
// archived files (zstd) is the job of an external janitor; this sweep only
// honours the rotation contract.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

/// Outcome of one sweep, for operator logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionReport {
    pub archived: usize,
    pub deleted: usize,
}

/// Parse the date out of a `ticks_YYYY-MM-DD.db` (or `.db.zst`) file name.
fn file_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix("ticks_")?;
    let date = stem.split(".db").next()?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn collect_day_files(root: &Path, skip: Option<&Path>) -> Vec<(PathBuf, NaiveDate)> {
    let mut out = Vec::new();
    let years = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return out,
    };
    for year in years.flatten() {
        let year_path = year.path();
        if !year_path.is_dir() || Some(year_path.as_path()) == skip {
            continue;
        }
        let months = match std::fs::read_dir(&year_path) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for month in months.flatten() {
            let month_path = month.path();
            if !month_path.is_dir() {
                continue;
            }
            let files = match std::fs::read_dir(&month_path) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for file in files.flatten() {
                let path = file.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                if let Some(date) = file_date(name) {
                    out.push((path, date));
                }
            }
        }
    }
    out
}

/// Run one retention pass relative to `today`.
pub fn run_sweep(
    data_dir: &Path,
    archive_after_days: i64,
    retention_days: i64,
    today: NaiveDate,
) -> Result<RetentionReport> {
    let db_root = data_dir.join("ticks").join("db");
    let archive_root = db_root.join("archive");
    let mut report = RetentionReport::default();

    // --- Archive old day files ----------------------------------------------
    for (path, date) in collect_day_files(&db_root, Some(archive_root.as_path())) {
        if (today - date).num_days() <= archive_after_days {
            continue;
        }
        let target_dir = archive_root
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string());
        std::fs::create_dir_all(&target_dir)
            .with_context(|| format!("failed to create archive dir {}", target_dir.display()))?;
        let file_name = path.file_name().context("day file has no name")?;
        let target = target_dir.join(file_name);
        match std::fs::rename(&path, &target) {
            Ok(()) => {
                report.archived += 1;
                info!(from = %path.display(), to = %target.display(), "tick day file archived");
            }
            Err(e) => warn!(error = %e, path = %path.display(), "failed to archive day file"),
        }
        // WAL side files travel with the database if present.
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", path.display(), suffix));
            if side.exists() {
                let _ = std::fs::rename(&side, target_dir.join(format!(
                    "{}{}",
                    file_name.to_string_lossy(),
                    suffix
                )));
            }
        }
    }

    // --- Delete past the retention horizon ----------------------------------
    for (path, date) in collect_day_files(&archive_root, None) {
        if (today - date).num_days() <= retention_days {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.deleted += 1;
                info!(path = %path.display(), "expired tick file deleted");
            }
            Err(e) => warn!(error = %e, path = %path.display(), "failed to delete expired file"),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::writer::day_file_path;

    fn touch_day_file(data_dir: &Path, date: NaiveDate) -> PathBuf {
        let path = day_file_path(data_dir, date);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stub").unwrap();
        path
    }

    #[test]
    fn old_files_are_archived_and_fresh_ones_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();

        let fresh = touch_day_file(dir.path(), today - chrono::Duration::days(3));
        let old = touch_day_file(dir.path(), today - chrono::Duration::days(10));

        let report = run_sweep(dir.path(), 7, 180, today).unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.deleted, 0);

        assert!(fresh.exists());
        assert!(!old.exists());
        let archived = dir
            .path()
            .join("ticks/db/archive/2026/06/ticks_2026-06-05.db");
        assert!(archived.exists());
    }

    #[test]
    fn archived_files_expire_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
        let ancient = today - chrono::Duration::days(200);

        let archive_dir = dir
            .path()
            .join("ticks/db/archive")
            .join(ancient.format("%Y").to_string())
            .join(ancient.format("%m").to_string());
        std::fs::create_dir_all(&archive_dir).unwrap();
        let file = archive_dir.join(format!("ticks_{}.db", ancient.format("%Y-%m-%d")));
        std::fs::write(&file, b"stub").unwrap();

        let report = run_sweep(dir.path(), 7, 180, today).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!file.exists());
    }

    #[test]
    fn exact_boundary_is_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
        let boundary = touch_day_file(dir.path(), today - chrono::Duration::days(7));

        let report = run_sweep(dir.path(), 7, 180, today).unwrap();
        assert_eq!(report.archived, 0);
        assert!(boundary.exists());
    }
}
