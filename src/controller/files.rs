//! Large-file scanning and single-file deletion.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ControlError;
use crate::model::{DeleteOutcome, LargeFileRecord, LargeFileScan, ScanLimit};

#[derive(Clone, Copy, Debug)]
pub struct ScanLimits {
    pub max_depth: usize,
    pub max_entries: u64,
    pub time_budget: Duration,
    pub max_results: usize,
}

/// Walk `root` and collect regular files of at least `min_size_bytes`,
/// largest first. Symlinks are never followed. Unreadable entries are counted
/// and skipped. The walk stops early at any of the limits, and the scan
/// records which limit cut it short.
pub fn find_large_files(
    root: &Path,
    min_size_bytes: u64,
    limits: &ScanLimits,
) -> Result<LargeFileScan, ControlError> {
    fs::symlink_metadata(root).map_err(|e| ControlError::from_io(root.display().to_string(), e))?;

    let started = Instant::now();
    let mut scan = LargeFileScan {
        root: root.to_path_buf(),
        min_size_bytes,
        files: Vec::new(),
        entries_visited: 0,
        entries_skipped: 0,
        truncated: None,
    };
    let keep = limits.max_results.max(1);
    let mut dropped = false;

    for entry in WalkDir::new(root).follow_links(false).max_depth(limits.max_depth) {
        if scan.entries_visited >= limits.max_entries {
            scan.truncated = Some(ScanLimit::Entries);
            break;
        }
        if started.elapsed() >= limits.time_budget {
            scan.truncated = Some(ScanLimit::TimeBudget);
            break;
        }
        scan.entries_visited += 1;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                scan.entries_skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping file without metadata");
                scan.entries_skipped += 1;
                continue;
            }
        };
        if meta.len() < min_size_bytes {
            continue;
        }
        scan.files.push(LargeFileRecord {
            path: entry.into_path(),
            size_bytes: meta.len(),
            modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
        });
        if scan.files.len() >= keep * 2 {
            largest_first(&mut scan.files);
            scan.files.truncate(keep);
            dropped = true;
        }
    }

    largest_first(&mut scan.files);
    if dropped || scan.files.len() > keep {
        scan.files.truncate(keep);
        scan.truncated.get_or_insert(ScanLimit::Results);
    }

    info!(
        root = %root.display(),
        min_size_bytes,
        found = scan.files.len(),
        visited = scan.entries_visited,
        skipped = scan.entries_skipped,
        truncated = ?scan.truncated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "large file scan finished"
    );
    Ok(scan)
}

fn largest_first(files: &mut [LargeFileRecord]) {
    files.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then_with(|| a.path.cmp(&b.path)));
}

/// Delete one file. Directories are refused; a symlink is removed itself,
/// never its target. A path that is already gone is reported, not an error.
pub fn delete_file(path: &Path) -> Result<DeleteOutcome, ControlError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DeleteOutcome::NotFound),
        Err(e) => return Err(ControlError::from_io(path.display().to_string(), e)),
    };
    if meta.is_dir() {
        return Err(ControlError::Refused(format!("{} is a directory", path.display())));
    }
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), size_bytes = meta.len(), "file deleted");
            Ok(DeleteOutcome::Deleted { size_bytes: meta.len() })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "delete failed");
            Err(ControlError::from_io(path.display().to_string(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    const MB: u64 = 1024 * 1024;

    fn limits() -> ScanLimits {
        ScanLimits {
            max_depth: 32,
            max_entries: 1_000_000,
            time_budget: Duration::from_secs(30),
            max_results: 500,
        }
    }

    fn sparse(path: &Path, len: u64) {
        File::create(path).unwrap().set_len(len).unwrap();
    }

    #[test]
    fn finds_only_files_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        sparse(&nested.join("big.bin"), 150 * MB);
        sparse(&dir.path().join("small.bin"), 50 * MB);

        let scan = find_large_files(dir.path(), 100 * MB, &limits()).unwrap();
        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files[0].path, nested.join("big.bin"));
        assert_eq!(scan.files[0].size_bytes, 150 * MB);
        assert!(scan.files[0].modified_time.is_some());
        assert_eq!(scan.truncated, None);
    }

    #[test]
    fn results_are_largest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=5u64 {
            sparse(&dir.path().join(format!("f{i}")), i * MB);
        }
        let mut l = limits();
        l.max_results = 2;
        let scan = find_large_files(dir.path(), 0, &l).unwrap();
        let sizes: Vec<u64> = scan.files.iter().map(|f| f.size_bytes).collect();
        assert_eq!(sizes, vec![5 * MB, 4 * MB]);
        assert_eq!(scan.truncated, Some(ScanLimit::Results));
    }

    #[test]
    fn entry_limit_truncates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            sparse(&dir.path().join(format!("f{i}")), 10);
        }
        let mut l = limits();
        l.max_entries = 3;
        let scan = find_large_files(dir.path(), 0, &l).unwrap();
        assert_eq!(scan.entries_visited, 3);
        assert_eq!(scan.truncated, Some(ScanLimit::Entries));
    }

    #[test]
    fn depth_limit_hides_deep_files() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("1/2/3");
        fs::create_dir_all(&deep).unwrap();
        sparse(&deep.join("deep.bin"), 10);
        let mut l = limits();
        l.max_depth = 2;
        let scan = find_large_files(dir.path(), 0, &l).unwrap();
        assert!(scan.files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        sparse(&outside.path().join("target.bin"), 10 * MB);
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let scan = find_large_files(dir.path(), 0, &limits()).unwrap();
        assert!(scan.files.is_empty());
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_large_files(&dir.path().join("nope"), 0, &limits()).unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[test]
    fn delete_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doomed.log");
        fs::write(&path, b"0123456789").unwrap();

        assert_eq!(delete_file(&path).unwrap(), DeleteOutcome::Deleted { size_bytes: 10 });
        assert!(!path.exists());
        assert_eq!(delete_file(&path).unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn delete_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = delete_file(dir.path()).unwrap_err();
        assert!(matches!(err, ControlError::Refused(_)));
        assert!(dir.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn delete_removes_link_not_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"keep").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(delete_file(&link).unwrap(), DeleteOutcome::Deleted { .. }));
        assert!(target.exists());
    }
}
