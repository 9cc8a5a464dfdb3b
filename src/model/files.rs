use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LargeFileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

/// Which bound cut a directory walk short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanLimit {
    Entries,
    TimeBudget,
    Results,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LargeFileScan {
    pub root: PathBuf,
    pub min_size_bytes: u64,
    /// Largest first.
    pub files: Vec<LargeFileRecord>,
    pub entries_visited: u64,
    pub entries_skipped: u64,
    pub truncated: Option<ScanLimit>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeleteOutcome {
    Deleted { size_bytes: u64 },
    /// Already gone; nothing to free.
    NotFound,
}
