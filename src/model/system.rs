use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single metric value, or an explicit marker that it could not be read.
///
/// Keeps "the disk is 0% full" distinguishable from "we could not ask".
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
    Sampled(T),
    Unavailable(String),
}

impl<T> Reading<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Reading::Unavailable(reason.into())
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Reading::Sampled(v) => Some(v),
            Reading::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Sampled(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        match self {
            Reading::Sampled(v) => Reading::Sampled(f(v)),
            Reading::Unavailable(reason) => Reading::Unavailable(reason),
        }
    }
}

/// Total/used pair for memory or a disk volume, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct UsageInfo {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

impl UsageInfo {
    pub fn new(total: u64, used: u64) -> Self {
        let percent = if total > 0 {
            let raw = used as f64 / total as f64 * 100.0;
            (raw * 10.0).round() / 10.0
        } else {
            0.0
        };
        Self { total, used, percent }
    }
}

/// What one call to a metric collector returns.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub cpu_percent: Reading<f32>,
    pub cpu_count: usize,
    pub memory: Reading<UsageInfo>,
    pub disk: Reading<UsageInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Reading<f32>,
    pub cpu_count: usize,
    pub memory: Reading<UsageInfo>,
    pub disk: Reading<UsageInfo>,
    pub disk_root: PathBuf,
}

impl SystemSnapshot {
    pub fn from_sample(sample: MetricSample, disk_root: PathBuf, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: sample.cpu_percent,
            cpu_count: sample.cpu_count,
            memory: sample.memory,
            disk: sample.disk,
            disk_root,
        }
    }

    /// Placeholder published before the first refresh completes.
    pub fn empty(disk_root: PathBuf) -> Self {
        let reason = "not sampled yet";
        Self {
            timestamp: Utc::now(),
            cpu_percent: Reading::unavailable(reason),
            cpu_count: 0,
            memory: Reading::unavailable(reason),
            disk: Reading::unavailable(reason),
            disk_root,
        }
    }
}
