//! Latest sampled host state, published as one immutable bundle.
//!
//! Readers call [`SnapshotCache::load`] and get an `Arc<Bundle>`; they never
//! take a lock. Refreshes run on the blocking pool under the sampler mutex,
//! and the new bundle is swapped in while that mutex is still held, so
//! bundles are published in generation order.
//!
//! At most one sampling task exists at a time. A refresh that times out
//! leaves its task running; the next refresh waits on that task instead of
//! starting another, and a late result is still published.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, warn};

use crate::collectors::{MetricCollector, NetworkInspector, ProcessInspector};
use crate::error::ControlError;
use crate::model::{ConnectionRecord, ProcessRecord, Reading, SystemSnapshot};

/// Everything one refresh produced. Never mutated after publication.
#[derive(Debug)]
pub struct Bundle {
    pub generation: u64,
    pub snapshot: SystemSnapshot,
    pub processes: Vec<ProcessRecord>,
    pub connections: Reading<Vec<ConnectionRecord>>,
    pub sampled_at: Instant,
}

impl Bundle {
    fn initial(disk_root: PathBuf) -> Self {
        Self {
            generation: 0,
            snapshot: SystemSnapshot::empty(disk_root),
            processes: Vec::new(),
            connections: Reading::unavailable("not sampled yet"),
            sampled_at: Instant::now(),
        }
    }
}

/// The collectors a refresh pulls from. Only ever touched under the sampler
/// mutex.
pub struct Samplers {
    pub metrics: Box<dyn MetricCollector>,
    pub processes: Arc<dyn ProcessInspector>,
    pub network: Arc<dyn NetworkInspector>,
    pub disk_root: PathBuf,
    generation: u64,
}

impl Samplers {
    pub fn new(
        metrics: Box<dyn MetricCollector>,
        processes: Arc<dyn ProcessInspector>,
        network: Arc<dyn NetworkInspector>,
        disk_root: PathBuf,
    ) -> Self {
        Self { metrics, processes, network, disk_root, generation: 0 }
    }

    fn sample(&mut self) -> Bundle {
        let started = Instant::now();
        let metrics = self.metrics.sample();
        let processes = self.processes.list_processes();
        let connections = match self.network.list_connections() {
            Ok(conns) => Reading::Sampled(conns),
            Err(e) => {
                warn!(error = %e, "connection listing unavailable");
                Reading::unavailable(e.to_string())
            }
        };

        self.generation += 1;
        debug!(
            generation = self.generation,
            processes = processes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refresh sampled"
        );
        Bundle {
            generation: self.generation,
            snapshot: SystemSnapshot::from_sample(metrics, self.disk_root.clone(), Utc::now()),
            processes,
            connections,
            sampled_at: Instant::now(),
        }
    }
}

/// What readers see: the current bundle plus how old it is.
#[derive(Clone, Debug)]
pub struct SnapshotView {
    pub bundle: Arc<Bundle>,
    pub age: Duration,
    pub stale: bool,
    pub consecutive_failures: u64,
}

/// The three figures the dashboard polls, `None` where unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

#[derive(Serialize)]
struct ViewJson<'a> {
    generation: u64,
    #[serde(flatten)]
    snapshot: &'a SystemSnapshot,
    age_ms: u64,
    stale: bool,
    consecutive_failures: u64,
}

impl SnapshotView {
    pub fn snapshot(&self) -> &SystemSnapshot {
        &self.bundle.snapshot
    }

    pub fn generation(&self) -> u64 {
        self.bundle.generation
    }

    pub fn summary(&self) -> DashboardSummary {
        let s = &self.bundle.snapshot;
        DashboardSummary {
            cpu_percent: s.cpu_percent.value().copied(),
            memory_percent: s.memory.value().map(|m| m.percent),
            disk_percent: s.disk.value().map(|d| d.percent),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let view = ViewJson {
            generation: self.bundle.generation,
            snapshot: &self.bundle.snapshot,
            age_ms: self.age.as_millis() as u64,
            stale: self.stale,
            consecutive_failures: self.consecutive_failures,
        };
        serde_json::to_value(view).unwrap_or(serde_json::Value::Null)
    }
}

pub struct SnapshotCache {
    current: Arc<ArcSwap<Bundle>>,
    samplers: Arc<Mutex<Samplers>>,
    interval: Duration,
    refresh_timeout: Duration,
    failures: AtomicU64,
    last_failed: AtomicBool,
    /// Generation that was current when the last refresh failed.
    failed_generation: AtomicU64,
    in_flight: AsyncMutex<Option<JoinHandle<u64>>>,
    wake: Notify,
}

impl SnapshotCache {
    pub fn new(samplers: Samplers, interval: Duration, refresh_timeout: Duration) -> Self {
        let initial = Bundle::initial(samplers.disk_root.clone());
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
            samplers: Arc::new(Mutex::new(samplers)),
            interval,
            refresh_timeout,
            failures: AtomicU64::new(0),
            last_failed: AtomicBool::new(false),
            failed_generation: AtomicU64::new(0),
            in_flight: AsyncMutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn load(&self) -> Arc<Bundle> {
        self.current.load_full()
    }

    pub fn view(&self) -> SnapshotView {
        let bundle = self.load();
        let age = bundle.sampled_at.elapsed();
        // a sample that landed after its refresh timed out is fresh again
        let failed_since = self.last_failed.load(Ordering::Relaxed)
            && bundle.generation <= self.failed_generation.load(Ordering::Relaxed);
        let stale = bundle.generation == 0 || age > self.interval * 2 || failed_since;
        SnapshotView {
            bundle,
            age,
            stale,
            consecutive_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Sample everything and publish the result. On failure the previous
    /// bundle stays current.
    pub async fn refresh(&self) -> Result<u64, ControlError> {
        let mut in_flight = self.in_flight.lock().await;
        let mut task = match in_flight.take() {
            Some(task) if !task.is_finished() => {
                debug!("previous refresh still sampling, waiting on it");
                task
            }
            _ => self.spawn_sample(),
        };

        let result = match timeout(self.refresh_timeout, &mut task).await {
            Ok(Ok(generation)) => Ok(generation),
            Ok(Err(join)) => Err(ControlError::Os {
                context: "refresh task".to_string(),
                source: io::Error::other(join.to_string()),
            }),
            Err(_) => {
                *in_flight = Some(task);
                Err(ControlError::Timeout(self.refresh_timeout))
            }
        };
        drop(in_flight);

        match &result {
            Ok(_) => {
                self.failures.store(0, Ordering::Relaxed);
                self.last_failed.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                self.failed_generation.store(self.load().generation, Ordering::Relaxed);
                self.last_failed.store(true, Ordering::Relaxed);
                error!(error = %e, failures, "refresh failed, keeping previous snapshot");
            }
        }
        result
    }

    fn spawn_sample(&self) -> JoinHandle<u64> {
        let samplers = Arc::clone(&self.samplers);
        let current = Arc::clone(&self.current);
        tokio::task::spawn_blocking(move || {
            let mut samplers = samplers.lock().unwrap_or_else(PoisonError::into_inner);
            let bundle = samplers.sample();
            let generation = bundle.generation;
            current.store(Arc::new(bundle));
            generation
        })
    }

    /// Ask the refresher to sample ahead of its schedule. Returns immediately.
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }

    /// Refresh on every tick and on request until `shutdown` flips to true
    /// or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => ticker.reset(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let _ = self.refresh().await;
        }
        debug!("refresher stopped");
    }
}
