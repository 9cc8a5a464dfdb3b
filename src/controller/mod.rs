//! The engine: wires collectors, the snapshot cache and control operations.

pub mod cache;
pub mod files;
pub mod ports;
pub mod process;

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::collectors::{
    self, MetricCollector, NetworkInspector, PortProbe, ProcessInspector, SysinfoMetrics,
    SysinfoProcesses, TcpBindProbe,
};
use crate::config::{ConfigError, EngineConfig};
use crate::error::ControlError;
use crate::model::{
    ConnectionRecord, DeleteOutcome, KillOutcome, LargeFileScan, PortProbeResult, ProcessRecord,
    Reading,
};

use cache::{Bundle, Samplers, SnapshotCache, SnapshotView};
use files::ScanLimits;
use ports::{FreePortReport, PortPolicy, PortResolution, PortResolver, PortSettings};
use process::KillPolicy;

pub struct Engine {
    config: EngineConfig,
    cache: Arc<SnapshotCache>,
    processes: Arc<dyn ProcessInspector>,
    network: Arc<dyn NetworkInspector>,
    probe: Arc<dyn PortProbe>,
}

impl Engine {
    /// Build an engine on the host's own collectors.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let metrics = Box::new(SysinfoMetrics::new(config.disk_root.clone()));
        let processes: Arc<dyn ProcessInspector> = Arc::new(SysinfoProcesses::new());
        let network: Arc<dyn NetworkInspector> = Arc::from(collectors::default_network_inspector());
        let probe: Arc<dyn PortProbe> = Arc::new(TcpBindProbe::new(config.probe_ip()));
        Ok(Self::with_parts(config, metrics, processes, network, probe))
    }

    /// Build an engine on caller-supplied collectors. `config` is taken as
    /// already validated.
    pub fn with_parts(
        config: EngineConfig,
        metrics: Box<dyn MetricCollector>,
        processes: Arc<dyn ProcessInspector>,
        network: Arc<dyn NetworkInspector>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let samplers = Samplers::new(
            metrics,
            Arc::clone(&processes),
            Arc::clone(&network),
            config.disk_root.clone(),
        );
        let cache = Arc::new(SnapshotCache::new(
            samplers,
            config.sample_interval(),
            config.refresh_timeout(),
        ));
        Self { config, cache, processes, network, probe }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the periodic refresher. It stops when `shutdown` flips to true.
    pub fn spawn_refresher(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.cache).run(shutdown))
    }

    pub fn snapshot(&self) -> SnapshotView {
        self.cache.view()
    }

    pub fn bundle(&self) -> Arc<Bundle> {
        self.cache.load()
    }

    /// Processes as of the last refresh.
    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.cache.load().processes.clone()
    }

    pub async fn live_processes(&self) -> Result<Vec<ProcessRecord>, ControlError> {
        let processes = Arc::clone(&self.processes);
        blocking(move || Ok(processes.list_processes())).await
    }

    /// Connections as of the last refresh.
    pub fn connections(&self) -> Reading<Vec<ConnectionRecord>> {
        self.cache.load().connections.clone()
    }

    pub async fn live_connections(&self) -> Result<Vec<ConnectionRecord>, ControlError> {
        let network = Arc::clone(&self.network);
        blocking(move || network.list_connections()).await
    }

    pub async fn find_port_owners(&self, port: u16) -> Result<Vec<u32>, ControlError> {
        let network = Arc::clone(&self.network);
        blocking(move || network.find_port_owners(port)).await
    }

    /// Force a refresh and return the view it produced.
    pub async fn refresh_now(&self) -> Result<SnapshotView, ControlError> {
        self.cache.refresh().await?;
        Ok(self.cache.view())
    }

    /// Terminate `pid`. Not cut short by `operation_timeout`: the kill is
    /// bounded by its own grace periods and always reaches SIGKILL.
    pub async fn kill_process(
        &self,
        pid: u32,
        expected_name: Option<&str>,
    ) -> Result<KillOutcome, ControlError> {
        let policy = self.kill_policy();
        let result = process::terminate(&self.processes, pid, expected_name, policy).await;
        info!(pid, expected_name, outcome = ?result, "kill_process");
        self.cache.request_refresh();
        result
    }

    pub async fn scan_large_files(
        &self,
        root: impl Into<PathBuf>,
        min_size_bytes: u64,
    ) -> Result<LargeFileScan, ControlError> {
        let root = root.into();
        let limits = ScanLimits {
            max_depth: self.config.scan_max_depth,
            max_entries: self.config.scan_max_entries,
            time_budget: self.config.scan_time_budget(),
            max_results: self.config.scan_max_results,
        };
        self.bounded(blocking(move || files::find_large_files(&root, min_size_bytes, &limits)))
            .await
    }

    pub async fn delete_file(&self, path: impl AsRef<Path>) -> Result<DeleteOutcome, ControlError> {
        let path = path.as_ref().to_path_buf();
        let result = self.bounded(blocking(move || files::delete_file(&path))).await;
        self.cache.request_refresh();
        result
    }

    /// `KillPort` budgets its kills against `operation_timeout` itself so no
    /// owner is abandoned mid-escalation; the other policies are cut off at it.
    pub async fn resolve_port(
        &self,
        port: u16,
        policy: PortPolicy,
    ) -> Result<PortResolution, ControlError> {
        if policy == PortPolicy::KillPort {
            let result = self.resolver().resolve(port, policy).await;
            self.cache.request_refresh();
            return result;
        }
        self.bounded(self.resolver().resolve(port, policy)).await
    }

    /// State of every port in `low..=high`.
    pub async fn scan_ports(&self, low: u16, high: u16) -> Result<Vec<PortProbeResult>, ControlError> {
        self.bounded(async { self.resolver().scan_range(low, high) }).await
    }

    pub async fn free_port(&self, port: u16) -> Result<FreePortReport, ControlError> {
        let result = self.resolver().free_port(port).await;
        info!(port, outcome = ?result, "free_port");
        self.cache.request_refresh();
        result
    }

    fn resolver(&self) -> PortResolver<'_> {
        PortResolver::new(
            &*self.probe,
            &*self.network,
            Arc::clone(&self.processes),
            PortSettings {
                max_attempts: self.config.max_port_attempts,
                settle_delay: self.config.port_settle_delay(),
                kill_retries: self.config.port_kill_retries,
                max_scan_range: self.config.max_scan_range,
                kill: self.kill_policy(),
                time_budget: self.config.operation_timeout(),
            },
        )
    }

    fn kill_policy(&self) -> KillPolicy {
        KillPolicy {
            grace: self.config.kill_grace_period(),
            poll: self.config.kill_poll_interval(),
        }
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, ControlError>>,
    ) -> Result<T, ControlError> {
        let limit: Duration = self.config.operation_timeout();
        tokio::time::timeout(limit, op)
            .await
            .unwrap_or(Err(ControlError::Timeout(limit)))
    }
}

/// Run a blocking OS call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ControlError>
where
    F: FnOnce() -> Result<T, ControlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|join| ControlError::Os {
        context: "blocking task".to_string(),
        source: io::Error::other(join.to_string()),
    })?
}
