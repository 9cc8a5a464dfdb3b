use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use systempulse::controller::ports::PortPolicy;
use systempulse::controller::process::top_processes;
use systempulse::model::SortColumn;
use systempulse::view;
use systempulse::{ControlError, Engine, EngineConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; every option has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `sample_interval_ms`.
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Override `disk_root`.
    #[arg(long, global = true)]
    disk_root: Option<PathBuf>,

    /// Write logs to a daily-rotated file in this directory instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh continuously and print a summary line per interval.
    Watch {
        /// Print the compact cpu/memory/disk JSON instead of a text line.
        #[arg(long)]
        json: bool,
    },
    /// Print one fresh snapshot.
    Snapshot,
    /// List the heaviest processes.
    Ps {
        #[arg(long, default_value_t = 20)]
        top: usize,
        #[arg(long, value_enum, default_value_t = SortArg::Cpu)]
        sort: SortArg,
        /// Print the rows as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Terminate a process (SIGTERM, then SIGKILL after the grace period).
    Kill {
        pid: u32,
        /// Only kill if the process still has this name.
        #[arg(long)]
        name: Option<String>,
    },
    /// List sockets, optionally only those holding a port.
    Conns {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Find files of at least `min_size` bytes under `root`.
    Scan {
        root: PathBuf,
        #[arg(long, default_value_t = 100 * 1024 * 1024)]
        min_size: u64,
    },
    /// Delete one file.
    Rm { path: PathBuf },
    /// Resolve a port under a policy.
    Port {
        port: u16,
        #[arg(long, value_enum, default_value_t = PolicyArg::Strict)]
        policy: PolicyArg,
    },
    /// Report which ports in an inclusive range are taken.
    Ports { low: u16, high: u16 },
    /// Kill every process holding a port.
    FreePort { port: u16 },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Cpu,
    Mem,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Strict,
    Auto,
    Kill,
}

impl From<PolicyArg> for PortPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Strict => PortPolicy::Strict,
            PolicyArg::Auto => PortPolicy::AutoPort,
            PolicyArg::Kill => PortPolicy::KillPort,
        }
    }
}

#[derive(Serialize)]
struct ErrorOutput {
    error: systempulse::ErrorClass,
    message: String,
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "systempulse.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = cli.interval_ms {
        config.sample_interval_ms = ms;
    }
    if let Some(root) = &cli.disk_root {
        config.disk_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a control result; control errors become a JSON error object and a
/// failing exit code.
fn report<T: Serialize>(result: Result<T, ControlError>) -> Result<ExitCode> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&ErrorOutput { error: e.class(), message: e.to_string() })?;
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_ref());
    let config = load_config(&cli).context("loading configuration")?;
    let engine = Engine::new(config)?;

    match cli.command.unwrap_or(Command::Watch { json: false }) {
        Command::Watch { json } => watch_loop(&engine, json).await,
        Command::Snapshot => {
            let current = engine.refresh_now().await?;
            print_json(&current.to_json())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ps { top, sort, json } => {
            // CPU usage needs two samples.
            engine.refresh_now().await?;
            tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
            engine.refresh_now().await?;
            let column = match sort {
                SortArg::Cpu => SortColumn::Cpu,
                SortArg::Mem => SortColumn::Memory,
            };
            let rows = top_processes(engine.processes(), column, top);
            if json {
                print_json(&rows)?;
            } else {
                println!("{}", view::process_header());
                for row in &rows {
                    println!("{}", view::process_row(row));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Kill { pid, name } => report(engine.kill_process(pid, name.as_deref()).await),
        Command::Conns { port } => {
            let conns = engine.live_connections().await.map(|conns| match port {
                Some(p) => conns.into_iter().filter(|c| c.holds_port(p)).collect(),
                None => conns,
            });
            report(conns)
        }
        Command::Scan { root, min_size } => report(engine.scan_large_files(root, min_size).await),
        Command::Rm { path } => report(engine.delete_file(path).await),
        Command::Port { port, policy } => report(engine.resolve_port(port, policy.into()).await),
        Command::Ports { low, high } => report(engine.scan_ports(low, high).await),
        Command::FreePort { port } => report(engine.free_port(port).await),
    }
}

async fn watch_loop(engine: &Engine, json: bool) -> Result<ExitCode> {
    let term = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&term)).context("registering signal handler")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = engine.spawn_refresher(shutdown_rx);
    let interval = engine.config().sample_interval();
    info!(interval_ms = interval.as_millis() as u64, "watching");

    let mut last_generation = 0;
    while !term.load(Ordering::Relaxed) {
        let current = engine.snapshot();
        if current.generation() != last_generation {
            last_generation = current.generation();
            if json {
                println!("{}", serde_json::to_string(&current.summary())?);
            } else {
                println!("{}", view::summary_line(&current));
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = refresher.await;
    Ok(ExitCode::SUCCESS)
}
