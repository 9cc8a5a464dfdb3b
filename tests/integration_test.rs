//! End-to-end checks against the public engine API, on the host's real
//! collectors.

use std::fs::{self, File};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use systempulse::controller::ports::{PortPolicy, PortResolution};
use systempulse::model::{DeleteOutcome, KillOutcome, Reading};
use systempulse::view::format_bytes;
use systempulse::{ControlError, Engine, EngineConfig, ErrorClass};

const MB: u64 = 1024 * 1024;

fn quick_config() -> EngineConfig {
    EngineConfig {
        sample_interval_ms: 200,
        kill_grace_period_ms: 1000,
        kill_poll_interval_ms: 10,
        port_settle_delay_ms: 20,
        ..EngineConfig::default()
    }
}

fn engine() -> Engine {
    Engine::new(quick_config()).unwrap()
}

#[tokio::test]
async fn killing_a_missing_pid_is_not_found() {
    let outcome = engine().kill_process(999_999_999, None).await.unwrap();
    assert_eq!(outcome, KillOutcome::NotFound);
}

#[cfg(unix)]
#[tokio::test]
async fn kills_a_real_child() {
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let engine = engine();

    let err = engine.kill_process(pid, Some("definitely-not-sleep")).await.unwrap_err();
    assert!(matches!(err, ControlError::NameMismatch { .. }));

    // The child stays a zombie until reaped; the inspector counts that as gone.
    let outcome = engine.kill_process(pid, Some("sleep")).await.unwrap();
    assert_eq!(outcome, KillOutcome::Terminated);
    let _ = child.wait();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_while_a_child_is_killed() {
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let engine = engine();

    let (listed, killed) = tokio::join!(engine.live_processes(), engine.kill_process(pid, Some("sleep")));
    assert!(listed.unwrap().iter().all(|p| p.pid != pid || p.name == "sleep"));
    assert_eq!(killed.unwrap(), KillOutcome::Terminated);
    assert!(engine.live_processes().await.unwrap().iter().all(|p| p.pid != pid));
    let _ = child.wait();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_kills_of_one_child_both_succeed() {
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let engine = engine();

    let (a, b) = tokio::join!(engine.kill_process(pid, None), engine.kill_process(pid, None));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&KillOutcome::Terminated));
    assert!(outcomes.iter().all(|o| matches!(o, KillOutcome::Terminated | KillOutcome::NotFound)));
    let _ = child.wait();
}

const HOLD_PORT_VAR: &str = "SYSTEMPULSE_HOLD_PORT";

/// Re-executed by `kill_port_frees_a_port_held_by_a_child` as the process
/// that holds the port. Does nothing in a normal test run.
#[test]
fn port_holder_child() {
    let Ok(port) = std::env::var(HOLD_PORT_VAR) else { return };
    let _listener = TcpListener::bind(("127.0.0.1", port.parse::<u16>().unwrap())).unwrap();
    std::thread::sleep(Duration::from_secs(60));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_port_frees_a_port_held_by_a_child() {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let mut child = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "port_holder_child", "--nocapture"])
        .env(HOLD_PORT_VAR, port.to_string())
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let pid = child.id();

    let started = Instant::now();
    while TcpListener::bind(("127.0.0.1", port)).is_ok() {
        assert!(started.elapsed() < Duration::from_secs(10), "child never bound {port}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let engine = engine();
    let resolved = engine.resolve_port(port, PortPolicy::KillPort).await.unwrap();
    let PortResolution::Freed { port: freed, report } = resolved else {
        panic!("expected Freed, got {resolved:?}")
    };
    assert_eq!(freed, port);
    assert_eq!(report.killed.iter().map(|k| k.pid).collect::<Vec<_>>(), vec![pid]);
    assert!(report.failed.is_empty());

    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    assert!(engine.live_processes().await.unwrap().iter().all(|p| p.pid != pid));
    let _ = child.wait();
}

#[tokio::test]
async fn scan_returns_only_large_files() {
    let dir = tempfile::tempdir().unwrap();
    File::create(dir.path().join("big.iso")).unwrap().set_len(150 * MB).unwrap();
    File::create(dir.path().join("medium.iso")).unwrap().set_len(50 * MB).unwrap();

    let scan = engine().scan_large_files(dir.path(), 100 * MB).await.unwrap();
    assert_eq!(scan.files.len(), 1);
    assert_eq!(scan.files[0].size_bytes, 150 * MB);
    assert!(scan.files[0].path.ends_with("big.iso"));
    assert_eq!(format_bytes(scan.files[0].size_bytes), "150.00 MB");
}

#[tokio::test]
async fn deleting_twice_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.log");
    fs::write(&path, vec![0u8; 4096]).unwrap();
    let engine = engine();

    assert_eq!(engine.delete_file(&path).await.unwrap(), DeleteOutcome::Deleted { size_bytes: 4096 });
    assert_eq!(engine.delete_file(&path).await.unwrap(), DeleteOutcome::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_deletes_remove_the_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.log");
    fs::write(&path, vec![0u8; 1024]).unwrap();
    let engine = engine();

    let (a, b) = tokio::join!(engine.delete_file(&path), engine.delete_file(&path));
    let outcomes = [a.unwrap(), b.unwrap()];
    let deleted = outcomes.iter().filter(|o| matches!(o, DeleteOutcome::Deleted { .. })).count();
    assert_eq!(deleted, 1);
    assert!(outcomes.contains(&DeleteOutcome::NotFound));
    assert!(!path.exists());
}

/// Find `p` such that `p` can be held and `p + 1` is free.
fn held_port_with_free_neighbour() -> (TcpListener, u16) {
    for _ in 0..50 {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        if port < u16::MAX && TcpListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return (held, port);
        }
    }
    panic!("no usable port pair");
}

#[tokio::test]
async fn auto_port_skips_a_held_port() {
    let (held, port) = held_port_with_free_neighbour();
    let engine = engine();

    let err = engine.resolve_port(port, PortPolicy::Strict).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Busy);

    let resolved = engine.resolve_port(port, PortPolicy::AutoPort).await.unwrap();
    assert_eq!(resolved, PortResolution::Available { port: port + 1 });
    drop(held);
}

#[tokio::test]
async fn scan_range_is_one_result_per_port() {
    let engine = engine();
    let resolved = engine
        .resolve_port(3000, PortPolicy::ScanRange { low: 3000, high: 3010 })
        .await
        .unwrap();
    let PortResolution::Scanned { ports } = resolved else { panic!("expected a scan") };
    assert_eq!(ports.len(), 11);
    assert_eq!(ports.first().map(|p| p.port), Some(3000));
    assert_eq!(ports.last().map(|p| p.port), Some(3010));

    let direct = engine.scan_ports(3000, 3010).await.unwrap();
    assert_eq!(direct.len(), 11);
}

#[tokio::test]
async fn missing_disk_root_only_degrades_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        disk_root: dir.path().join("not-mounted"),
        ..quick_config()
    };
    let engine = Engine::new(config).unwrap();
    let view = engine.refresh_now().await.unwrap();

    let snap = view.snapshot();
    assert!(matches!(snap.disk, Reading::Unavailable(_)));
    assert!(snap.memory.is_available());
    assert!(snap.cpu_percent.is_available());
    assert!(snap.cpu_count > 0);
    assert!(!engine.processes().is_empty());

    let json = view.to_json();
    assert_eq!(json["generation"], 1);
    assert_eq!(json["disk"]["state"], "unavailable");
}

#[tokio::test]
async fn refresher_advances_generation_and_stops() {
    let engine = engine();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = engine.spawn_refresher(rx);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(engine.snapshot().generation() >= 2);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulse.toml");
    fs::write(&path, "sample_interval_ms = 1000\nmax_port_attempts = 10\n").unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.sample_interval(), Duration::from_secs(1));
    assert_eq!(config.max_port_attempts, 10);
    assert_eq!(config.scan_max_results, 500);

    fs::write(&path, "sample_interval = 1000\n").unwrap();
    assert!(EngineConfig::load(&path).is_err());
}
