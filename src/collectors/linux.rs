use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use tracing::debug;

use super::NetworkInspector;
use crate::error::ControlError;
use crate::model::{ConnectionRecord, Protocol, SocketState};

/// Socket table from `/proc/net/{tcp,tcp6,udp,udp6}` with owners resolved by
/// matching socket inodes against `/proc/<pid>/fd/*` links.
pub struct ProcNetCollector {
    proc_root: PathBuf,
}

/// One parsed row of a /proc/net table, before owner resolution.
#[derive(Debug, PartialEq)]
struct SocketEntry {
    protocol: Protocol,
    local: (IpAddr, u16),
    remote: (IpAddr, u16),
    state: u8,
    inode: u64,
}

const TABLES: [(&str, Protocol, bool); 4] = [
    ("net/tcp", Protocol::Tcp, false),
    ("net/tcp6", Protocol::Tcp, true),
    ("net/udp", Protocol::Udp, false),
    ("net/udp6", Protocol::Udp, true),
];

impl ProcNetCollector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount (containers, tests).
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }

    // ── helpers ──────────────────────────────────────────────────────────

    /// Scan /proc/[pid]/fd/ to build a mapping of socket inode → pid.
    /// Processes that exit or deny access mid-scan are skipped.
    fn build_socket_pid_map(&self) -> HashMap<u64, u32> {
        let mut map = HashMap::new();
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(e) => e,
            Err(_) => return map,
        };
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let pid: u32 = match fname.to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };

            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(f) => f,
                Err(_) => continue, // permission denied or process gone
            };
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path()) {
                    if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                        map.insert(inode, pid);
                    }
                }
            }
        }
        map
    }

    /// Parse every readable table. Fails only when none of them could be read.
    fn read_entries(&self) -> Result<Vec<SocketEntry>, ControlError> {
        let mut entries = Vec::new();
        let mut readable = 0;
        for (table, protocol, v6) in TABLES {
            let path = self.proc_root.join(table);
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "socket table unreadable");
                    continue;
                }
            };
            readable += 1;
            entries.extend(content.lines().skip(1).filter_map(|l| parse_entry(l, protocol, v6)));
        }
        if readable == 0 {
            return Err(ControlError::Unavailable(format!(
                "socket tables under {}",
                self.proc_root.join("net").display()
            )));
        }
        Ok(entries)
    }
}

impl Default for ProcNetCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInspector for ProcNetCollector {
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>, ControlError> {
        let entries = self.read_entries()?;
        let owners = self.build_socket_pid_map();

        Ok(entries
            .into_iter()
            .map(|e| {
                let status = match (e.protocol, e.state) {
                    (Protocol::Udp, 0x07) => SocketState::Unconnected,
                    (_, code) => SocketState::from_proc_code(code),
                };
                let connected = !(e.remote.0.is_unspecified() && e.remote.1 == 0);
                ConnectionRecord {
                    protocol: e.protocol,
                    local_address: e.local.0,
                    local_port: e.local.1,
                    remote_address: connected.then_some(e.remote.0),
                    remote_port: connected.then_some(e.remote.1),
                    status,
                    // inode 0: TIME_WAIT and other orphaned sockets
                    owning_pid: if e.inode == 0 { None } else { owners.get(&e.inode).copied() },
                }
            })
            .collect())
    }
}

// ── parsing ─────────────────────────────────────────────────────────────

/// `socket:[12345]` → 12345
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse().ok())
}

/// One data line of /proc/net/{tcp,udp}[6].
///
/// Fields (0-indexed): 1 local address, 2 remote address, 3 state (hex),
/// 9 inode.
fn parse_entry(line: &str, protocol: Protocol, v6: bool) -> Option<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }
    Some(SocketEntry {
        protocol,
        local: parse_endpoint(parts[1], v6)?,
        remote: parse_endpoint(parts[2], v6)?,
        state: u8::from_str_radix(parts[3], 16).ok()?,
        inode: parts[9].parse().ok()?,
    })
}

/// `0100007F:1F90` → 127.0.0.1:8080. The kernel prints each 32-bit word of
/// the address in host byte order.
fn parse_endpoint(field: &str, v6: bool) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = if v6 {
        if addr.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.chunks_mut(4).enumerate() {
            let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(bytes))
    } else {
        let word = u32::from_str_radix(addr, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
    };
    Some((ip, port))
}
