use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

use super::NetworkInspector;
use crate::error::ControlError;
use crate::model::{ConnectionRecord, Protocol, SocketState};

/// Socket table from `lsof -nP -i` (macOS, BSDs).
///
/// Without root, lsof only reports the caller's own sockets; everything else
/// is simply absent rather than listed without an owner.
pub struct LsofCollector {}

impl LsofCollector {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for LsofCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInspector for LsofCollector {
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>, ControlError> {
        let output = Command::new("lsof")
            .args(["-nP", "-iTCP", "-iUDP"])
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ControlError::Unavailable("lsof".to_string()),
                _ => ControlError::from_io("lsof", e),
            })?;
        // lsof exits 1 when nothing matched; the output is still valid.
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().skip(1).filter_map(parse_lsof_line).collect())
    }
}

/// One row of `lsof -nP -i`:
///
/// ```text
/// COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME
/// nginx   812 www  6u IPv4 0x1a2b 0t0      TCP  *:8080 (LISTEN)
/// ```
fn parse_lsof_line(line: &str) -> Option<ConnectionRecord> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let pid: u32 = parts[1].parse().ok()?;
    let v6 = parts[4] == "IPv6";

    // NODE column holds the protocol; NAME follows it.
    let node_idx = parts.iter().skip(5).position(|p| *p == "TCP" || *p == "UDP")? + 5;
    let protocol = if parts[node_idx] == "TCP" { Protocol::Tcp } else { Protocol::Udp };
    let name = parts.get(node_idx + 1)?;
    let state = parts
        .get(node_idx + 2)
        .map(|s| s.trim_start_matches('(').trim_end_matches(')'));

    let (local, remote) = match name.split_once("->") {
        Some((l, r)) => (parse_endpoint(l, v6)?, Some(parse_endpoint(r, v6)?)),
        None => (parse_endpoint(name, v6)?, None),
    };

    let status = match (protocol, state) {
        (_, Some(s)) => SocketState::from_lsof_name(s),
        (Protocol::Udp, None) if remote.is_none() => SocketState::Unconnected,
        (Protocol::Udp, None) => SocketState::Established,
        (Protocol::Tcp, None) => SocketState::Unknown,
    };

    Some(ConnectionRecord {
        protocol,
        local_address: local.0,
        local_port: local.1,
        remote_address: remote.map(|r| r.0),
        remote_port: remote.map(|r| r.1),
        status,
        owning_pid: Some(pid),
    })
}

/// `*:8080`, `127.0.0.1:53`, `[::1]:631`, `[fe80:4::1]:5353`
fn parse_endpoint(s: &str, v6: bool) -> Option<(IpAddr, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip = if host == "*" {
        if v6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    } else {
        // Drop a zone index (`fe80::1%en0`); lsof sometimes prints it.
        let host = host.split('%').next().unwrap_or(host);
        host.parse().ok()?
    };
    Some((ip, port))
}
