use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    /// Bound UDP socket without a fixed peer.
    Unconnected,
    Unknown,
}

impl SocketState {
    /// Decode the hex state column of /proc/net/tcp (include/net/tcp_states.h).
    pub fn from_proc_code(code: u8) -> Self {
        match code {
            0x01 => SocketState::Established,
            0x02 => SocketState::SynSent,
            0x03 => SocketState::SynRecv,
            0x04 => SocketState::FinWait1,
            0x05 => SocketState::FinWait2,
            0x06 => SocketState::TimeWait,
            0x07 => SocketState::Close,
            0x08 => SocketState::CloseWait,
            0x09 => SocketState::LastAck,
            0x0A => SocketState::Listen,
            0x0B => SocketState::Closing,
            _ => SocketState::Unknown,
        }
    }

    /// Decode the state names lsof prints in parentheses.
    pub fn from_lsof_name(name: &str) -> Self {
        match name {
            "ESTABLISHED" => SocketState::Established,
            "SYN_SENT" => SocketState::SynSent,
            "SYN_RECEIVED" | "SYN_RECV" => SocketState::SynRecv,
            "FIN_WAIT_1" => SocketState::FinWait1,
            "FIN_WAIT_2" => SocketState::FinWait2,
            "TIME_WAIT" => SocketState::TimeWait,
            "CLOSED" => SocketState::Close,
            "CLOSE_WAIT" => SocketState::CloseWait,
            "LAST_ACK" => SocketState::LastAck,
            "LISTEN" => SocketState::Listen,
            "CLOSING" => SocketState::Closing,
            _ => SocketState::Unknown,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Established => "ESTABLISHED",
            SocketState::SynSent => "SYN_SENT",
            SocketState::SynRecv => "SYN_RECV",
            SocketState::FinWait1 => "FIN_WAIT1",
            SocketState::FinWait2 => "FIN_WAIT2",
            SocketState::TimeWait => "TIME_WAIT",
            SocketState::Close => "CLOSE",
            SocketState::CloseWait => "CLOSE_WAIT",
            SocketState::LastAck => "LAST_ACK",
            SocketState::Listen => "LISTEN",
            SocketState::Closing => "CLOSING",
            SocketState::Unconnected => "UNCONN",
            SocketState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub protocol: Protocol,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub status: SocketState,
    /// `None` when the socket belongs to the kernel or attribution was denied.
    pub owning_pid: Option<u32>,
}

impl ConnectionRecord {
    /// True when this socket keeps `port` from being bound by someone else:
    /// a listening TCP socket or any UDP socket bound to it.
    pub fn holds_port(&self, port: u16) -> bool {
        if self.local_port != port {
            return false;
        }
        match self.protocol {
            Protocol::Tcp => self.status == SocketState::Listen,
            Protocol::Udp => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortProbeResult {
    pub port: u16,
    pub in_use: bool,
    pub owning_pids: Vec<u32>,
}
