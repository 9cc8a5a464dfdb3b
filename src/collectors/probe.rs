use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};

use super::PortProbe;
use crate::error::ControlError;

/// Probes a port by binding it on `addr` and releasing it immediately.
pub struct TcpBindProbe {
    addr: IpAddr,
}

impl TcpBindProbe {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }
}

impl PortProbe for TcpBindProbe {
    fn is_in_use(&self, port: u16) -> Result<bool, ControlError> {
        match TcpListener::bind(SocketAddr::new(self.addr, port)) {
            Ok(listener) => {
                drop(listener);
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(true),
            Err(e) => Err(ControlError::from_io(format!("bind {}:{}", self.addr, port), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn detects_bound_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let probe = TcpBindProbe::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(probe.is_in_use(port).unwrap());
        drop(held);
        assert!(!probe.is_in_use(port).unwrap());
    }
}
