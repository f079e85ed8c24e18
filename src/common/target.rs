//! Target address parsed from a tunnel handshake

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Where a session is asked to connect.
///
/// Exactly one textual form exists per target (the `Display` impl); it is
/// what gets logged and what gets dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// IP socket address (IPv4 or IPv6, with port)
    Socket(SocketAddr),
    /// Domain name with port, resolved at dial time
    Domain(String, u16),
}

impl Target {
    /// Build a domain target, validating the name length (1..=255 bytes).
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > 255 {
            return Err(Error::BadHandshake(format!(
                "domain length {} out of range",
                name.len()
            )));
        }
        Ok(Target::Domain(name, port))
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Target::Socket(SocketAddr::new(ip, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Target::Socket(addr) => addr.port(),
            Target::Domain(_, port) => *port,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            Target::Socket(addr) => addr.ip().to_string(),
            Target::Domain(name, _) => name.clone(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Target::Domain(_, _))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Socket(addr) => write!(f, "{}", addr),
            Target::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::Socket(addr)
    }
}
