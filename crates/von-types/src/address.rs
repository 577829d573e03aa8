//! Peer addresses.
//!
//! An [`Address`] is the identity key of a peer: two peers are the same peer
//! exactly when host and port match.

use crate::error::VonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Port used when a `von://` URL does not name one.
pub const DEFAULT_PORT: u16 = 8181;

/// URL scheme accepted by [`Address::from_str`].
const URL_SCHEME: &str = "von://";

/// Network address of a peer (host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The address a peer should dial to reach a socket bound at `addr`.
    ///
    /// Unspecified bind addresses (`0.0.0.0`, `::`) are replaced by loopback.
    pub fn advertised_for(addr: SocketAddr) -> Self {
        let ip = if addr.ip().is_unspecified() {
            match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            }
        } else {
            addr.ip()
        };
        Self::new(ip.to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = VonError;

    /// Parse `host:port` or `von://host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (rest, is_url) = match s.strip_prefix(URL_SCHEME) {
            Some(rest) => (rest.trim_end_matches('/'), true),
            None if s.contains("://") => {
                return Err(VonError::InvalidAddress(format!(
                    "unsupported scheme in '{s}', expected von://"
                )))
            }
            None => (s, false),
        };

        let (host, port) = split_host_port(rest);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(VonError::InvalidAddress(format!("missing host in '{s}'")));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| VonError::InvalidAddress(format!("invalid port in '{s}'")))?,
            None if is_url => DEFAULT_PORT,
            None => {
                return Err(VonError::InvalidAddress(format!(
                    "missing port in '{s}'"
                )))
            }
        };
        if port == 0 {
            return Err(VonError::InvalidAddress(format!("port 0 in '{s}'")));
        }

        Ok(Self::new(host, port))
    }
}

/// Split `host:port`, `[v6]:port`, `host` or `[v6]` into host and optional port.
fn split_host_port(s: &str) -> (&str, Option<&str>) {
    if s.starts_with('[') {
        return match s.find(']') {
            Some(end) => {
                let host = &s[..=end];
                match s[end + 1..].strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => (host, None),
                }
            }
            None => (s, None),
        };
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (s, None),
    }
}
