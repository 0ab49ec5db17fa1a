use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bincode::{Decode, Encode};

use crate::error::Error;

/// An opaque network path between two endpoints.
///
/// Paths come from the path-selection layer. This crate stores, compares and
/// forwards them but never interprets their content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Path {
    /// Stable identifier of the path.
    pub fingerprint: String,
    /// Hop identifiers, in forwarding order.
    pub hops: Vec<String>,
    /// Path MTU as advertised by the path-selection layer.
    pub mtu: u16,
}

impl Path {
    /// Creates a path with the given fingerprint and no metadata.
    pub fn new(fingerprint: impl Into<String>) -> Path {
        Path {
            fingerprint: fingerprint.into(),
            hops: Vec::new(),
            mtu: 0,
        }
    }

    /// Sets the hop list.
    pub fn with_hops<I, S>(mut self, hops: I) -> Path
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hops = hops.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the MTU.
    pub fn with_mtu(mut self, mtu: u16) -> Path {
        self.mtu = mtu;
        self
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// An endpoint: host and port, optionally pinned to a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Address {
    /// Host and port of the endpoint.
    pub host: SocketAddr,
    /// The path pinned on this address, if any.
    pub path: Option<Path>,
}

impl Address {
    /// Creates an address without a path.
    pub fn new(host: SocketAddr) -> Address {
        Address { host, path: None }
    }

    /// Returns a copy of this address pinned to `path`.
    pub fn with_path(mut self, path: Path) -> Address {
        self.path = Some(path);
        self
    }

    /// True when no path is pinned.
    pub fn has_path(&self) -> bool {
        self.path.is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} via {}", self.host, path),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parses a literal `ip:port` (or `[ipv6]:port`). No name resolution.
    fn from_str(s: &str) -> Result<Address, Error> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Address::new)
            .map_err(|_| Error::AddressParse(s.to_string()))
    }
}

impl From<SocketAddr> for Address {
    fn from(host: SocketAddr) -> Address {
        Address::new(host)
    }
}
