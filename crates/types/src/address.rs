//! Concrete server addresses.
//!
//! An [`Address`] is what a resolver produces and what a subchannel connects
//! to. Equality is structural, so two resolutions that name the same endpoint
//! produce equal addresses and map onto the same subchannel.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ensure};

use crate::error::{AddressError, InvalidPortSnafu, MalformedSnafu};

/// Port used when a target names a host without one.
pub const DEFAULT_PORT: u16 = 443;

/// A concrete endpoint a subchannel can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    /// A TCP endpoint. `host` is an IP literal or a hostname.
    Tcp {
        /// Host name or IP literal, without brackets.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// A Unix domain socket.
    Unix {
        /// Filesystem path of the socket, relative or absolute.
        path: String,
    },
}

impl Address {
    /// Creates a TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp { host: host.into(), port }
    }

    /// Creates a Unix domain socket address.
    pub fn unix(path: impl Into<String>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Returns true for TCP addresses.
    #[must_use]
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Returns the socket address when the host is an IP literal.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { host, port } => {
                host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, *port))
            },
            Self::Unix { .. } => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp { host: addr.ip().to_string(), port: addr.port() }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}", HostPort::new(host.clone(), Some(*port))),
            Self::Unix { path } => write!(f, "unix:{path}"),
        }
    }
}

/// A host with an optional port, as written in a target.
///
/// Parsing accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6
/// literals such as `::1` (which never carry a port).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Host without brackets.
    pub host: String,
    /// Port, when one was written.
    pub port: Option<u16>,
}

impl HostPort {
    /// Creates a host/port pair.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self { host: host.into(), port }
    }

    /// Parses a `host[:port]` string.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Malformed`] for an empty host or an
    /// unterminated bracket, and [`AddressError::InvalidPort`] when the port
    /// is not a valid `u16`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if let Some(rest) = input.strip_prefix('[') {
            let close = rest
                .find(']')
                .context(MalformedSnafu { input, message: "unterminated '['" })?;
            let host = &rest[..close];
            ensure!(!host.is_empty(), MalformedSnafu { input, message: "empty host" });
            let after = &rest[close + 1..];
            let port = match after {
                "" => None,
                _ => {
                    let digits = after
                        .strip_prefix(':')
                        .context(MalformedSnafu { input, message: "junk after ']'" })?;
                    Some(parse_port(input, digits)?)
                },
            };
            return Ok(Self::new(host, port));
        }

        match input.matches(':').count() {
            0 => {
                ensure!(!input.is_empty(), MalformedSnafu { input, message: "empty host" });
                Ok(Self::new(input, None))
            },
            1 => {
                let (host, digits) = input.split_once(':').unwrap_or((input, ""));
                ensure!(!host.is_empty(), MalformedSnafu { input, message: "empty host" });
                Ok(Self::new(host, Some(parse_port(input, digits)?)))
            },
            // Several colons and no brackets: a bare IPv6 literal.
            _ => Ok(Self::new(input, None)),
        }
    }

    /// Converts to an [`Address`], filling in `default_port` when absent.
    #[must_use]
    pub fn into_address(self, default_port: u16) -> Address {
        Address::Tcp { port: self.port.unwrap_or(default_port), host: self.host }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracket = self.host.contains(':');
        match (bracket, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{port}", self.host),
            (true, None) => write!(f, "[{}]", self.host),
            (false, Some(port)) => write!(f, "{}:{port}", self.host),
            (false, None) => f.write_str(&self.host),
        }
    }
}

fn parse_port(input: &str, digits: &str) -> Result<u16, AddressError> {
    digits.parse::<u16>().ok().context(InvalidPortSnafu { input })
}
