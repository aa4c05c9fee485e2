//! Listen address grammar.
//!
//! An address string that starts with `unix:` names a Unix domain socket
//! path; anything else is a TCP host that is joined with the configured port.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Case-sensitive prefix selecting the Unix socket transport.
pub const UNIX_PREFIX: &str = "unix:";

/// Transport kind and concrete address to bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ListenAddress {
    /// `host:port`, where port `0` asks the OS for an ephemeral port.
    Tcp { addr: String },
    /// Filesystem path of a Unix domain socket.
    Unix { path: PathBuf },
}

impl ListenAddress {
    /// Resolve the configured address and port strings.
    ///
    /// The port is ignored for Unix sockets.
    pub fn resolve(address: &str, port: &str) -> Self {
        address.strip_prefix(UNIX_PREFIX).map_or_else(
            || Self::Tcp {
                addr: format!("{address}:{port}"),
            },
            |path| Self::Unix {
                path: PathBuf::from(path),
            },
        )
    }

    /// Returns the socket path when the address uses the Unix transport.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::Unix { path } => Some(path),
            Self::Tcp { .. } => None,
        }
    }

    /// Short transport name for logs.
    pub const fn transport(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix { .. } => "unix",
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { addr } => write!(f, "tcp://{addr}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Address a listener actually ended up bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    /// Bound TCP socket; the port is the real one even when `0` was requested.
    Tcp(SocketAddr),
    /// Bound Unix socket path.
    Unix(PathBuf),
}

impl BoundAddress {
    /// Text reported to the host on start: the numeric port for TCP,
    /// the socket path otherwise.
    pub fn host_label(&self) -> String {
        match self {
            Self::Tcp(addr) => addr.port().to_string(),
            Self::Unix(path) => path.display().to_string(),
        }
    }

    /// TCP port, if any.
    pub const fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(addr) => Some(addr.port()),
            Self::Unix(_) => None,
        }
    }
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
