//! TCP addressing, dialing and binding.
//!
//! # Example
//!
//! ```
//! use peerwire::transport::Target;
//!
//! let target: Target = "127.0.0.1:8000".parse().unwrap();
//! assert_eq!(target.port, 8000);
//!
//! // A bare port means localhost.
//! let target: Target = "9000".parse().unwrap();
//! assert_eq!(target.to_string(), "127.0.0.1:9000");
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{PeerwireError, Result};

/// Host used when a target names only a port.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// A TCP endpoint to dial or bind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port. `0` asks the OS for a free port when binding.
    pub port: u16,
}

impl Target {
    /// Create a target from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `127.0.0.1` with the given port.
    pub fn localhost(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Target {
    type Err = PeerwireError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(Target::localhost(port));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerwireError::InvalidTarget(format!("{s:?} has no port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| PeerwireError::InvalidTarget(format!("bad port in {s:?}")))?;
        if host.is_empty() {
            return Ok(Target::localhost(port));
        }
        Ok(Target::new(host, port))
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::new(addr.ip().to_string(), addr.port())
    }
}

impl From<u16> for Target {
    fn from(port: u16) -> Self {
        Target::localhost(port)
    }
}

impl From<(&str, u16)> for Target {
    fn from((host, port): (&str, u16)) -> Self {
        Target::new(host, port)
    }
}

/// Open a TCP connection to `target` with Nagle disabled.
pub async fn connect(target: &Target) -> Result<TcpStream> {
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    stream.set_nodelay(true)?;
    debug!(%target, "tcp connected");
    Ok(stream)
}

/// Bind a listener on `target`.
pub async fn bind(target: &Target) -> Result<TcpListener> {
    let listener = TcpListener::bind((target.host.as_str(), target.port)).await?;
    debug!(%target, local = ?listener.local_addr().ok(), "tcp listening");
    Ok(listener)
}
