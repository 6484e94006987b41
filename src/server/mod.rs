//! Protocol front-ends over a shared [`RangeIndex`](crate::RangeIndex).
//!
//! - [`LineServer`]: newline-delimited lookups over TCP, UDP or Unix sockets
//! - [`HttpLiteServer`]: request-line-only HTTP/1.1 on raw TCP
//! - [`HttpFrameworkServer`]: axum router with preforked accept workers
//!
//! Every server is bound first (so bind failures surface before anything is
//! spawned) and then driven by `serve(shutdown)` until it fails or the
//! [`Shutdown`] signal fires.

pub mod http_framework;
pub mod http_lite;
pub mod line;

pub use http_framework::HttpFrameworkServer;
pub use http_lite::HttpLiteServer;
pub use line::LineServer;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::watch;

use crate::Error;

/// Answer for a contained address.
pub(crate) const HIT: &[u8] = b"1\n";
/// Answer for an address outside every range.
pub(crate) const MISS: &[u8] = b"0\n";
/// Answer for a request that is not an IP address.
pub(crate) const INVALID_IP: &[u8] = b"error: invalid IP format\n";

/// Normalize an HTTP base path so it starts and ends with `/`.
pub(crate) fn normalize_base_path(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Where a server listens, selected by address scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `tcp://host:port`, or a bare `host:port`
    Tcp(String),
    /// `udp://host:port`
    Udp(String),
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl ListenAddr {
    /// Get the scheme name of this address.
    pub fn scheme(&self) -> &'static str {
        match self {
            ListenAddr::Tcp(_) => "tcp",
            ListenAddr::Udp(_) => "udp",
            ListenAddr::Unix(_) => "unix",
        }
    }
}

/// An empty host (`:8080`) listens on every interface.
fn host_port(s: &str, original: &str) -> Result<String, Error> {
    if s.is_empty() || !s.contains(':') {
        return Err(Error::InvalidListenAddr(original.to_string()));
    }
    if s.starts_with(':') {
        Ok(format!("0.0.0.0{}", s))
    } else {
        Ok(s.to_string())
    }
}

impl FromStr for ListenAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("tcp://") {
            Ok(ListenAddr::Tcp(host_port(rest, s)?))
        } else if let Some(rest) = s.strip_prefix("udp://") {
            Ok(ListenAddr::Udp(host_port(rest, s)?))
        } else if let Some(rest) = s.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(Error::InvalidListenAddr(s.to_string()));
            }
            Ok(ListenAddr::Unix(PathBuf::from(rest)))
        } else if s.contains("://") {
            Err(Error::InvalidListenAddr(s.to_string()))
        } else {
            Ok(ListenAddr::Tcp(host_port(s, s)?))
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddr::Udp(addr) => write!(f, "udp://{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Sending half of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Ask every server holding a matching [`Shutdown`] to stop.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half of a shutdown signal; cheap to clone into every task.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Create a connected handle / signal pair.
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle(tx), Shutdown(rx))
    }

    /// Check whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// If the handle is dropped without signalling, this never resolves.
    pub async fn recv(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
