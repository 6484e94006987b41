//! Routed HTTP front-end on axum.
//!
//! Prefork is done in-process: `workers` listeners are bound to the same
//! address with `SO_REUSEPORT`, so the kernel spreads incoming connections
//! across independent accept loops. Each loop serves the same router, which
//! holds a clone of the endpoint's `Arc<RangeIndex>`.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;

use super::{normalize_base_path, ListenAddr, Shutdown};
use crate::{Error, RangeIndex, Result};

/// How long in-flight requests may run after shutdown is requested.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: u32 = 1024;

/// `GET <basePath>:ip` handler. Unparseable input answers `0`.
async fn lookup(State(index): State<Arc<RangeIndex>>, Path(ip): Path<String>) -> &'static str {
    match ip.parse::<IpAddr>() {
        Ok(ip) if index.contains(ip) => "1",
        _ => "0",
    }
}

/// Build the lookup router for a base path.
pub fn router(index: Arc<RangeIndex>, base_path: &str) -> Router {
    let route = format!("{}:ip", normalize_base_path(base_path));
    Router::new().route(&route, get(lookup)).with_state(index)
}

fn reuseport_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// axum server with several accept workers sharing one address.
pub struct HttpFrameworkServer {
    router: Router,
    listeners: Vec<TcpListener>,
    addr: ListenAddr,
    grace_period: Duration,
}

impl HttpFrameworkServer {
    /// Bind `workers` listeners (at least one) to `addr`.
    ///
    /// With port 0 the first listener picks the port and the rest join it.
    pub async fn bind(
        index: Arc<RangeIndex>,
        addr: &ListenAddr,
        base_path: &str,
        workers: usize,
    ) -> Result<Self> {
        let host = match addr {
            ListenAddr::Tcp(host) => host,
            other => return Err(Error::InvalidListenAddr(other.to_string())),
        };
        let bind_err = |source: io::Error| Error::Server {
            mode: "http",
            addr: addr.to_string(),
            source,
        };

        let requested = tokio::net::lookup_host(host.as_str())
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| Error::InvalidListenAddr(addr.to_string()))?;

        let first = reuseport_listener(requested).map_err(bind_err)?;
        let bound = first.local_addr().map_err(bind_err)?;
        let mut listeners = vec![first];
        for _ in 1..workers.max(1) {
            listeners.push(reuseport_listener(bound).map_err(bind_err)?);
        }

        log::info!(
            "HTTP (framework) server listening on {} with {} workers",
            bound,
            listeners.len()
        );
        Ok(Self {
            router: router(index, base_path),
            listeners,
            addr: addr.clone(),
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    /// Override the shutdown grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.first().and_then(|l| l.local_addr().ok())
    }

    /// Number of accept workers.
    pub fn workers(&self) -> usize {
        self.listeners.len()
    }

    /// Run every worker until one fails or shutdown is requested.
    pub async fn serve(self, shutdown: Shutdown) -> Result<()> {
        let fail = |source: io::Error| Error::Server {
            mode: "http",
            addr: self.addr.to_string(),
            source,
        };

        let mut workers = JoinSet::new();
        for listener in self.listeners {
            let app = self.router.clone();
            let mut signal = shutdown.clone();
            workers.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { signal.recv().await })
                    .await
            });
        }

        let mut signal = shutdown;
        tokio::select! {
            _ = signal.recv() => {}
            Some(joined) = workers.join_next() => {
                // A worker stopped without being asked to
                workers.abort_all();
                joined?.map_err(fail)?;
                return Ok(());
            }
        }

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                joined?.map_err(fail)?;
            }
            Ok::<(), Error>(())
        };
        let drained = tokio::time::timeout(self.grace_period, drain).await;
        match drained {
            Ok(result) => result?,
            Err(_) => {
                log::warn!(
                    "HTTP (framework) server on {} did not drain within {:?}, aborting",
                    self.addr,
                    self.grace_period
                );
                workers.abort_all();
            }
        }

        log::info!("HTTP (framework) server on {} stopped", self.addr);
        Ok(())
    }
}
