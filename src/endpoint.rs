//! Endpoint orchestration.
//!
//! An endpoint owns one [`RangeIndex`], the protocol servers that query it,
//! and the loop that periodically re-fetches its source:
//! - Initial load failures are fatal to the endpoint
//! - Reload failures are logged and the last good index stays live
//! - A server failure is logged immediately; its siblings keep serving

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{EndpointConfig, HttpImpl, Mode};
use crate::server::{HttpFrameworkServer, HttpLiteServer, LineServer, Shutdown};
use crate::source::{FetchOutcome, SourceFetcher};
use crate::{Error, RangeIndex, Result};

/// A protocol server bound and ready to serve.
enum BoundServer {
    Line(LineServer),
    HttpLite(HttpLiteServer),
    HttpFramework(HttpFrameworkServer),
}

impl BoundServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundServer::Line(s) => s.local_addr(),
            BoundServer::HttpLite(s) => s.local_addr(),
            BoundServer::HttpFramework(s) => s.local_addr(),
        }
    }

    async fn serve(self, shutdown: Shutdown) -> Result<()> {
        match self {
            BoundServer::Line(s) => s.serve(shutdown).await,
            BoundServer::HttpLite(s) => s.serve(shutdown).await,
            BoundServer::HttpFramework(s) => s.serve(shutdown).await,
        }
    }
}

/// Starts endpoints from their configuration.
///
/// # Example
///
/// ```ignore
/// use rangegate::{Endpoint, EndpointConfig, Shutdown};
///
/// let (handle, shutdown) = Shutdown::new();
/// let running = Endpoint::start(config, shutdown).await?;
/// println!("serving {} prefixes", running.index().len());
/// running.wait().await?;
/// ```
pub struct Endpoint;

impl Endpoint {
    /// Load the source, build the index, bind every configured server and
    /// spawn them, plus the reload loop when an interval is set.
    ///
    /// A server that fails to bind is logged and reported by
    /// [`RunningEndpoint::wait`] while its siblings keep serving. Starting
    /// fails only when no server could be bound.
    pub async fn start(config: EndpointConfig, shutdown: Shutdown) -> Result<RunningEndpoint> {
        config.validate()?;
        log::info!(
            "Starting endpoint {} (modes: {:?})",
            config.name,
            config.modes.iter().map(Mode::name).collect::<Vec<_>>()
        );

        let mut fetcher = SourceFetcher::new(&config.file, config.file_format);
        log::debug!("Fetching {} for endpoint {}", config.file, config.name);
        let (fetcher, prefixes) = tokio::task::spawn_blocking(move || {
            let prefixes = fetcher.load();
            (fetcher, prefixes)
        })
        .await?;
        let prefixes = prefixes?;

        let index = Arc::new(RangeIndex::build(&prefixes));
        log::info!(
            "Endpoint {} loaded {} prefixes from {}",
            config.name,
            index.len(),
            config.file
        );

        // A bind failure only takes down that one server
        let mut addrs = Vec::with_capacity(config.modes.len());
        let mut servers = JoinSet::new();
        let mut bind_error = None;
        for mode in &config.modes {
            let mode = *mode;
            match bind_mode(mode, &config, Arc::clone(&index)).await {
                Ok(server) => {
                    addrs.push((mode, server.local_addr()));
                    let shutdown = shutdown.clone();
                    servers.spawn(async move { (mode, server.serve(shutdown).await) });
                }
                Err(e) => {
                    log::error!(
                        "Endpoint {} {} server failed to bind: {}",
                        config.name,
                        mode.name(),
                        e
                    );
                    bind_error.get_or_insert(e);
                }
            }
        }
        let bind_error = match bind_error {
            Some(e) if servers.is_empty() => return Err(e),
            other => other,
        };

        let reloader = config.reload_interval().map(|period| {
            tokio::spawn(reload_loop(
                config.name.clone(),
                fetcher,
                Arc::clone(&index),
                period,
                shutdown.clone(),
            ))
        });

        Ok(RunningEndpoint {
            name: config.name,
            index,
            addrs,
            servers,
            bind_error,
            reloader,
        })
    }

    /// Start an endpoint and wait for all of its servers to stop.
    pub async fn serve(config: EndpointConfig, shutdown: Shutdown) -> Result<()> {
        Self::start(config, shutdown).await?.wait().await
    }
}

async fn bind_mode(
    mode: Mode,
    config: &EndpointConfig,
    index: Arc<RangeIndex>,
) -> Result<BoundServer> {
    let missing = |what: &str| {
        Error::Config(format!("{} is required for endpoint {}", what, config.name))
    };

    match mode {
        Mode::Socket => {
            let addr = config.socket_addr()?.ok_or_else(|| missing("socket_listener"))?;
            Ok(BoundServer::Line(LineServer::bind(index, &addr).await?))
        }
        Mode::Http => {
            let addr = config.http_addr()?.ok_or_else(|| missing("http_listener"))?;
            match config.http_impl {
                HttpImpl::Lite => Ok(BoundServer::HttpLite(
                    HttpLiteServer::bind(index, &addr, &config.http_base_path).await?,
                )),
                HttpImpl::Framework => Ok(BoundServer::HttpFramework(
                    HttpFrameworkServer::bind(
                        index,
                        &addr,
                        &config.http_base_path,
                        config.http_workers,
                    )
                    .await?,
                )),
            }
        }
    }
}

/// Re-fetch the source every `period` and publish it into `index`.
///
/// The first fetch happens one period after start. A failed fetch keeps the
/// current index.
async fn reload_loop(
    name: String,
    mut fetcher: SourceFetcher,
    index: Arc<RangeIndex>,
    period: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::task::spawn_blocking(move || {
            let outcome = fetcher.fetch();
            (fetcher, outcome)
        })
        .await;
        let outcome = match fetched {
            Ok((returned, outcome)) => {
                fetcher = returned;
                outcome
            }
            Err(e) => {
                log::error!("Reload task for endpoint {} failed: {}", name, e);
                return;
            }
        };

        match outcome {
            Ok(FetchOutcome::Updated(prefixes)) => {
                index.reload(&prefixes);
                log::info!("Endpoint {} reloaded {} prefixes", name, index.len());
            }
            Ok(FetchOutcome::NotModified) => {
                log::debug!("Endpoint {} source unchanged", name);
            }
            Err(e) => {
                log::warn!(
                    "Reload of endpoint {} failed, keeping current ranges: {}",
                    name,
                    e
                );
            }
        }
    }
}

/// A started endpoint.
pub struct RunningEndpoint {
    name: String,
    index: Arc<RangeIndex>,
    addrs: Vec<(Mode, Option<SocketAddr>)>,
    servers: JoinSet<(Mode, Result<()>)>,
    bind_error: Option<Error>,
    reloader: Option<JoinHandle<()>>,
}

impl RunningEndpoint {
    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The index shared by every server of this endpoint.
    pub fn index(&self) -> &Arc<RangeIndex> {
        &self.index
    }

    /// Bound socket address of the server for `mode` (TCP/UDP only).
    pub fn local_addr(&self, mode: Mode) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|(m, _)| *m == mode)
            .and_then(|(_, addr)| *addr)
    }

    /// Wait until every server has stopped.
    ///
    /// Server failures are logged as they happen; the first one is returned.
    /// A server that failed to bind at start counts as the first failure.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = self.bind_error.take();

        while let Some(joined) = self.servers.join_next().await {
            let (mode, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    log::error!("Endpoint {} server task failed: {}", self.name, e);
                    first_error.get_or_insert(Error::Task(e));
                    continue;
                }
            };
            if let Err(e) = result {
                log::error!("Endpoint {} {} server stopped: {}", self.name, mode.name(), e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(reloader) = self.reloader.take() {
            reloader.abort();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run every endpoint concurrently until they all stop.
///
/// One endpoint failing (to start or while serving) is logged and does not
/// affect the others. Returns each endpoint's outcome by name.
pub async fn serve_all(
    endpoints: Vec<EndpointConfig>,
    shutdown: Shutdown,
) -> Vec<(String, Result<()>)> {
    let mut tasks = JoinSet::new();
    for config in endpoints {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let name = config.name.clone();
            (name, Endpoint::serve(config, shutdown).await)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, result)) => {
                match &result {
                    Ok(()) => log::info!("Endpoint {} stopped", name),
                    Err(e) => log::error!("Endpoint {} failed: {}", name, e),
                }
                outcomes.push((name, result));
            }
            Err(e) => log::error!("Endpoint task failed: {}", e),
        }
    }
    outcomes
}
