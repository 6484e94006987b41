//! Newline-delimited lookup protocol over TCP, UDP or Unix sockets.
//!
//! A request is a textual IP address terminated by `\n`; the answer is
//! `1\n`, `0\n`, or `error: invalid IP format\n`.
//!
//! Stream transports buffer partial lines across reads, so a request split
//! over several segments is still answered once, and several requests in one
//! segment are answered together with a single write. UDP takes each
//! datagram as one request.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::task::JoinSet;

use super::{ListenAddr, Shutdown, HIT, INVALID_IP, MISS};
use crate::{Error, RangeIndex, Result};

/// Longest request accepted without a line terminator. A textual IPv6
/// address is at most 45 bytes.
const MAX_LINE_LEN: usize = 64;

/// UDP payloads past this size are truncated (and therefore rejected).
const MAX_DATAGRAM_LEN: usize = 512;

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
    Unix(UnixListener, PathBuf),
}

/// Line-protocol server bound to one [`ListenAddr`].
pub struct LineServer {
    index: Arc<RangeIndex>,
    listener: Listener,
    addr: ListenAddr,
}

impl LineServer {
    /// Bind the listener without accepting anything yet.
    ///
    /// A stale Unix socket file left by a previous run is removed first.
    pub async fn bind(index: Arc<RangeIndex>, addr: &ListenAddr) -> Result<Self> {
        let bind_err = |source: io::Error| Error::Server {
            mode: "socket",
            addr: addr.to_string(),
            source,
        };

        let listener = match addr {
            ListenAddr::Tcp(host) => {
                Listener::Tcp(TcpListener::bind(host.as_str()).await.map_err(bind_err)?)
            }
            ListenAddr::Udp(host) => {
                Listener::Udp(Arc::new(UdpSocket::bind(host.as_str()).await.map_err(bind_err)?))
            }
            ListenAddr::Unix(path) => {
                remove_stale_socket(path).map_err(bind_err)?;
                Listener::Unix(UnixListener::bind(path).map_err(bind_err)?, path.clone())
            }
        };

        log::info!("Line server listening on {}", addr);
        Ok(Self {
            index,
            listener,
            addr: addr.clone(),
        })
    }

    /// The bound socket address, for TCP and UDP listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    /// Serve until an accept/receive error or shutdown.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<()> {
        let Self {
            index,
            listener,
            addr,
        } = self;
        let fail = |source: io::Error| Error::Server {
            mode: "socket",
            addr: addr.to_string(),
            source,
        };

        match listener {
            Listener::Tcp(listener) => loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted.map_err(fail)?;
                        let index = Arc::clone(&index);
                        tokio::spawn(async move {
                            if let Err(e) = handle_stream(&index, stream).await {
                                log::debug!("Line connection {} closed: {}", peer, e);
                            }
                        });
                    }
                }
            },
            Listener::Unix(listener, path) => {
                let result = loop {
                    tokio::select! {
                        _ = shutdown.recv() => break Ok(()),
                        accepted = listener.accept() => {
                            let (stream, _) = match accepted {
                                Ok(conn) => conn,
                                Err(e) => break Err(fail(e)),
                            };
                            let index = Arc::clone(&index);
                            tokio::spawn(async move {
                                if let Err(e) = handle_stream(&index, stream).await {
                                    log::debug!("Unix connection closed: {}", e);
                                }
                            });
                        }
                    }
                };
                drop(listener);
                let _ = std::fs::remove_file(&path);
                result?;
            }
            Listener::Udp(socket) => {
                let workers = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                let mut tasks = JoinSet::new();
                for _ in 0..workers {
                    tasks.spawn(udp_worker(Arc::clone(&socket), Arc::clone(&index)));
                }

                tokio::select! {
                    _ = shutdown.recv() => tasks.abort_all(),
                    Some(joined) = tasks.join_next() => {
                        tasks.abort_all();
                        joined?.map_err(fail)?;
                    }
                }
            }
        }

        log::info!("Line server on {} stopped", addr);
        Ok(())
    }
}

/// Remove a socket file left behind by a previous run. Anything that is not
/// a socket is left alone, so the bind fails instead.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Answer every complete line on a stream connection.
async fn handle_stream<S>(index: &RangeIndex, mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunk = [0u8; 512];
    let mut pending: Vec<u8> = Vec::with_capacity(MAX_LINE_LEN);
    let mut out: Vec<u8> = Vec::with_capacity(64);

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // Last request may lack its terminator
            if !pending.is_empty() {
                stream.write_all(answer(index, &pending)).await?;
            }
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        let mut start = 0;
        while let Some(pos) = pending[start..].iter().position(|&b| b == b'\n') {
            out.extend_from_slice(answer(index, &pending[start..start + pos]));
            start += pos + 1;
        }
        pending.drain(..start);

        if pending.len() > MAX_LINE_LEN {
            out.extend_from_slice(INVALID_IP);
            stream.write_all(&out).await?;
            return Ok(());
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }
}

async fn udp_worker(socket: Arc<UdpSocket>, index: Arc<RangeIndex>) -> io::Result<()> {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let msg = &buf[..n];
        let msg = msg.strip_suffix(b"\n").unwrap_or(msg);
        if let Err(e) = socket.send_to(answer(&index, msg), peer).await {
            log::debug!("UDP reply to {} failed: {}", peer, e);
        }
    }
}

/// Parse a textual IP address from raw request bytes.
pub(crate) fn parse_ip(raw: &[u8]) -> Option<IpAddr> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// The response for one request line.
pub(crate) fn answer(index: &RangeIndex, line: &[u8]) -> &'static [u8] {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match parse_ip(line) {
        Some(ip) if index.contains(ip) => HIT,
        Some(_) => MISS,
        None => INVALID_IP,
    }
}
