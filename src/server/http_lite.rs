//! Minimal HTTP/1.1 front-end.
//!
//! This is deliberately not a conformant HTTP server. It understands exactly
//! one request shape, `GET <basePath><ip> HTTP/1.1`, reads nothing of the
//! request head beyond the request line (the remaining header lines are
//! skipped up to the blank line), and answers with a hand-built response:
//!
//! ```text
//! HTTP/1.1 200 OK
//! Server: rangegate
//! Content-Type: text/plain
//! Date: Mon, 02 Jan 2006 15:04:05 GMT
//! Content-Length: 2
//!
//! 1
//! ```
//!
//! There is no keep-alive negotiation, no chunked encoding and no other
//! method. Pipelined requests are answered in order: each request drains
//! exactly its own bytes from the connection buffer.

use chrono::Utc;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::line::parse_ip;
use super::{normalize_base_path, ListenAddr, Shutdown, HIT, INVALID_IP, MISS};
use crate::{Error, RangeIndex, Result};

/// Request heads larger than this are rejected.
const MAX_HEAD_LEN: usize = 8 * 1024;

/// Answer for anything that is not `GET <path> HTTP/1.x`.
const INVALID_REQUEST: &[u8] = b"error: invalid HTTP request\n";

const RFC1123: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, PartialEq, Eq)]
enum Parsed<'a> {
    /// The request head has not fully arrived yet.
    Incomplete,
    /// A GET request line; `consumed` covers the whole head.
    Request { path: &'a [u8], consumed: usize },
    /// Not a request this server understands.
    Malformed,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the path of `GET <path> HTTP/1.x` and the length of the head.
fn parse_request(buf: &[u8]) -> Parsed<'_> {
    let head_len = match find(buf, b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None => return Parsed::Incomplete,
    };
    let line_end = find(buf, b"\r\n").unwrap_or(head_len);

    let mut parts = buf[..line_end].split(|&b| b == b' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(b"GET"), Some(path), Some(version), None)
            if !path.is_empty() && version.starts_with(b"HTTP/1.") =>
        {
            Parsed::Request {
                path,
                consumed: head_len,
            }
        }
        _ => Parsed::Malformed,
    }
}

/// The address part of a request path: base path stripped, query dropped.
fn extract_ip(path: &[u8], base_path: &[u8]) -> Option<IpAddr> {
    let rest = path.strip_prefix(base_path)?;
    let rest = match rest.iter().position(|&b| b == b'?') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    parse_ip(rest)
}

fn write_response(out: &mut Vec<u8>, body: &[u8]) {
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\nServer: rangegate\r\n");
    out.extend_from_slice(b"Content-Type: text/plain\r\nDate: ");
    // Writes into a Vec cannot fail
    let _ = write!(out, "{}", Utc::now().format(RFC1123));
    let _ = write!(out, "\r\nContent-Length: {}\r\n\r\n", body.len());
    out.extend_from_slice(body);
}

/// Per-connection parse state.
///
/// `inbound` holds received bytes not yet consumed by a request, `outbound`
/// the responses for the current read. Both are cleared rather than
/// reallocated, so a long-lived connection stops allocating once the buffers
/// have grown to fit its requests.
#[derive(Debug)]
struct HttpCodec {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

impl HttpCodec {
    fn new() -> Self {
        Self {
            inbound: Vec::with_capacity(1024),
            outbound: Vec::with_capacity(256),
        }
    }

    /// Answer every complete request in `inbound` into `outbound`, then drain
    /// exactly the bytes those requests occupied.
    fn process(&mut self, index: &RangeIndex, base_path: &[u8]) -> Flow {
        let mut consumed = 0;

        let flow = loop {
            match parse_request(&self.inbound[consumed..]) {
                Parsed::Incomplete => {
                    if self.inbound.len() - consumed > MAX_HEAD_LEN {
                        self.outbound.extend_from_slice(INVALID_REQUEST);
                        break Flow::Close;
                    }
                    break Flow::Continue;
                }
                Parsed::Malformed => {
                    self.outbound.extend_from_slice(INVALID_REQUEST);
                    break Flow::Close;
                }
                Parsed::Request { path, consumed: len } => {
                    match extract_ip(path, base_path) {
                        Some(ip) if index.contains(ip) => write_response(&mut self.outbound, HIT),
                        Some(_) => write_response(&mut self.outbound, MISS),
                        None => self.outbound.extend_from_slice(INVALID_IP),
                    }
                    consumed += len;
                }
            }
        };

        self.inbound.drain(..consumed);
        flow
    }

    fn reset(&mut self) {
        self.outbound.clear();
    }
}

/// Request-line-only HTTP server over one TCP listener.
pub struct HttpLiteServer {
    index: Arc<RangeIndex>,
    listener: TcpListener,
    base_path: Arc<[u8]>,
    addr: ListenAddr,
}

impl HttpLiteServer {
    /// Bind a TCP listener. `base_path` is normalized to start and end
    /// with `/`.
    pub async fn bind(index: Arc<RangeIndex>, addr: &ListenAddr, base_path: &str) -> Result<Self> {
        let host = match addr {
            ListenAddr::Tcp(host) => host,
            other => return Err(Error::InvalidListenAddr(other.to_string())),
        };
        let listener = TcpListener::bind(host.as_str())
            .await
            .map_err(|source| Error::Server {
                mode: "http",
                addr: addr.to_string(),
                source,
            })?;

        let base_path = normalize_base_path(base_path);
        log::info!("HTTP (lite) server listening on {}{}", addr, base_path);
        Ok(Self {
            index,
            listener,
            base_path: Arc::from(base_path.into_bytes()),
            addr: addr.clone(),
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until an accept error or shutdown.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|source| Error::Server {
                        mode: "http",
                        addr: self.addr.to_string(),
                        source,
                    })?;
                    let _ = stream.set_nodelay(true);
                    let index = Arc::clone(&self.index);
                    let base_path = Arc::clone(&self.base_path);
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(&index, &base_path, stream).await {
                            log::debug!("HTTP connection {} closed: {}", peer, e);
                        }
                    });
                }
            }
        }

        log::info!("HTTP (lite) server on {} stopped", self.addr);
        Ok(())
    }
}

async fn handle_conn(
    index: &RangeIndex,
    base_path: &[u8],
    mut stream: TcpStream,
) -> io::Result<()> {
    let mut codec = HttpCodec::new();
    loop {
        if stream.read_buf(&mut codec.inbound).await? == 0 {
            return Ok(());
        }

        let flow = codec.process(index, base_path);
        if !codec.outbound.is_empty() {
            stream.write_all(&codec.outbound).await?;
        }
        codec.reset();

        if flow == Flow::Close {
            return stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Arc<RangeIndex> {
        let nets = ["10.0.0.0/24".parse().unwrap(), "192.168.1.5/32".parse().unwrap()];
        Arc::new(RangeIndex::build(&nets))
    }

    fn body_of(response: &[u8]) -> &[u8] {
        let start = find(response, b"\r\n\r\n").unwrap() + 4;
        &response[start..]
    }

    #[test]
    fn test_parse_request_line() {
        let req = b"GET /10.0.0.1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(
            parse_request(req),
            Parsed::Request {
                path: b"/10.0.0.1",
                consumed: req.len()
            }
        );
    }

    #[test]
    fn test_parse_incomplete_and_malformed() {
        assert_eq!(parse_request(b"GET /10.0.0.1 HTTP/1.1\r\nHost: x\r\n"), Parsed::Incomplete);
        assert_eq!(parse_request(b""), Parsed::Incomplete);
        assert_eq!(parse_request(b"POST /1.1.1.1 HTTP/1.1\r\n\r\n"), Parsed::Malformed);
        assert_eq!(parse_request(b"GET /1.1.1.1\r\n\r\n"), Parsed::Malformed);
        assert_eq!(parse_request(b"GET /1.1.1.1 SPDY/3\r\n\r\n"), Parsed::Malformed);
    }

    #[test]
    fn test_extract_ip() {
        assert_eq!(extract_ip(b"/10.0.0.1", b"/"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip(b"/check/::1", b"/check/"), Some("::1".parse().unwrap()));
        assert_eq!(extract_ip(b"/check/8.8.8.8?x=1", b"/check/"), Some("8.8.8.8".parse().unwrap()));
        assert_eq!(extract_ip(b"/other/8.8.8.8", b"/check/"), None);
        assert_eq!(extract_ip(b"/not-an-ip", b"/"), None);
    }

    #[test]
    fn test_response_layout() {
        let mut out = Vec::new();
        write_response(&mut out, HIT);
        let text = String::from_utf8(out.clone()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains(" GMT\r\n"));
        assert_eq!(body_of(&out), b"1\n");

        let date_line = text.lines().find(|l| l.starts_with("Date: ")).unwrap();
        let date = date_line[6..].replace("GMT", "+0000");
        assert!(chrono::DateTime::parse_from_rfc2822(&date).is_ok());
    }

    #[test]
    fn test_codec_pipelined_requests() {
        let index = index();
        let mut codec = HttpCodec::new();
        codec.inbound.extend_from_slice(b"GET /10.0.0.1 HTTP/1.1\r\n\r\n");
        codec
            .inbound
            .extend_from_slice(b"GET /192.168.1.6 HTTP/1.1\r\nHost: a\r\n\r\nGET /192.168");

        assert_eq!(codec.process(&index, b"/"), Flow::Continue);
        let out = String::from_utf8(codec.outbound.clone()).unwrap();
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("\r\n\r\n1\n"));
        assert!(out.ends_with("\r\n\r\n0\n"));
        // Only the unfinished third request is left
        assert_eq!(codec.inbound, b"GET /192.168");

        codec.reset();
        assert!(codec.outbound.is_empty());

        codec.inbound.extend_from_slice(b".1.5 HTTP/1.1\r\n\r\n");
        assert_eq!(codec.process(&index, b"/"), Flow::Continue);
        assert_eq!(body_of(&codec.outbound), b"1\n");
        assert!(codec.inbound.is_empty());
    }

    #[test]
    fn test_codec_invalid_ip_continues() {
        let index = index();
        let mut codec = HttpCodec::new();
        codec
            .inbound
            .extend_from_slice(b"GET /not-an-ip HTTP/1.1\r\n\r\nGET /10.0.0.9 HTTP/1.1\r\n\r\n");

        assert_eq!(codec.process(&index, b"/"), Flow::Continue);
        assert!(codec.outbound.starts_with(INVALID_IP));
        assert_eq!(body_of(&codec.outbound[INVALID_IP.len()..]), b"1\n");
    }

    #[test]
    fn test_codec_malformed_closes() {
        let index = index();
        let mut codec = HttpCodec::new();
        codec.inbound.extend_from_slice(b"DELETE / HTTP/1.1\r\n\r\n");
        assert_eq!(codec.process(&index, b"/"), Flow::Close);
        assert_eq!(codec.outbound, INVALID_REQUEST);
    }

    #[test]
    fn test_codec_oversized_head_closes() {
        let index = index();
        let mut codec = HttpCodec::new();
        codec.inbound.extend(std::iter::repeat(b'x').take(MAX_HEAD_LEN + 1));
        assert_eq!(codec.process(&index, b"/"), Flow::Close);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let server = HttpLiteServer::bind(index(), &"127.0.0.1:0".parse().unwrap(), "/lookup")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (_handle, shutdown) = Shutdown::new();
        tokio::spawn(server.serve(shutdown));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /lookup/10.0.0.200 HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let mut got = Vec::new();
        while find(&got, b"\r\n\r\n").map_or(true, |end| got.len() < end + 6) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            got.extend_from_slice(&buf[..n]);
        }
        assert!(got.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&got), b"1\n");

        stream
            .write_all(b"GET /lookup/bogus HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut err = vec![0u8; INVALID_IP.len()];
        stream.read_exact(&mut err).await.unwrap();
        assert_eq!(err, INVALID_IP);
    }
}
