//! rangegate - A low-latency IP range membership service.
//!
//! This crate answers one question as fast as possible: is this IP address
//! inside any of a (possibly large) set of CIDR ranges? Each configured
//! endpoint loads its ranges from a file or URL, keeps them in a
//! hot-reloadable index and serves lookups over several protocols.
//!
//! # Features
//!
//! - **Prefix trie**: IPv4 and IPv6 containment in at most 32/128 steps
//! - **Hot reload**: Replace the whole range set without blocking readers
//! - **Line protocol**: Newline-delimited lookups over TCP, UDP and Unix sockets
//! - **HTTP**: A minimal request-line server and an axum-based one
//! - **Remote sources**: Download with ETag support and gzip decompression
//!
//! # Quick Start
//!
//! ```
//! use rangegate::RangeIndex;
//!
//! let index = RangeIndex::build(&[
//!     "10.0.0.0/24".parse().unwrap(),
//!     "2001:db8::/32".parse().unwrap(),
//! ]);
//!
//! assert!(index.contains("10.0.0.42".parse().unwrap()));
//! assert!(index.contains("2001:db8::1".parse().unwrap()));
//! assert!(!index.contains("10.0.1.0".parse().unwrap()));
//! ```
//!
//! # Serving
//!
//! ```ignore
//! use rangegate::{Config, Shutdown};
//!
//! let config = Config::from_file("rangegate.yaml")?;
//! let (handle, shutdown) = Shutdown::new();
//!
//! // Every endpoint runs until `handle.shutdown()` is called
//! let outcomes = rangegate::serve_all(config.endpoints, shutdown).await;
//! ```
//!
//! # Protocols
//!
//! - **socket**: send `1.2.3.4\n`, receive `1\n` or `0\n`
//! - **http**: `GET <base_path><ip>` answers `1` or `0` in a text/plain body
//!
//! Input that is not an IP address is answered with
//! `error: invalid IP format\n` on the line protocol.

mod error;

pub mod config;
pub mod endpoint;
pub mod index;
pub mod server;
pub mod source;

pub use config::{Config, EndpointConfig, HttpImpl, Mode, DEFAULT_CONFIG};
pub use endpoint::{serve_all, Endpoint, RunningEndpoint};
pub use error::{Error, Result};
pub use index::{PrefixTrie, RangeIndex};
pub use server::{
    HttpFrameworkServer, HttpLiteServer, LineServer, ListenAddr, Shutdown, ShutdownHandle,
};
pub use source::{FetchOutcome, SourceFetcher, SourceFormat};
