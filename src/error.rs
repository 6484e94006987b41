//! Error types for rangegate.

use thiserror::Error;

/// Error type for rangegate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV source error
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    /// Source download error
    #[error("download error: {0}")]
    Download(String),

    /// Source entry that does not parse as an address or CIDR
    #[error("invalid prefix on line {line}: {entry}")]
    InvalidPrefix { line: usize, entry: String },

    /// Unknown source format name
    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),

    /// Listen address without a known scheme
    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A protocol server stopped with an error
    #[error("{mode} server on {addr} failed: {source}")]
    Server {
        mode: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A background task panicked or was cancelled
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias for rangegate operations.
pub type Result<T> = std::result::Result<T, Error>;
