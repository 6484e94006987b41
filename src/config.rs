//! Endpoint configuration.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::server::ListenAddr;
use crate::source::SourceFormat;
use crate::{Error, Result};

/// Documented default configuration, printed by `rangegate default-config`.
pub const DEFAULT_CONFIG: &str = r#"# rangegate configuration
log_level: info

endpoints:
  - name: blocklist
    # Local path or http(s):// URL; gzip-compressed sources are detected
    file: /etc/rangegate/blocklist.txt
    # text: one address or CIDR per line, '#' comments
    # csv: the first field of every record
    file_format: text
    # Re-fetch period in seconds, 0 disables periodic reload
    reload_interval_secs: 300
    # Any of: http, socket
    modes: [http, socket]
    # lite: hand-rolled request-line parser, framework: axum with preforked workers
    http_impl: lite
    http_listener: 0.0.0.0:8080
    http_base_path: /
    http_workers: 4
    # tcp://host:port, udp://host:port or unix:///path
    socket_listener: unix:///tmp/rangegate.sock
"#;

/// Protocol front-end enabled on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// HTTP lookups, served by the endpoint's [`HttpImpl`].
    Http,
    /// Newline-delimited socket protocol.
    Socket,
}

impl Mode {
    /// Get the config name of this mode.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Http => "http",
            Mode::Socket => "socket",
        }
    }
}

/// HTTP implementation used for [`Mode::Http`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpImpl {
    /// Minimal request-line parser on raw TCP.
    #[default]
    Lite,
    /// Routed axum server with preforked accept workers.
    Framework,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Endpoints to serve.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// One named endpoint: a range source plus the front-ends serving it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub name: String,
    /// Source locator: a local path or an `http(s)://` URL.
    pub file: String,
    #[serde(default)]
    pub file_format: SourceFormat,
    /// Seconds between re-fetches; 0 disables periodic reload.
    #[serde(default)]
    pub reload_interval_secs: u64,
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub http_impl: HttpImpl,
    #[serde(default)]
    pub http_listener: Option<String>,
    #[serde(default = "default_base_path")]
    pub http_base_path: String,
    /// Accept workers for the framework HTTP server.
    #[serde(default = "default_http_workers")]
    pub http_workers: usize,
    #[serde(default)]
    pub socket_listener: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_http_workers() -> usize {
    4
}

impl Config {
    /// The documented default configuration as YAML.
    pub fn default_yaml() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every endpoint and check that names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate endpoint name: {}",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }
}

impl EndpointConfig {
    /// Create an endpoint with defaults for everything but the source.
    pub fn new(name: &str, file: &str) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            file_format: SourceFormat::default(),
            reload_interval_secs: 0,
            modes: Vec::new(),
            http_impl: HttpImpl::default(),
            http_listener: None,
            http_base_path: default_base_path(),
            http_workers: default_http_workers(),
            socket_listener: None,
        }
    }

    /// Validate this endpoint on its own.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(format!("{} for endpoint {}", msg, self.name)));

        if self.name.trim().is_empty() {
            return Err(Error::Config("endpoint name is required".to_string()));
        }
        if self.file.trim().is_empty() {
            return fail("file is required");
        }
        if self.modes.is_empty() {
            return fail("at least one mode is required");
        }
        if self.http_workers == 0 {
            return fail("http_workers must be >= 1");
        }

        let mut seen = HashSet::new();
        for mode in &self.modes {
            if !seen.insert(*mode) {
                return fail(&format!("mode {} listed twice", mode.name()));
            }
        }

        if self.modes.contains(&Mode::Http) {
            match self.http_addr()? {
                Some(ListenAddr::Tcp(_)) => {}
                Some(_) => return fail("http_listener must be a TCP address"),
                None => return fail("http_listener is required for http mode"),
            }
        }
        if self.modes.contains(&Mode::Socket) && self.socket_addr()?.is_none() {
            return fail("socket_listener is required for socket mode");
        }
        Ok(())
    }

    /// Parsed HTTP listen address, if configured.
    pub fn http_addr(&self) -> Result<Option<ListenAddr>> {
        self.http_listener.as_deref().map(str::parse).transpose()
    }

    /// Parsed socket listen address, if configured.
    pub fn socket_addr(&self) -> Result<Option<ListenAddr>> {
        self.socket_listener.as_deref().map(str::parse).transpose()
    }

    /// Periodic reload interval, `None` when disabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}
