//! Configuration types for the dnsveil proxy

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
///
/// The configuration file uses TOML format. The upstream section is the
/// only required part; everything else has working defaults. The running
/// proxy captures an immutable snapshot at start, so changing any of this
/// requires a stop/start cycle.
///
/// # Example Configuration
///
/// ```toml
/// [upstream]
/// url = "https://dns.example.com/dns-query"
///
/// [upstream.headers]
/// Authorization = ["Basic dXNlcjpwYXNz"]
///
/// [proxy]
/// leak_guard = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DoH upstream settings
    pub upstream: UpstreamConfig,

    /// Packet engine settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Event channel settings
    #[serde(default)]
    pub ipc: IpcConfig,
}

/// DoH upstream settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// DoH endpoint queries are POSTed to (required)
    pub url: String,

    /// Send only the DNS message instead of the whole IP/UDP datagram.
    ///
    /// RFC 8484 servers need this; the historical default feeds the raw
    /// datagram to an upstream that strips the headers itself.
    pub payload_only: bool,

    /// Extra HTTP headers attached to every request (multi-valued)
    pub headers: HashMap<String, Vec<String>>,
}

/// Packet engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Leak-guard helper location; defaults to `dnsunleak.exe` beside the
    /// proxy executable
    pub helper: Option<PathBuf>,

    /// Whether to run the leak guard at all
    pub leak_guard: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            helper: None,
            leak_guard: true,
        }
    }
}

/// Event channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Endpoint override (named pipe on Windows, Unix socket elsewhere)
    pub endpoint: Option<String>,

    /// Whether to serve the event channel
    pub enabled: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            return Err(Error::Config("upstream.url is required".into()));
        }

        if !self.upstream.url.starts_with("https://") && !self.upstream.url.starts_with("http://")
        {
            return Err(Error::Config(format!(
                "upstream.url must be an HTTP(S) URL, got {}",
                self.upstream.url
            )));
        }

        for (name, values) in &self.upstream.headers {
            let newline = |s: &String| s.contains('\n') || s.contains('\r');
            if newline(name) || values.iter().any(|v| newline(v)) {
                return Err(Error::Config(format!(
                    "header {} must not contain newlines",
                    name.escape_default()
                )));
            }
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# dnsveil configuration

[upstream]
# DoH endpoint queries are POSTed to (required)
url = "https://dns.example.com/dns-query"

# Send only the DNS message instead of the whole IP/UDP datagram.
# Enable this for RFC 8484 upstreams.
payload_only = false

# Extra HTTP headers attached to every request
[upstream.headers]
# Authorization = ["Basic dXNlcjpwYXNz"]

[proxy]
# Block port-53 traffic on other interfaces while the proxy runs
leak_guard = true

# Helper location override (defaults to dnsunleak.exe beside the binary)
# helper = "C:/Program Files/dnsveil/dnsunleak.exe"

[ipc]
# Serve lifecycle events to a UI over the local event channel
enabled = true

# Endpoint override (named pipe on Windows, Unix socket elsewhere)
# endpoint = "/run/dnsveil.sock"
"#
        .to_string()
    }
}
