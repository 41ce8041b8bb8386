//! Error types for the dnsveil engine

use thiserror::Error;

use crate::doh::ResolveError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the packet engine and the event channel
///
/// Nothing here crosses a task boundary: every error is delivered through
/// the error hook and the offending packet or frame is dropped. The only
/// conditions that end a running proxy without an explicit stop are a TUN
/// read EOF and a device-open failure at start.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error (open or configuration)
    #[error("TUN error: {0}")]
    Tun(#[from] veil_tun::Error),

    /// TUN read error
    #[error("tun read error: {0}")]
    TunRead(#[source] veil_tun::Error),

    /// TUN write error
    #[error("tun write error: {0}")]
    TunWrite(#[source] veil_tun::Error),

    /// DoH resolution failure for a single query
    #[error("resolve: {msg_id:04x} {source}")]
    Resolve {
        msg_id: u16,
        #[source]
        source: ResolveError,
    },

    /// Response body read failure for a single query
    #[error("read DNS response: {0}")]
    ResponseRead(#[source] ResolveError),

    /// Leak-guard helper failure (the proxy keeps running)
    #[error("cannot start dnsunleak: {0}")]
    LeakGuard(String),

    /// Event channel error
    #[error("IPC error: {0}")]
    Ipc(String),
}
