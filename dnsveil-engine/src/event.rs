//! Proxy state and observability hooks

use async_trait::async_trait;

use crate::error::Error;

/// Proxy run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// The proxy is not running
    Stopped,
    /// The TUN device is open and the pipeline is active
    Running,
}

impl ProxyState {
    /// Check if the proxy is running
    pub fn is_running(&self) -> bool {
        matches!(self, ProxyState::Running)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ProxyState::Stopped => "Stopped",
            ProxyState::Running => "Running",
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Observability hooks consumed by the packet engine
///
/// The hook set is fixed at start and shared by every pipeline task, so
/// implementations must tolerate concurrent invocation; per-query tasks
/// call them in parallel. All methods default to no-ops.
#[async_trait]
pub trait ProxyHooks: Send + Sync {
    /// Called exactly once per Stopped->Running or Running->Stopped transition
    async fn on_state_change(&self, running: bool) {
        let _ = running;
    }

    /// Called for each accepted query with its message ID and best-effort name
    async fn on_query(&self, msg_id: u16, qname: &str) {
        let _ = (msg_id, qname);
    }

    /// Informational messages (leak-guard output, engine progress)
    async fn on_info(&self, message: &str) {
        let _ = message;
    }

    /// Per-packet and lifecycle errors; the engine never raises these
    async fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

/// Hooks implementation that forwards everything to the `log` facade
pub struct LoggingHooks;

#[async_trait]
impl ProxyHooks for LoggingHooks {
    async fn on_state_change(&self, running: bool) {
        let state = if running {
            ProxyState::Running
        } else {
            ProxyState::Stopped
        };
        log::info!("proxy state: {}", state);
    }

    async fn on_query(&self, msg_id: u16, qname: &str) {
        log::debug!("query {:04x} {}", msg_id, qname);
    }

    async fn on_info(&self, message: &str) {
        log::info!("{}", message);
    }

    async fn on_error(&self, error: &Error) {
        log::error!("{}", error);
    }
}
