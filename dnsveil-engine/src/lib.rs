//! dnsveil engine
//!
//! This crate provides the core of the dnsveil DNS forwarder, reusable
//! by both the CLI and a GUI front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐    │
//! │  │   dnsveil-cli   │              │       GUI App       │    │
//! │  └────────┬────────┘              └──────────┬──────────┘    │
//! │           │                          events  │ (IPC)         │
//! │           └───────────────┬──────────────────┘               │
//! │                           ▼                                  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                   dnsveil-engine                       │  │
//! │  │  - Proxy (packet pipeline, TUN ownership)              │  │
//! │  │  - Transport (DoH upstream)                            │  │
//! │  │  - EventServer / EventClient (line-framed JSON IPC)    │  │
//! │  │  - leak-guard supervision                              │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//!                     ┌───────────────┐
//!                     │   veil-tun    │
//!                     │  TUN device   │
//!                     └───────────────┘
//! ```
//!
//! Data flow: TUN → reader → filter/dedup → per-query resolution →
//! writer → TUN. Control flow: a supervisor (the CLI, or a UI over the
//! event channel) starts and stops the [`proxy::Proxy`]; every layer
//! surfaces errors and state transitions through the
//! [`event::ProxyHooks`] callbacks.

pub mod config;
pub mod dedup;
pub mod doh;
pub mod error;
pub mod event;
pub mod ipc;
pub mod pool;
pub mod proxy;
pub mod unleak;
pub mod wire;

pub use config::{Config, IpcConfig, ProxyConfig, UpstreamConfig};
pub use doh::{HttpTransport, ResolveError, ResponseBody, Transport};
pub use error::{Error, Result};
pub use event::{LoggingHooks, ProxyHooks, ProxyState};
pub use ipc::{
    Event, EventClient, EventData, EventHandler, EventSender, EventServer, DEFAULT_ENDPOINT,
};
pub use proxy::{PacketDevice, Proxy, DNS_ADDR, TUN_LOCAL_ADDR, TUN_NAME};
