//! TUN device management for the dnsveil DNS forwarder
//!
//! This crate provides a thin async wrapper around the `tun-rs` crate for
//! the one device shape dnsveil needs: a point-to-point IPv4 interface
//! whose peer address is advertised to the operating system as a DNS
//! server.
//!
//! # Platform Requirements
//!
//! ## Windows
//! - Administrator privileges
//! - WinTun driver installed (<https://www.wintun.net/>)
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! # Example
//!
//! ```ignore
//! use veil_tun::{TunDevice, TunConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TunConfig::builder()
//!         .name("tun0")
//!         .ipv4_with_dest("192.0.2.43".parse()?, 24, "192.0.2.42".parse()?)
//!         .dns_server("192.0.2.42".parse()?)
//!         .mtu(1500)
//!         .build()?;
//!
//!     let device = TunDevice::create(config).await?;
//!
//!     let mut buf = vec![0u8; 1500];
//!     let n = device.read(&mut buf).await?;
//!     println!("Received {} bytes", n);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;

#[cfg(target_os = "windows")]
pub mod windows;

pub use config::{TunConfig, TunConfigBuilder};
pub use device::TunDevice;
pub use error::{Error, Result};

/// Default MTU for TUN devices
pub const DEFAULT_MTU: u16 = 1500;
