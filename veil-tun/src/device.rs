//! TUN device abstraction layer
//!
//! A thin wrapper around `tun-rs` exposing the async read/write surface
//! the packet engine consumes. `tun-rs` handles the platform-specific
//! details of interface creation, address assignment and MTU
//! configuration; this module adds DNS server registration on top, since
//! the forwarder advertises the interface peer address as the system
//! resolver.

use crate::config::TunConfig;
use crate::error::{Error, Result};

/// Information about a TUN device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Interface name
    pub name: String,
    /// MTU
    pub mtu: u16,
}

/// Async TUN device wrapper
///
/// The underlying handle is closed when the device is dropped. A read
/// that is blocked inside the driver is not guaranteed to wake when the
/// last reference drops on every platform; callers that need prompt
/// shutdown must not wait on a pending read.
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    info: DeviceInfo,
}

impl TunDevice {
    /// Create a new TUN device with the given configuration
    ///
    /// Requires root on Linux/macOS and Administrator plus the WinTun
    /// driver on Windows. DNS servers listed in the configuration are
    /// registered on the new interface before this returns.
    pub async fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new();

        if let Some(ref name) = config.name {
            builder = builder.name(name);
        }

        if let Some(ref ipv4) = config.ipv4 {
            builder = builder.ipv4(ipv4.address, ipv4.prefix_len, ipv4.destination);
        }

        builder = builder.mtu(config.mtu);

        let device = builder
            .build_async()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        log::info!("Created TUN device: {} (MTU: {})", name, config.mtu);

        if !config.dns_servers.is_empty() {
            register_dns_servers(&name, &config.dns_servers)?;
        }

        Ok(Self {
            inner: device,
            info: DeviceInfo {
                name,
                mtu: config.mtu,
            },
        })
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the MTU
    pub fn mtu(&self) -> u16 {
        self.info.mtu
    }

    /// Get device information
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Read a packet from the TUN device
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.recv(buf).await.map_err(Error::Io)
    }

    /// Write a packet to the TUN device
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.send(buf).await.map_err(Error::Io)
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .finish()
    }
}

/// Register DNS servers on the interface
#[cfg(target_os = "windows")]
fn register_dns_servers(name: &str, servers: &[std::net::Ipv4Addr]) -> Result<()> {
    crate::windows::set_dns_servers(name, servers)
}

#[cfg(not(target_os = "windows"))]
fn register_dns_servers(name: &str, servers: &[std::net::Ipv4Addr]) -> Result<()> {
    // Only implemented on Windows; elsewhere the resolver configuration
    // has to point at the interface peer address by other means.
    log::warn!(
        "DNS registration not implemented on this platform; configure {:?} on {} manually",
        servers,
        name
    );
    Ok(())
}
