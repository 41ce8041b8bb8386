//! TUN device configuration

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// IPv4 address configuration for a TUN device
#[derive(Debug, Clone)]
pub struct Ipv4Config {
    /// The IPv4 address to assign to the interface
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
    /// Optional destination/peer address for point-to-point links
    pub destination: Option<Ipv4Addr>,
}

impl Ipv4Config {
    /// Create a new IPv4 configuration
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            destination: None,
        }
    }

    /// Set the destination/peer address
    pub fn with_destination(mut self, dest: Ipv4Addr) -> Self {
        self.destination = Some(dest);
        self
    }

    /// Get the network mask as an Ipv4Addr
    pub fn netmask(&self) -> Ipv4Addr {
        if self.prefix_len == 0 {
            return Ipv4Addr::new(0, 0, 0, 0);
        }
        if self.prefix_len >= 32 {
            return Ipv4Addr::new(255, 255, 255, 255);
        }
        let mask = !((1u32 << (32 - self.prefix_len)) - 1);
        Ipv4Addr::from(mask)
    }
}

/// Configuration for creating a TUN device
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (optional, auto-generated if not specified)
    pub name: Option<String>,
    /// IPv4 configuration
    pub ipv4: Option<Ipv4Config>,
    /// DNS servers to register on the interface after creation
    pub dns_servers: Vec<Ipv4Addr>,
    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            ipv4: None,
            dns_servers: Vec::new(),
            mtu: DEFAULT_MTU,
        }
    }
}

impl TunConfig {
    /// Create a new configuration builder
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let Some(ref ipv4) = self.ipv4 else {
            return Err(Error::Config(
                "an IPv4 address must be configured".into(),
            ));
        };

        if ipv4.prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                ipv4.prefix_len
            )));
        }

        if self.mtu < 68 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.mtu
            )));
        }

        Ok(())
    }
}

/// Builder for TunConfig
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    config: TunConfig,
}

impl TunConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the IPv4 address and prefix length
    pub fn ipv4(mut self, address: Ipv4Addr, prefix_len: u8) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address, prefix_len));
        self
    }

    /// Set the IPv4 address with a destination for point-to-point
    pub fn ipv4_with_dest(mut self, address: Ipv4Addr, prefix_len: u8, dest: Ipv4Addr) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address, prefix_len).with_destination(dest));
        self
    }

    /// Add a DNS server to register on the interface
    pub fn dns_server(mut self, server: Ipv4Addr) -> Self {
        self.config.dns_servers.push(server);
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
