//! Windows-specific TUN device functionality
//!
//! Windows TUN support requires the WinTun driver to be installed.
//! Download from: https://www.wintun.net/

use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::{Error, Result};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{
    GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

/// Check if WinTun driver is installed
pub fn is_wintun_installed() -> bool {
    // Check for wintun.dll in system32 or alongside the executable
    let system_path = std::path::Path::new(r"C:\Windows\System32\wintun.dll");
    let local_path = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("wintun.dll")));

    system_path.exists() || local_path.is_some_and(|p| p.exists())
}

/// Register static DNS servers on an interface using netsh
///
/// The first server becomes the primary resolver, the rest are appended.
/// Windows starts routing stub-resolver queries to the interface as soon
/// as netsh returns.
pub fn set_dns_servers(name: &str, servers: &[Ipv4Addr]) -> Result<()> {
    let Some((primary, rest)) = servers.split_first() else {
        return Ok(());
    };

    let output = Command::new("netsh")
        .args([
            "interface",
            "ipv4",
            "set",
            "dnsservers",
            name,
            "static",
            &primary.to_string(),
            "primary",
            "no",
        ])
        .output()
        .map_err(|e| Error::Config(format!("failed to run netsh: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Config(format!(
            "netsh set dnsservers failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    for server in rest {
        let output = Command::new("netsh")
            .args([
                "interface",
                "ipv4",
                "add",
                "dnsservers",
                name,
                &server.to_string(),
                "validate=no",
            ])
            .output()
            .map_err(|e| Error::Config(format!("failed to run netsh: {}", e)))?;

        if !output.status.success() {
            log::warn!(
                "netsh add dnsservers {} failed: {}",
                server,
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    log::info!("Registered DNS servers on {}: {:?}", name, servers);
    Ok(())
}

/// Check if running with administrator privileges using Windows API
pub fn is_admin() -> bool {
    unsafe {
        let mut token_handle: HANDLE = std::ptr::null_mut();
        let process_handle = GetCurrentProcess();

        if OpenProcessToken(process_handle, TOKEN_QUERY, &mut token_handle) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut return_length: u32 = 0;

        let result = GetTokenInformation(
            token_handle,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );

        CloseHandle(token_handle);

        result != 0 && elevation.TokenIsElevated != 0
    }
}

/// Check admin privileges
///
/// Returns Ok(()) if running as admin, an error otherwise.
pub fn ensure_admin() -> Result<()> {
    if is_admin() {
        return Ok(());
    }

    Err(Error::PermissionDenied(
        "Administrator privileges required. Please run as Administrator.".into(),
    ))
}
