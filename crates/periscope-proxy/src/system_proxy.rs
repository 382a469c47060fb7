//! System-wide proxy registration.
//!
//! Pointing the OS at the local listener is a platform capability, not core
//! logic, so it sits behind a trait the lifecycle takes by injection. The
//! platform implementation shells out to the same tools a user would:
//! the WinINet registry keys on Windows, `networksetup` on macOS,
//! `gsettings` on Linux. Registration failures are reported to the caller,
//! which logs and continues; interception still works for clients
//! configured manually.

use std::process::Command;

use crate::error::SystemProxyError;

/// Registers the system-wide proxy pointer.
pub trait SystemProxyConfigurator: Send + Sync {
    /// Points the OS proxy configuration at `address` (`host:port`).
    fn set_system_proxy(&self, address: &str) -> Result<(), SystemProxyError>;
}

/// Does nothing. For tests and platforms the user manages themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSystemProxy;

impl SystemProxyConfigurator for NoopSystemProxy {
    fn set_system_proxy(&self, address: &str) -> Result<(), SystemProxyError> {
        tracing::debug!(address, "system proxy registration skipped");
        Ok(())
    }
}

/// Registers the proxy through the current platform's mechanism.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformSystemProxy;

impl SystemProxyConfigurator for PlatformSystemProxy {
    fn set_system_proxy(&self, address: &str) -> Result<(), SystemProxyError> {
        set_platform_proxy(address)
    }
}

#[cfg(target_os = "windows")]
fn set_platform_proxy(address: &str) -> Result<(), SystemProxyError> {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let ps_script = format!(
        r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 1
        Set-ItemProperty -Path $regPath -Name ProxyServer -Value '{}'
        Set-ItemProperty -Path $regPath -Name ProxyOverride -Value '<local>'
        "#,
        address
    );

    let output = Command::new("powershell")
        .args([
            "-NoProfile",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            &ps_script,
        ])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| SystemProxyError::CommandFailed(e.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SystemProxyError::CommandFailed(stderr.trim().to_string()))
    }
}

#[cfg(target_os = "macos")]
fn set_platform_proxy(address: &str) -> Result<(), SystemProxyError> {
    let (host, port) = split_address(address)?;

    let service = active_network_service()
        .ok_or_else(|| SystemProxyError::CommandFailed("no active network service".into()))?;

    for args in [
        vec!["-setwebproxy", service.as_str(), host.as_str(), port.as_str()],
        vec!["-setsecurewebproxy", service.as_str(), host.as_str(), port.as_str()],
        vec!["-setwebproxystate", service.as_str(), "on"],
        vec!["-setsecurewebproxystate", service.as_str(), "on"],
    ] {
        let output = Command::new("networksetup")
            .args(&args)
            .output()
            .map_err(|e| SystemProxyError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SystemProxyError::CommandFailed(stderr.trim().to_string()));
        }
    }

    Ok(())
}

#[cfg(target_os = "macos")]
fn active_network_service() -> Option<String> {
    let output = Command::new("networksetup")
        .args(["-listallnetworkservices"])
        .output()
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for service in ["Wi-Fi", "Ethernet"] {
        if stdout.contains(service) {
            return Some(service.to_string());
        }
    }

    stdout
        .lines()
        .skip(1)
        .find(|line| !line.starts_with('*'))
        .map(|s| s.to_string())
}

#[cfg(target_os = "linux")]
fn set_platform_proxy(address: &str) -> Result<(), SystemProxyError> {
    let (host, port) = split_address(address)?;

    let mode = Command::new("gsettings")
        .args(["set", "org.gnome.system.proxy", "mode", "manual"])
        .output()
        .map_err(|e| SystemProxyError::CommandFailed(e.to_string()))?;
    if !mode.status.success() {
        let stderr = String::from_utf8_lossy(&mode.stderr);
        return Err(SystemProxyError::CommandFailed(stderr.trim().to_string()));
    }

    for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
        let _ = Command::new("gsettings")
            .args(["set", schema, "host", host.as_str()])
            .output();
        let _ = Command::new("gsettings")
            .args(["set", schema, "port", port.as_str()])
            .output();
    }

    Ok(())
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn set_platform_proxy(_address: &str) -> Result<(), SystemProxyError> {
    Err(SystemProxyError::Unsupported)
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn split_address(address: &str) -> Result<(String, String), SystemProxyError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SystemProxyError::CommandFailed(format!("malformed address {address}")))?;
    Ok((host.to_string(), port.to_string()))
}
