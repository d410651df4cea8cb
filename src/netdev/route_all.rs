//! Host routing-table control for route-all mode.
//!
//! Enabling pins a host route to the hub's public address via the current
//! default gateway (so the tunnel does not swallow its own transport), then
//! replaces the default route with the VPN gateway. The prior default is
//! persisted to a JSON snapshot *before* the table is touched, so a crashed
//! process can still restore it; a failed snapshot write aborts the whole
//! operation. Both operations are idempotent, and any partially-applied
//! enable is rolled back before the error returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SNAPSHOT_FILE: &str = "route_snapshot.json";

#[derive(Debug)]
pub enum RouteError {
    /// Route-all is not implemented for this OS.
    Unsupported,
    /// The current default gateway could not be determined.
    NoDefaultRoute,
    /// Writing or reading the restore snapshot failed.
    Snapshot(String),
    /// A routing-table edit command failed.
    Command(String),
}

impl std::error::Error for RouteError {}

impl Display for RouteError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteError::Unsupported => "routing: unsupported platform".fmt(fmt),
            RouteError::NoDefaultRoute => "routing: no default route found".fmt(fmt),
            RouteError::Snapshot(e) => write!(fmt, "routing: snapshot: {}", e),
            RouteError::Command(e) => write!(fmt, "routing: {}", e),
        }
    }
}

/// Saved state needed to undo an enable, including across a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RouteSnapshot {
    prior_gateway: String,
    server_ip: String,
    vpn_gateway: String,
}

pub struct RouteController {
    snapshot_path: PathBuf,
}

impl RouteController {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            snapshot_path: data_dir.join(SNAPSHOT_FILE),
        }
    }

    /// True if a snapshot from a previous enable is on disk.
    pub fn is_enabled(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn enable_route_all(
        &self,
        vpn_gateway: Ipv4Addr,
        server_public_ip: Ipv4Addr,
    ) -> Result<(), RouteError> {
        if self.is_enabled() {
            tracing::debug!("route-all already enabled");
            return Ok(());
        }

        let prior_gateway = current_default_gateway()?;
        let snapshot = RouteSnapshot {
            prior_gateway: prior_gateway.clone(),
            server_ip: server_public_ip.to_string(),
            vpn_gateway: vpn_gateway.to_string(),
        };
        self.write_snapshot(&snapshot)?;

        if let Err(e) = add_host_route(&snapshot.server_ip, &prior_gateway) {
            let _ = std::fs::remove_file(&self.snapshot_path);
            return Err(e);
        }

        if let Err(e) = replace_default_route(&snapshot.vpn_gateway) {
            let _ = del_host_route(&snapshot.server_ip);
            let _ = std::fs::remove_file(&self.snapshot_path);
            return Err(e);
        }

        tracing::info!(
            "route-all enabled: default via {}, {} pinned via {}",
            vpn_gateway,
            server_public_ip,
            prior_gateway
        );
        Ok(())
    }

    pub fn disable_route_all(&self) -> Result<(), RouteError> {
        let snapshot = match self.read_snapshot()? {
            Some(s) => s,
            None => {
                tracing::debug!("route-all not enabled, nothing to restore");
                return Ok(());
            }
        };

        replace_default_route(&snapshot.prior_gateway)?;
        if let Err(e) = del_host_route(&snapshot.server_ip) {
            tracing::warn!("host route cleanup failed: {}", e);
        }
        std::fs::remove_file(&self.snapshot_path)
            .map_err(|e| RouteError::Snapshot(e.to_string()))?;

        tracing::info!("route-all disabled, default restored via {}", snapshot.prior_gateway);
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &RouteSnapshot) -> Result<(), RouteError> {
        if let Some(dir) = self.snapshot_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| RouteError::Snapshot(e.to_string()))?;
        }
        let json =
            serde_json::to_vec_pretty(snapshot).map_err(|e| RouteError::Snapshot(e.to_string()))?;
        std::fs::write(&self.snapshot_path, json)
            .map_err(|e| RouteError::Snapshot(e.to_string()))
    }

    fn read_snapshot(&self) -> Result<Option<RouteSnapshot>, RouteError> {
        match std::fs::read(&self.snapshot_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RouteError::Snapshot(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RouteError::Snapshot(e.to_string())),
        }
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, RouteError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| RouteError::Command(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RouteError::Command(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "linux")]
fn current_default_gateway() -> Result<String, RouteError> {
    let out = run("ip", &["route", "show", "default"])?;
    parse_linux_default_route(&out).ok_or(RouteError::NoDefaultRoute)
}

#[cfg(target_os = "linux")]
fn add_host_route(dst: &str, gateway: &str) -> Result<(), RouteError> {
    let dst_net = format!("{}/32", dst);
    run("ip", &["route", "replace", &dst_net, "via", gateway]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn del_host_route(dst: &str) -> Result<(), RouteError> {
    let dst_net = format!("{}/32", dst);
    run("ip", &["route", "del", &dst_net]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn replace_default_route(gateway: &str) -> Result<(), RouteError> {
    run("ip", &["route", "replace", "default", "via", gateway]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn current_default_gateway() -> Result<String, RouteError> {
    let out = run("route", &["-n", "get", "default"])?;
    parse_macos_default_route(&out).ok_or(RouteError::NoDefaultRoute)
}

#[cfg(target_os = "macos")]
fn add_host_route(dst: &str, gateway: &str) -> Result<(), RouteError> {
    run("route", &["-n", "add", "-host", dst, gateway]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn del_host_route(dst: &str) -> Result<(), RouteError> {
    run("route", &["-n", "delete", "-host", dst]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn replace_default_route(gateway: &str) -> Result<(), RouteError> {
    run("route", &["-n", "change", "default", gateway]).map(|_| ())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn current_default_gateway() -> Result<String, RouteError> {
    Err(RouteError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn add_host_route(_dst: &str, _gateway: &str) -> Result<(), RouteError> {
    Err(RouteError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn del_host_route(_dst: &str) -> Result<(), RouteError> {
    Err(RouteError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn replace_default_route(_gateway: &str) -> Result<(), RouteError> {
    Err(RouteError::Unsupported)
}

/// `ip route show default` → "default via 192.168.1.1 dev eth0 ..."
#[allow(dead_code)]
fn parse_linux_default_route(out: &str) -> Option<String> {
    let mut words = out.split_whitespace();
    while let Some(word) = words.next() {
        if word == "via" {
            return words.next().map(|s| s.to_string());
        }
    }
    None
}

/// `route -n get default` → lines including "    gateway: 192.168.1.1"
#[allow(dead_code)]
fn parse_macos_default_route(out: &str) -> Option<String> {
    for line in out.lines() {
        let line = line.trim();
        if let Some(gw) = line.strip_prefix("gateway:") {
            return Some(gw.trim().to_string());
        }
    }
    None
}
