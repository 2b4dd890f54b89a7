use crate::error::{OvpnError, OvpnResult};
use rand::Rng;
use std::net::TcpListener;
use std::ops::Range;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Process and filesystem helpers shared by the launcher and the CLI

/// How many random ports to probe before giving up
const PORT_PROBE_ATTEMPTS: usize = 64;

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which")
        .arg(binary)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Get the version of a binary by running it with --version
pub async fn get_binary_version(binary: &str) -> OvpnResult<String> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|e| OvpnError::ServiceError(format!("Failed to get {} version: {}", binary, e)))?;

    // openvpn --version exits with status 1 after printing its banner
    let version_output = String::from_utf8_lossy(&output.stdout);
    match version_output.lines().next() {
        Some(line) if !line.trim().is_empty() => Ok(line.trim().to_string()),
        _ => Err(OvpnError::ServiceError(format!(
            "{} --version printed nothing: {}",
            binary,
            String::from_utf8_lossy(&output.stderr)
        ))),
    }
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> OvpnResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| OvpnError::ServiceError(format!("Failed to create directory {:?}: {}", path, e)))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write a file that only the owner can read
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> OvpnResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, content)
        .await
        .map_err(|e| OvpnError::ServiceError(format!("Failed to write {:?}: {}", path, e)))?;

    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(|e| OvpnError::ServiceError(format!("Failed to set permissions on {:?}: {}", path, e)))?;

    debug!("Wrote {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Delete a file if it exists
pub async fn delete_config_file(path: &Path) -> OvpnResult<()> {
    if path.exists() {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| OvpnError::ServiceError(format!("Failed to delete {:?}: {}", path, e)))?;
        debug!("Deleted {:?}", path);
    }
    Ok(())
}

/// Pick a port in `range` that nothing is listening on right now
pub fn pick_management_port(host: &str, range: Range<u16>) -> OvpnResult<u16> {
    if range.is_empty() {
        return Err(OvpnError::ConfigError(format!("Empty management port range {:?}", range)));
    }

    let mut rng = rand::thread_rng();
    for _ in 0..PORT_PROBE_ATTEMPTS {
        let port = rng.gen_range(range.clone());
        if TcpListener::bind((host, port)).is_ok() {
            debug!("Selected management port {}", port);
            return Ok(port);
        }
    }

    Err(OvpnError::ServiceError(format!(
        "No free management port found in {}..{} after {} attempts",
        range.start, range.end, PORT_PROBE_ATTEMPTS
    )))
}

/// Validate an IP address (v4 or v6)
pub fn is_valid_ip(addr: &str) -> bool {
    addr.parse::<std::net::IpAddr>().is_ok()
}
