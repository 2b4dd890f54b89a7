//! Configuration management for ovpnctl

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{OvpnError, OvpnResult};

/// Main ovpnctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OvpnctlConfig {
    /// OpenVPN process settings
    #[serde(default)]
    pub openvpn: OpenVpnSettings,
    /// Connect / shutdown timing
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Bandwidth sampling
    #[serde(default)]
    pub bandwidth: BandwidthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnSettings {
    /// OpenVPN executable
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Address the management interface binds to
    #[serde(default = "default_management_host")]
    pub management_host: String,
    /// First port tried for the management interface
    #[serde(default = "default_port_range_start")]
    pub management_port_start: u16,
    /// One past the last port tried for the management interface
    #[serde(default = "default_port_range_end")]
    pub management_port_end: u16,
    /// Directory holding the management password file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// `--ping` interval (seconds)
    #[serde(default = "default_ping")]
    pub ping: u32,
    /// `--ping-exit` timeout (seconds)
    #[serde(default = "default_ping_exit")]
    pub ping_exit: u32,
    /// Extra arguments appended verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Time allowed between hold release and CONNECTED (seconds)
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Upper bound on the orderly SIGTERM shutdown (milliseconds)
    #[serde(default = "default_shutdown_wait_ms")]
    pub shutdown_wait_ms: u64,
    /// Poll interval while waiting for shutdown (milliseconds)
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    /// Delay between a credential command and its null flush (milliseconds)
    #[serde(default = "default_credential_settle_ms")]
    pub credential_settle_ms: u64,
    /// `bytecount` notification interval (seconds)
    #[serde(default = "default_bytecount_interval_secs")]
    pub bytecount_interval_secs: u32,
    /// Bound on opening the management socket (seconds)
    #[serde(default = "default_management_connect_secs")]
    pub management_connect_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSettings {
    /// Minimum window over which per-second rates are computed (milliseconds)
    #[serde(default = "default_min_sample_ms")]
    pub min_sample_ms: u64,
}

fn default_binary() -> String {
    "openvpn".to_string()
}

fn default_management_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_range_start() -> u16 {
    30000
}

fn default_port_range_end() -> u16 {
    40000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/ovpnctl")
}

fn default_ping() -> u32 {
    10
}

fn default_ping_exit() -> u32 {
    30
}

fn default_connect_secs() -> u64 {
    60
}

fn default_shutdown_wait_ms() -> u64 {
    10_000
}

fn default_shutdown_poll_ms() -> u64 {
    100
}

fn default_credential_settle_ms() -> u64 {
    200
}

fn default_bytecount_interval_secs() -> u32 {
    1
}

fn default_management_connect_secs() -> u64 {
    10
}

fn default_min_sample_ms() -> u64 {
    1000
}

impl Default for OpenVpnSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            management_host: default_management_host(),
            management_port_start: default_port_range_start(),
            management_port_end: default_port_range_end(),
            state_dir: default_state_dir(),
            ping: default_ping(),
            ping_exit: default_ping_exit(),
            extra_args: Vec::new(),
        }
    }
}

impl OpenVpnSettings {
    pub fn management_port_range(&self) -> Range<u16> {
        self.management_port_start..self.management_port_end
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            shutdown_wait_ms: default_shutdown_wait_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            credential_settle_ms: default_credential_settle_ms(),
            bytecount_interval_secs: default_bytecount_interval_secs(),
            management_connect_secs: default_management_connect_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    pub fn credential_settle(&self) -> Duration {
        Duration::from_millis(self.credential_settle_ms)
    }

    pub fn management_connect(&self) -> Duration {
        Duration::from_secs(self.management_connect_secs)
    }
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            min_sample_ms: default_min_sample_ms(),
        }
    }
}

impl BandwidthSettings {
    pub fn min_sample(&self) -> Duration {
        Duration::from_millis(self.min_sample_ms)
    }
}

impl OvpnctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> OvpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| OvpnError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| OvpnError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> OvpnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| OvpnError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| OvpnError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject settings the connection logic cannot work with
    pub fn validate(&self) -> OvpnResult<()> {
        if !crate::vpn::common::is_valid_ip(&self.openvpn.management_host) {
            return Err(OvpnError::ConfigError(format!(
                "management_host must be an IP address, got {}",
                self.openvpn.management_host
            )));
        }
        if self.openvpn.management_port_range().is_empty() {
            return Err(OvpnError::ConfigError(format!(
                "Empty management port range {}..{}",
                self.openvpn.management_port_start, self.openvpn.management_port_end
            )));
        }
        if self.timeouts.shutdown_poll_ms == 0 {
            return Err(OvpnError::ConfigError("shutdown_poll_ms must be greater than 0".to_string()));
        }
        if self.timeouts.bytecount_interval_secs == 0 {
            return Err(OvpnError::ConfigError("bytecount_interval_secs must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Ensure the state directory exists
    pub fn ensure_directories(&self) -> OvpnResult<()> {
        std::fs::create_dir_all(&self.openvpn.state_dir)
            .map_err(|e| OvpnError::ConfigError(format!("Failed to create directory {:?}: {}", self.openvpn.state_dir, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OvpnctlConfig::default();
        assert_eq!(config.openvpn.binary, "openvpn");
        assert_eq!(config.timeouts.connect(), Duration::from_secs(60));
        assert_eq!(config.timeouts.shutdown_wait(), Duration::from_secs(10));
        assert_eq!(config.timeouts.shutdown_poll(), Duration::from_millis(100));
        assert_eq!(config.bandwidth.min_sample(), Duration::from_secs(1));
        assert_eq!(config.openvpn.management_port_range(), 30000..40000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: OvpnctlConfig = toml::from_str("[timeouts]\nconnect_secs = 5\n").unwrap();
        assert_eq!(config.timeouts.connect_secs, 5);
        assert_eq!(config.timeouts.credential_settle_ms, 200);
        assert_eq!(config.openvpn.management_host, "127.0.0.1");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ovpnctl.toml");

        let mut config = OvpnctlConfig::default();
        config.openvpn.ping_exit = 45;
        config.openvpn.extra_args = vec!["--verb".to_string(), "4".to_string()];
        config.save(&path).unwrap();

        let loaded = OvpnctlConfig::load(&path).unwrap();
        assert_eq!(loaded.openvpn.ping_exit, 45);
        assert_eq!(loaded.openvpn.extra_args, vec!["--verb", "4"]);
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[openvpn]\nmanagement_port_start = 4000\nmanagement_port_end = 4000\n").unwrap();

        let err = tokio_test::assert_err!(OvpnctlConfig::load(&path));
        assert!(matches!(err, OvpnError::ConfigError(_)));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = OvpnctlConfig::default();
        tokio_test::assert_ok!(config.validate());

        config.timeouts.shutdown_poll_ms = 0;
        tokio_test::assert_err!(config.validate());

        config.timeouts.shutdown_poll_ms = 100;
        config.timeouts.bytecount_interval_secs = 0;
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_management_host_must_be_ip() {
        let mut config = OvpnctlConfig::default();
        config.openvpn.management_host = "localhost".to_string();
        tokio_test::assert_err!(config.validate());

        config.openvpn.management_host = "::1".to_string();
        tokio_test::assert_ok!(config.validate());
    }
}
