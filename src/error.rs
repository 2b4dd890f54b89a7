//! Error types for ovpnctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OvpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Parse error (management lines, config files)
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Service error (OpenVPN process start / stop)
    #[error("Service error: {0}")]
    ServiceError(String),
    /// Management socket error
    #[error("Transport error: {0}")]
    Transport(String),
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// `>FATAL:` notification from OpenVPN
    #[error("{0}")]
    Fatal(String),
    /// Credentials were rejected by the server
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// OpenVPN reached CONNECTED but reported errors along the way
    #[error("Connected with errors")]
    ConnectedWithErrors,
    /// No TAP-Windows or WinTun adapter is installed
    #[error("TAP/WinTun drivers need to be installed on this system")]
    TapDriverInstallationRequired,
    /// The credential callback failed
    #[error("Failed to retrieve login credentials for this user ({0})")]
    CredentialsUnavailable(String),
    /// Process start reported an unusable management port
    #[error("Invalid port ({0}) returned when starting the OpenVPN process")]
    InvalidPort(i64),
}

impl OvpnError {
    /// True for errors caused by a connect attempt running out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, OvpnError::Timeout(_))
    }
}

impl From<toml::de::Error> for OvpnError {
    fn from(error: toml::de::Error) -> Self {
        OvpnError::ConfigError(error.to_string())
    }
}

impl From<serde_json::Error> for OvpnError {
    fn from(error: serde_json::Error) -> Self {
        OvpnError::ParseError(error.to_string())
    }
}

pub type OvpnResult<T> = Result<T, OvpnError>;
