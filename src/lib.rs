//! ovpnctl - OpenVPN Control Library
//!
//! Async client for the OpenVPN management interface providing:
//! - Line transport over the local management socket
//! - Tag-based routing of management notifications
//! - A typed management protocol client (state, log, bytecount, hold, passwords)
//! - A connection orchestrator with hold-release handshake and connect timeout
//! - Bandwidth accounting

pub mod error;
pub mod config;
pub mod net;
pub mod vpn;

// Re-export commonly used types
pub use error::{OvpnError, OvpnResult};
pub use config::OvpnctlConfig;
pub use net::{LineTransport, MatchMode, MessageRouter, TransportEvent};
pub use vpn::{
    BandwidthUsage, ConnectParams, ConnectionEvent, ConnectionState, CredentialProvider,
    Credentials, LaunchMode, ManagementClient, ManagementSettings, OpenVpnConnection,
    OpenVpnLauncher, OrchestratorSettings, ProcessLauncher, ProtocolEvent, Secret,
    StaticCredentials,
};
