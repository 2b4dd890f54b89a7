//! OpenVPN Module for ovpnctl
//!
//! Everything needed to drive a local OpenVPN process through its management
//! interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   OpenVpnConnection (orchestrator)  │ ──> ProcessLauncher (spawns openvpn)
//! └──────────────┬──────────────────────┘
//!                │ ProtocolEvent
//! ┌──────────────┴──────────────────────┐
//! │   ManagementClient (protocol)       │ ──> CredentialProvider
//! └──────────────┬──────────────────────┘
//!                │ lines
//! ┌──────────────┴──────────────────────┐
//! │   LineTransport + MessageRouter     │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use libovpnctl::config::OvpnctlConfig;
//! use libovpnctl::vpn::{ConnectParams, LaunchMode, OpenVpnConnection, OpenVpnLauncher, OrchestratorSettings};
//! use std::sync::Arc;
//!
//! # async fn example() -> libovpnctl::OvpnResult<()> {
//! let config = OvpnctlConfig::default();
//! let launcher = Arc::new(OpenVpnLauncher::new(config.openvpn.clone()));
//! let connection = OpenVpnConnection::new(OrchestratorSettings::from(&config), launcher, None);
//!
//! let mut events = connection.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! connection
//!     .connect(ConnectParams::new("vpn.example.com", LaunchMode::ConfigFile("/etc/openvpn/client.ovpn".into())))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod common;
pub mod connection;
pub mod credentials;
pub mod launcher;
pub mod management;
pub mod protocol;

pub use bandwidth::BandwidthUsage;
pub use connection::{ConnectParams, ConnectionEvent, ConnectionState, OpenVpnConnection, OrchestratorSettings};
pub use credentials::{CredentialProvider, Credentials, Secret, StaticCredentials};
pub use launcher::{LaunchMode, LaunchOutcome, LaunchParams, OpenVpnLauncher, ProcessLauncher};
pub use management::{ManagementClient, ManagementSettings};
pub use protocol::{OvpnState, ProtocolEvent};
